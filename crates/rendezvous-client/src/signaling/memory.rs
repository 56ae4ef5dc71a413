//! An in-process rendezvous server.
//!
//! [`MemoryRendezvous`] keeps offers, answers and candidates in memory and hands out one
//! [`MemorySignaling`] session per peer name. Offer lifetimes follow the Tokio clock so
//! paused-time tests can expire them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    CandidateRole, CandidatesAdded, DiscoverResult, DiscoveredOffer, PollBatch, PolledAnswer,
    PublishedOffer, RemoteCandidate, Signaling, Timestamp,
};
use crate::error::SignalingError;
use crate::transport::IceCandidate;

#[derive(Debug)]
struct StoredAnswer {
    answerer: String,
    sdp: String,
    answered_at: Timestamp,
    matched_tags: Option<Vec<String>>,
}

#[derive(Debug)]
struct StoredOffer {
    offer: PublishedOffer,
    expires_at: Instant,
    answer: Option<StoredAnswer>,
    candidates: Vec<RemoteCandidate>,
}

impl StoredOffer {
    fn expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn role_of(&self, peer: &str) -> Option<CandidateRole> {
        if self.offer.owner == peer {
            Some(CandidateRole::Offerer)
        } else if self.answer.as_ref().is_some_and(|a| a.answerer == peer) {
            Some(CandidateRole::Answerer)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    clock: Timestamp,
    next_offer: u64,
    // Keyed by zero-padded sequence so iteration follows publication order.
    offers: BTreeMap<String, StoredOffer>,
    fail_polls: usize,
    fail_publishes: usize,
}

impl ServerState {
    fn tick(&mut self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or_default();
        self.clock = wall.max(self.clock + 1);
        self.clock
    }

    fn offer(&self, offer_id: &str) -> Result<&StoredOffer, SignalingError> {
        self.offers
            .get(offer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("offer {offer_id}")))
    }
}

fn take_failure(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRendezvous {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, name: impl Into<String>) -> MemorySignaling {
        MemorySignaling {
            name: name.into(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn fail_next_polls(&self, count: usize) {
        self.state.lock().fail_polls = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().fail_publishes = count;
    }

    /// Offers by `owner` that are neither answered nor expired.
    pub fn open_offers(&self, owner: &str) -> Vec<PublishedOffer> {
        let now = Instant::now();
        self.state
            .lock()
            .offers
            .values()
            .filter(|o| o.offer.owner == owner && o.answer.is_none() && !o.expired(now))
            .map(|o| o.offer.clone())
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().offers.len()
    }

    pub fn answerer_of(&self, offer_id: &str) -> Option<String> {
        self.state
            .lock()
            .offers
            .get(offer_id)
            .and_then(|o| o.answer.as_ref().map(|a| a.answerer.clone()))
    }

    pub fn candidates(&self, offer_id: &str) -> Vec<RemoteCandidate> {
        self.state
            .lock()
            .offers
            .get(offer_id)
            .map(|o| o.candidates.clone())
            .unwrap_or_default()
    }

    /// Drops an offer as if its TTL had run out.
    pub fn expire(&self, offer_id: &str) -> bool {
        self.state.lock().offers.remove(offer_id).is_some()
    }
}

/// One peer's view of a [`MemoryRendezvous`].
#[derive(Debug, Clone)]
pub struct MemorySignaling {
    name: String,
    state: Arc<Mutex<ServerState>>,
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn identity(&self) -> Result<String, SignalingError> {
        Ok(self.name.clone())
    }

    async fn publish(
        &self,
        tags: &[String],
        sdps: Vec<String>,
        ttl: Duration,
    ) -> Result<Vec<PublishedOffer>, SignalingError> {
        if tags.is_empty() {
            return Err(SignalingError::Rejected("at least one tag is required".into()));
        }
        let mut state = self.state.lock();
        if take_failure(&mut state.fail_publishes) {
            return Err(SignalingError::Unavailable("injected publish failure".into()));
        }

        let now = Instant::now();
        let mut published = Vec::with_capacity(sdps.len());
        for sdp in sdps {
            state.next_offer += 1;
            let offer_id = format!("offer-{:06}", state.next_offer);
            let offer = PublishedOffer {
                offer_id: offer_id.clone(),
                owner: self.name.clone(),
                tags: tags.to_vec(),
                sdp,
                ttl,
                created_at: state.tick(),
            };
            state.offers.insert(
                offer_id,
                StoredOffer {
                    offer: offer.clone(),
                    expires_at: now + ttl,
                    answer: None,
                    candidates: Vec::new(),
                },
            );
            published.push(offer);
        }
        Ok(published)
    }

    async fn answer_offer(
        &self,
        offer_id: &str,
        sdp: &str,
        matched_tags: Option<&[String]>,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        let answered_at = state.tick();
        let stored = state
            .offers
            .get_mut(offer_id)
            .filter(|o| !o.expired(Instant::now()))
            .ok_or_else(|| SignalingError::NotFound(format!("offer {offer_id}")))?;
        if stored.offer.owner == self.name {
            return Err(SignalingError::Rejected("cannot answer own offer".into()));
        }
        if stored.answer.is_some() {
            return Err(SignalingError::Rejected(format!(
                "offer {offer_id} already answered"
            )));
        }
        stored.answer = Some(StoredAnswer {
            answerer: self.name.clone(),
            sdp: sdp.to_owned(),
            answered_at,
            matched_tags: matched_tags.map(<[String]>::to_vec),
        });
        Ok(())
    }

    async fn poll(&self, since: Timestamp) -> Result<PollBatch, SignalingError> {
        let mut state = self.state.lock();
        if take_failure(&mut state.fail_polls) {
            return Err(SignalingError::Unavailable("injected poll failure".into()));
        }

        let mut batch = PollBatch::default();
        for (offer_id, stored) in &state.offers {
            let Some(role) = stored.role_of(&self.name) else {
                continue;
            };
            if role == CandidateRole::Offerer {
                if let Some(answer) = stored.answer.as_ref().filter(|a| a.answered_at > since) {
                    batch.answers.push(PolledAnswer {
                        offer_id: offer_id.clone(),
                        answerer: answer.answerer.clone(),
                        sdp: answer.sdp.clone(),
                        answered_at: answer.answered_at,
                        matched_tags: answer.matched_tags.clone(),
                    });
                }
            }
            // Owners only see the answerer's candidates; answerers see everything and
            // rely on their own role filter.
            let candidates: Vec<_> = stored
                .candidates
                .iter()
                .filter(|c| c.created_at > since)
                .filter(|c| role == CandidateRole::Answerer || c.role == CandidateRole::Answerer)
                .cloned()
                .collect();
            if !candidates.is_empty() {
                batch.ice_candidates.insert(offer_id.clone(), candidates);
            }
        }
        Ok(batch)
    }

    async fn add_ice_candidates(
        &self,
        offer_id: &str,
        candidates: &[IceCandidate],
    ) -> Result<CandidatesAdded, SignalingError> {
        let mut state = self.state.lock();
        let role = state
            .offer(offer_id)?
            .role_of(&self.name)
            .ok_or_else(|| SignalingError::Rejected(format!("not a party to {offer_id}")))?;
        let mut stamped = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            stamped.push(RemoteCandidate {
                candidate: candidate.clone(),
                role,
                created_at: state.tick(),
            });
        }
        let count = stamped.len();
        if let Some(stored) = state.offers.get_mut(offer_id) {
            stored.candidates.extend(stamped);
        }
        Ok(CandidatesAdded { count })
    }

    async fn ice_candidates(
        &self,
        offer_id: &str,
        since: Timestamp,
    ) -> Result<Vec<RemoteCandidate>, SignalingError> {
        let state = self.state.lock();
        let stored = state.offer(offer_id)?;
        let role = stored
            .role_of(&self.name)
            .ok_or_else(|| SignalingError::Rejected(format!("not a party to {offer_id}")))?;
        Ok(stored
            .candidates
            .iter()
            .filter(|c| c.role != role && c.created_at > since)
            .cloned()
            .collect())
    }

    async fn discover(
        &self,
        tags: &[String],
        limit: usize,
        offset: usize,
    ) -> Result<DiscoverResult, SignalingError> {
        let state = self.state.lock();
        let now = Instant::now();
        let matches: Vec<DiscoveredOffer> = state
            .offers
            .values()
            .filter(|o| o.answer.is_none() && !o.expired(now))
            .filter_map(|o| {
                let matched: Vec<String> = o
                    .offer
                    .tags
                    .iter()
                    .filter(|tag| tags.contains(tag))
                    .cloned()
                    .collect();
                if matched.is_empty() {
                    return None;
                }
                let ttl_ms = o.offer.ttl.as_millis() as Timestamp;
                Some(DiscoveredOffer {
                    offer_id: o.offer.offer_id.clone(),
                    owner: o.offer.owner.clone(),
                    tags: o.offer.tags.clone(),
                    sdp: o.offer.sdp.clone(),
                    created_at: o.offer.created_at,
                    expires_at: o.offer.created_at + ttl_ms,
                    matched_tags: matched,
                })
            })
            .collect();
        let count = matches.len();
        Ok(DiscoverResult {
            offers: matches.into_iter().skip(offset).take(limit).collect(),
            count,
        })
    }
}
