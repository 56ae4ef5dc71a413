use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{Connection, ConnectionInner, ConnectionState, Role, RoleState};
use crate::config::ConnectionConfig;
use crate::error::RendezvousError;
use crate::polling::{PollEvent, PollingManager};
use crate::signaling::{DiscoveredOffer, RemoteCandidate, Signaling, Timestamp};
use crate::transport::TransportFactory;

pub(crate) struct AnswererState {
    /// Discovery tags used to find this peer again on reconnect.
    tags: Vec<String>,
    factory: Arc<dyn TransportFactory>,
    polling: Option<PollingManager>,
    poll_interval: Duration,
    discover_limit: usize,
    pub(super) candidate_feed: Option<JoinHandle<()>>,
    pub(super) matched_tags: Option<Vec<String>>,
}

/// Collaborators an answering connection needs for its whole life, including
/// rediscovery when it reconnects.
#[derive(Clone)]
pub struct AnswererContext {
    pub signaling: Arc<dyn Signaling>,
    pub factory: Arc<dyn TransportFactory>,
    /// Shared poller to take offerer candidates from. Without one the connection asks
    /// the server for its candidates every `poll_interval`.
    pub polling: Option<PollingManager>,
    pub poll_interval: Duration,
    pub config: ConnectionConfig,
    pub discover_limit: usize,
}

impl AnswererContext {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        factory: Arc<dyn TransportFactory>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            signaling,
            factory,
            polling: None,
            poll_interval: Duration::from_secs(1),
            config,
            discover_limit: 10,
        }
    }

    pub fn with_polling(mut self, polling: PollingManager) -> Self {
        self.polling = Some(polling);
        self
    }
}

enum CandidateSource {
    Polling(broadcast::Receiver<PollEvent>),
    Direct(Duration),
}

fn matched_from(offer: &DiscoveredOffer) -> Option<Vec<String>> {
    (!offer.matched_tags.is_empty()).then(|| offer.matched_tags.clone())
}

impl Connection {
    /// Answers a discovered offer: creates the local answer, publishes it, and starts
    /// taking the offerer's candidates. The returned connection is `signaling` and
    /// reaches `connected` once the offerer applies the answer.
    pub async fn answer(
        offer: &DiscoveredOffer,
        tags: Vec<String>,
        ctx: AnswererContext,
    ) -> Result<Self, RendezvousError> {
        let AnswererContext {
            signaling,
            factory,
            polling,
            poll_interval,
            config,
            discover_limit,
        } = ctx;
        let local = factory.accept_offer(&offer.sdp).await?;
        let matched = matched_from(offer);

        let conn = Self::build(
            Role::Answerer,
            offer.offer_id.clone(),
            config,
            signaling,
            RoleState::Answerer(AnswererState {
                tags,
                factory,
                polling,
                poll_interval,
                discover_limit,
                candidate_feed: None,
                matched_tags: matched.clone(),
            }),
        );
        conn.shared().peer_identity = Some(offer.owner.clone());
        conn.bind_transport(&local.transport, None);

        let generation = conn.shared().generation;
        if let Err(err) = conn
            .publish_answer(generation, &offer.offer_id, &local.sdp, matched.as_deref())
            .await
        {
            conn.close().await;
            return Err(err);
        }
        Ok(conn)
    }

    async fn publish_answer(
        &self,
        generation: u64,
        offer_id: &str,
        sdp: &str,
        matched_tags: Option<&[String]>,
    ) -> Result<(), RendezvousError> {
        self.inner
            .signaling
            .answer_offer(offer_id, sdp, matched_tags)
            .await?;
        tracing::info!(
            target = "rendezvous::answerer",
            connection = %self.inner.id,
            offer_id,
            "answer published"
        );
        self.mark_signaled(generation).await;
        self.start_candidate_feed(generation, offer_id.to_owned());
        Ok(())
    }

    fn start_candidate_feed(&self, generation: u64, offer_id: String) {
        let mut guard = self.shared();
        let shared = &mut *guard;
        if shared.generation != generation || shared.state == ConnectionState::Closed {
            return;
        }
        let RoleState::Answerer(answerer) = &mut shared.role else {
            return;
        };
        // Subscribe before the initial fetch so nothing polled in between is missed.
        let source = match &answerer.polling {
            Some(polling) => CandidateSource::Polling(polling.subscribe()),
            None => CandidateSource::Direct(answerer.poll_interval),
        };
        let task = tokio::spawn(run_candidate_feed(
            self.downgrade(),
            Arc::clone(&self.inner.signaling),
            generation,
            offer_id,
            source,
        ));
        if let Some(previous) = answerer.candidate_feed.replace(task) {
            previous.abort();
        }
    }
}

/// Finds a fresh offer from the same peer and renegotiates against it. The old offer is
/// assumed gone, so it is never reused.
pub(super) async fn reconnect(conn: &Connection) -> Result<(), RendezvousError> {
    let (tags, owner, factory, limit, stale_offer_id) = {
        let shared = conn.shared();
        let RoleState::Answerer(answerer) = &shared.role else {
            return Err(RendezvousError::WrongRole {
                operation: "reconnect",
            });
        };
        (
            answerer.tags.clone(),
            shared.peer_identity.clone(),
            Arc::clone(&answerer.factory),
            answerer.discover_limit,
            shared.offer_id.clone(),
        )
    };

    let found = conn.inner.signaling.discover(&tags, limit, 0).await?;
    let Some(offer) = found.offers.into_iter().find(|offer| {
        offer.offer_id != stale_offer_id && owner.as_deref().is_none_or(|owner| offer.owner == owner)
    }) else {
        return Err(RendezvousError::NoOffersFound { tags });
    };
    tracing::debug!(
        target = "rendezvous::answerer",
        connection = %conn.inner.id,
        old_offer_id = %stale_offer_id,
        new_offer_id = %offer.offer_id,
        "rediscovered peer offer"
    );

    let local = factory.accept_offer(&offer.sdp).await?;
    let matched = matched_from(&offer);

    let prepared = {
        let mut guard = conn.shared();
        let shared = &mut *guard;
        if shared.state == ConnectionState::Closed {
            None
        } else {
            shared.generation += 1;
            shared.offer_id = offer.offer_id.clone();
            shared.signaled = false;
            shared.transport_connected = false;
            shared.channel_open = false;
            shared.pending_candidates.clear();
            shared.applied_candidates.clear();
            shared.connection_timer = None;
            shared.ice_timer = None;
            let feed = match &mut shared.role {
                RoleState::Answerer(answerer) => {
                    answerer.matched_tags = matched.clone();
                    answerer.candidate_feed.take()
                }
                RoleState::Offerer(_) => None,
            };
            Some((
                shared.generation,
                shared.transport.take(),
                shared.channel.take(),
                shared.pump.take(),
                feed,
            ))
        }
    };
    let Some((generation, old_transport, old_channel, old_pump, old_feed)) = prepared else {
        local.transport.close().await;
        return Err(RendezvousError::Closed);
    };

    for task in [old_pump, old_feed].into_iter().flatten() {
        task.abort();
    }
    if let Some(channel) = old_channel {
        channel.close().await;
    }
    if let Some(transport) = old_transport {
        transport.close().await;
    }

    conn.bind_transport(&local.transport, None);
    conn.publish_answer(generation, &offer.offer_id, &local.sdp, matched.as_deref())
        .await
}

async fn deliver(
    weak: &Weak<ConnectionInner>,
    generation: u64,
    candidates: &[RemoteCandidate],
) -> bool {
    let Some(conn) = weak.upgrade().map(Connection::from_inner) else {
        return false;
    };
    if !conn.is_current(generation) {
        return false;
    }
    if !candidates.is_empty() {
        conn.add_remote_candidates(candidates).await;
    }
    true
}

fn latest(candidates: &[RemoteCandidate], since: Timestamp) -> Timestamp {
    candidates
        .iter()
        .map(|c| c.created_at)
        .fold(since, Timestamp::max)
}

async fn fetch(
    signaling: &Arc<dyn Signaling>,
    offer_id: &str,
    since: Timestamp,
) -> Option<Vec<RemoteCandidate>> {
    match signaling.ice_candidates(offer_id, since).await {
        Ok(candidates) => Some(candidates),
        Err(err) => {
            tracing::warn!(
                target = "rendezvous::answerer",
                offer_id,
                error = %err,
                "failed to fetch offerer candidates"
            );
            None
        }
    }
}

async fn run_candidate_feed(
    weak: Weak<ConnectionInner>,
    signaling: Arc<dyn Signaling>,
    generation: u64,
    offer_id: String,
    source: CandidateSource,
) {
    // Candidates posted before our answer landed predate the shared poll watermark.
    let mut since: Timestamp = 0;
    if let Some(candidates) = fetch(&signaling, &offer_id, since).await {
        since = latest(&candidates, since);
        if !deliver(&weak, generation, &candidates).await {
            return;
        }
    }

    match source {
        CandidateSource::Polling(mut events) => loop {
            match events.recv().await {
                Ok(PollEvent::Ice {
                    offer_id: polled,
                    candidates,
                }) if polled == offer_id => {
                    if !deliver(&weak, generation, &candidates).await {
                        return;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        target = "rendezvous::answerer",
                        offer_id = %offer_id,
                        skipped,
                        "poll events lagged; refetching candidates"
                    );
                    if let Some(candidates) = fetch(&signaling, &offer_id, since).await {
                        since = latest(&candidates, since);
                        if !deliver(&weak, generation, &candidates).await {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        },
        CandidateSource::Direct(interval) => {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(candidates) = fetch(&signaling, &offer_id, since).await {
                    since = latest(&candidates, since);
                    if !deliver(&weak, generation, &candidates).await {
                        return;
                    }
                } else if weak.upgrade().is_none() {
                    return;
                }
            }
        }
    }
}
