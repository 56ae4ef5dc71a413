//! Contract with the rendezvous server. The crate only needs these operations; how they
//! travel (HTTP, RPC, in-process) and how credentials are attached is up to the
//! implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SignalingError;
use crate::transport::IceCandidate;

pub mod memory;

/// Milliseconds since the Unix epoch, as stamped by the server.
pub type Timestamp = u64;

/// A published offer as the server records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedOffer {
    pub offer_id: String,
    pub owner: String,
    pub tags: Vec<String>,
    pub sdp: String,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCandidate {
    pub candidate: IceCandidate,
    pub role: CandidateRole,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolledAnswer {
    pub offer_id: String,
    pub answerer: String,
    pub sdp: String,
    pub answered_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_tags: Option<Vec<String>>,
}

/// Everything new since a watermark, in one round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollBatch {
    pub answers: Vec<PolledAnswer>,
    /// Candidates keyed by offer id, each list in server order.
    pub ice_candidates: BTreeMap<String, Vec<RemoteCandidate>>,
}

impl PollBatch {
    pub fn is_empty(&self) -> bool {
        self.answers.is_empty() && self.ice_candidates.values().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesAdded {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredOffer {
    pub offer_id: String,
    pub owner: String,
    pub tags: Vec<String>,
    pub sdp: String,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    /// Requested tags this offer carries.
    pub matched_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResult {
    pub offers: Vec<DiscoveredOffer>,
    /// Total matches before `limit`/`offset` were applied.
    pub count: usize,
}

#[async_trait]
pub trait Signaling: Send + Sync {
    /// Public name this peer is known by. Implementations issue or load credentials as
    /// needed; they stay opaque to the rest of the crate.
    async fn identity(&self) -> Result<String, SignalingError>;

    async fn publish(
        &self,
        tags: &[String],
        sdps: Vec<String>,
        ttl: Duration,
    ) -> Result<Vec<PublishedOffer>, SignalingError>;

    async fn answer_offer(
        &self,
        offer_id: &str,
        sdp: &str,
        matched_tags: Option<&[String]>,
    ) -> Result<(), SignalingError>;

    async fn poll(&self, since: Timestamp) -> Result<PollBatch, SignalingError>;

    async fn add_ice_candidates(
        &self,
        offer_id: &str,
        candidates: &[IceCandidate],
    ) -> Result<CandidatesAdded, SignalingError>;

    /// Candidates posted by the other side of `offer_id` after `since`.
    async fn ice_candidates(
        &self,
        offer_id: &str,
        since: Timestamp,
    ) -> Result<Vec<RemoteCandidate>, SignalingError>;

    async fn discover(
        &self,
        tags: &[String],
        limit: usize,
        offset: usize,
    ) -> Result<DiscoverResult, SignalingError>;
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
