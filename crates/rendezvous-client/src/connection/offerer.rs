use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{Connection, ConnectionEvent, ConnectionState, Role, RoleState};
use crate::config::ConnectionConfig;
use crate::error::RendezvousError;
use crate::signaling::Signaling;
use crate::transport::{DataChannel, LocalOffer};

#[derive(Debug, Default)]
pub(crate) struct OffererState {
    /// Digest of the accepted answer; `Some` means an answer has been accepted for the
    /// current offer id.
    answer_fingerprint: Option<String>,
    pub(super) rotation_attempts: u32,
    matched_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// Same answer as the one already accepted; nothing was re-applied.
    Duplicate,
}

pub fn fingerprint(sdp: &str) -> String {
    hex::encode(Sha256::digest(sdp.as_bytes()))
}

fn same_channel(a: &Arc<dyn DataChannel>, b: &Arc<dyn DataChannel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Connection {
    /// Wraps a freshly published offer. Must be called inside a Tokio runtime.
    pub fn new_offerer(
        offer_id: impl Into<String>,
        offer: LocalOffer,
        signaling: Arc<dyn Signaling>,
        config: ConnectionConfig,
    ) -> Self {
        let conn = Self::offerer_unbound(offer_id.into(), signaling, config);
        conn.activate_offer(offer);
        conn
    }

    /// Offerer with no transport yet, so a caller can subscribe before any event fires.
    pub(crate) fn offerer_unbound(
        offer_id: String,
        signaling: Arc<dyn Signaling>,
        config: ConnectionConfig,
    ) -> Self {
        Self::build(
            Role::Offerer,
            offer_id,
            config,
            signaling,
            RoleState::Offerer(OffererState::default()),
        )
    }

    pub(crate) fn activate_offer(&self, offer: LocalOffer) {
        self.bind_transport(&offer.transport, offer.channel.as_ref());
        let mut shared = self.shared();
        // The offer is already published, so candidates can flow immediately.
        shared.signaled = true;
        self.transition(&mut shared, ConnectionState::Signaling);
        self.arm_connection_timer(&mut shared);
    }

    pub fn answer_accepted(&self) -> bool {
        match &self.shared().role {
            RoleState::Offerer(offerer) => offerer.answer_fingerprint.is_some(),
            RoleState::Answerer(_) => false,
        }
    }

    pub fn rotation_attempts(&self) -> u32 {
        match &self.shared().role {
            RoleState::Offerer(offerer) => offerer.rotation_attempts,
            RoleState::Answerer(_) => 0,
        }
    }

    /// Discovery tags the answerer matched on, when it reported them.
    pub fn matched_tags(&self) -> Option<Vec<String>> {
        match &self.shared().role {
            RoleState::Offerer(offerer) => offerer.matched_tags.clone(),
            RoleState::Answerer(answerer) => answerer.matched_tags.clone(),
        }
    }

    /// Accepts the remote answer for the current offer.
    ///
    /// Replaying the accepted answer is a no-op; a different answer after acceptance is a
    /// protocol violation. The acceptance flag is set before the remote description is
    /// applied and rolled back if applying fails.
    pub async fn process_answer(
        &self,
        sdp: &str,
        answerer: &str,
        matched_tags: Option<Vec<String>>,
    ) -> Result<AnswerOutcome, RendezvousError> {
        let digest = fingerprint(sdp);
        let (transport, generation, offer_id) = {
            let mut guard = self.shared();
            let shared = &mut *guard;
            let RoleState::Offerer(offerer) = &mut shared.role else {
                return Err(RendezvousError::WrongRole {
                    operation: "process_answer",
                });
            };

            if let Some(accepted) = offerer.answer_fingerprint.as_deref() {
                if accepted == digest {
                    tracing::debug!(
                        target = "rendezvous::offerer",
                        connection = %self.inner.id,
                        offer_id = %shared.offer_id,
                        "duplicate answer ignored"
                    );
                    self.emit(ConnectionEvent::AnswerDuplicate {
                        offer_id: shared.offer_id.clone(),
                    });
                    return Ok(AnswerOutcome::Duplicate);
                }
                return Err(RendezvousError::ConflictingAnswer {
                    offer_id: shared.offer_id.clone(),
                });
            }

            if !matches!(
                shared.state,
                ConnectionState::Signaling | ConnectionState::Checking | ConnectionState::Failed
            ) {
                return Err(RendezvousError::InvalidState {
                    operation: "process answer",
                    state: shared.state,
                });
            }
            let Some(transport) = shared.transport.clone() else {
                return Err(RendezvousError::Closed);
            };

            offerer.answer_fingerprint = Some(digest);
            offerer.matched_tags = matched_tags;
            shared.peer_identity = Some(answerer.to_owned());
            (transport, shared.generation, shared.offer_id.clone())
        };

        if let Err(err) = transport.apply_answer(sdp).await {
            let mut guard = self.shared();
            let shared = &mut *guard;
            if shared.generation == generation {
                if let RoleState::Offerer(offerer) = &mut shared.role {
                    offerer.answer_fingerprint = None;
                    offerer.matched_tags = None;
                }
                shared.peer_identity = None;
            }
            tracing::warn!(
                target = "rendezvous::offerer",
                connection = %self.inner.id,
                offer_id = %offer_id,
                error = %err,
                "failed to apply answer"
            );
            return Err(err.into());
        }

        {
            let mut shared = self.shared();
            if shared.generation == generation && shared.state == ConnectionState::Failed {
                // A late answer rescues a connection that timed out waiting for it.
                self.transition(&mut shared, ConnectionState::Signaling);
                self.arm_connection_timer(&mut shared);
            }
        }
        tracing::info!(
            target = "rendezvous::offerer",
            connection = %self.inner.id,
            offer_id = %offer_id,
            answerer,
            "answer accepted"
        );
        self.emit(ConnectionEvent::AnswerAccepted {
            offer_id,
            answerer: answerer.to_owned(),
        });
        Ok(AnswerOutcome::Applied)
    }

    /// Re-points this connection at a newly published offer and transport, keeping the
    /// connection identity and its buffered messages.
    pub async fn rebind_to_offer(
        &self,
        new_offer_id: impl Into<String>,
        offer: LocalOffer,
    ) -> Result<(), RendezvousError> {
        let new_offer_id = new_offer_id.into();
        let Some(_rotation) = self.inner.rotation_lock.try_acquire() else {
            offer.transport.close().await;
            return Err(RendezvousError::RotationInProgress);
        };

        let prepared = {
            let mut guard = self.shared();
            let shared = &mut *guard;
            let max_attempts = self.inner.config.max_rotation_attempts;
            if shared.state == ConnectionState::Closed {
                Err(RendezvousError::Closed)
            } else {
                match &mut shared.role {
                    RoleState::Answerer(_) => Err(RendezvousError::WrongRole {
                        operation: "rebind_to_offer",
                    }),
                    RoleState::Offerer(offerer) if offerer.rotation_attempts >= max_attempts => {
                        Err(RendezvousError::RotationLimit {
                            attempts: offerer.rotation_attempts,
                        })
                    }
                    RoleState::Offerer(offerer) => {
                        offerer.rotation_attempts += 1;
                        offerer.answer_fingerprint = None;
                        offerer.matched_tags = None;
                        shared.peer_identity = None;
                        shared.generation += 1;
                        shared.transport_connected = false;
                        shared.channel_open = false;
                        shared.applied_candidates.clear();
                        shared.pending_candidates.clear();
                        shared.connection_timer = None;
                        shared.ice_timer = None;
                        shared.reconnect_timer = None;
                        let old_offer_id =
                            std::mem::replace(&mut shared.offer_id, new_offer_id.clone());
                        Ok((
                            old_offer_id,
                            shared.transport.take(),
                            shared.channel.take(),
                            shared.pump.take(),
                        ))
                    }
                }
            }
        };
        let (old_offer_id, old_transport, old_channel, old_pump) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                offer.transport.close().await;
                return Err(err);
            }
        };

        if let Some(pump) = old_pump {
            pump.abort();
        }
        if let Some(old_channel) = old_channel {
            let reused = offer
                .channel
                .as_ref()
                .is_some_and(|new_channel| same_channel(new_channel, &old_channel));
            if !reused {
                old_channel.close().await;
            }
        }
        if let Some(old_transport) = old_transport {
            if old_transport.id() != offer.transport.id() {
                old_transport.close().await;
            }
        }

        tracing::info!(
            target = "rendezvous::offerer",
            connection = %self.inner.id,
            old_offer_id = %old_offer_id,
            new_offer_id = %new_offer_id,
            "rotated to new offer"
        );
        self.activate_offer(offer);
        self.emit(ConnectionEvent::Rotated {
            old_offer_id,
            new_offer_id,
        });
        Ok(())
    }
}
