//! Durable peer connection over an unreliable negotiation.
//!
//! A [`Connection`] tracks one transport through
//! `initializing → gathering → signaling → checking → connecting → connected` and the
//! recovery branches (`disconnected`, `reconnecting`, `failed`), buffers outbound
//! messages while it cannot deliver them, and replays them in order once connected.
//! Role-specific behaviour lives in [`offerer`] (answer handling, rotation) and
//! [`answerer`] (answering, rediscovery on reconnect).

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::backoff::ExponentialBackoff;
use crate::buffer::{Enqueued, MessageBuffer, MessageId};
use crate::config::ConnectionConfig;
use crate::error::RendezvousError;
use crate::lock::AsyncLock;
use crate::signaling::{CandidateRole, RemoteCandidate, Signaling};
use crate::timer::{Timer, TimerId, detach_if_current};
use crate::transport::{
    ChannelEvent, DataChannel, IceCandidate, PeerTransport, TransportEvent, TransportState,
};

pub mod answerer;
pub mod offerer;

pub use answerer::AnswererContext;
pub use offerer::AnswerOutcome;

use answerer::AnswererState;
use offerer::OffererState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initializing,
    Gathering,
    Signaling,
    Checking,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    fn is_negotiating(self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::Gathering
                | Self::Signaling
                | Self::Checking
                | Self::Connecting
                | Self::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Gathering => "gathering",
            Self::Signaling => "signaling",
            Self::Checking => "checking",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Buffered(MessageId),
    /// Could not be delivered and buffering is disabled.
    Dropped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Failed {
        reason: String,
    },
    Message(Bytes),
    Sent {
        buffered: bool,
        message_id: Option<MessageId>,
    },
    MessageDropped,
    Replayed {
        message_id: MessageId,
    },
    BufferOverflow {
        evicted: MessageId,
    },
    BufferExpired {
        message_ids: Vec<MessageId>,
    },
    AnswerAccepted {
        offer_id: String,
        answerer: String,
    },
    AnswerDuplicate {
        offer_id: String,
    },
    Rotated {
        old_offer_id: String,
        new_offer_id: String,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
    Error(String),
}

pub(crate) enum RoleState {
    Offerer(OffererState),
    Answerer(AnswererState),
}

pub(crate) struct Shared {
    state: ConnectionState,
    /// Bumped whenever the transport binding changes or the connection closes; work
    /// started under an older generation becomes a no-op.
    generation: u64,
    offer_id: String,
    peer_identity: Option<String>,
    transport: Option<Arc<dyn PeerTransport>>,
    channel: Option<Arc<dyn DataChannel>>,
    transport_connected: bool,
    channel_open: bool,
    /// Local candidates can only be posted once our side of the offer is published.
    signaled: bool,
    pending_candidates: Vec<IceCandidate>,
    applied_candidates: HashSet<String>,
    replaying: bool,
    reconnect_attempts: u32,
    backoff: ExponentialBackoff,
    buffer: Option<MessageBuffer>,
    connection_timer: Option<Timer>,
    ice_timer: Option<Timer>,
    reconnect_timer: Option<Timer>,
    pump: Option<JoinHandle<()>>,
    role: RoleState,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    role: Role,
    config: ConnectionConfig,
    signaling: Arc<dyn Signaling>,
    events: broadcast::Sender<ConnectionEvent>,
    rotation_lock: AsyncLock,
    shared: Mutex<Shared>,
}

/// Cloneable handle to one logical peer connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &shared.state)
            .field("offer_id", &shared.offer_id)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Connection {
    fn build(
        role: Role,
        offer_id: String,
        mut config: ConnectionConfig,
        signaling: Arc<dyn Signaling>,
        role_state: RoleState,
    ) -> Self {
        if role == Role::Offerer {
            config.reconnect_enabled = false;
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let buffer = config
            .buffer_enabled
            .then(|| MessageBuffer::new(config.buffer));
        let shared = Shared {
            state: ConnectionState::Initializing,
            generation: 0,
            offer_id,
            peer_identity: None,
            transport: None,
            channel: None,
            transport_connected: false,
            channel_open: false,
            signaled: false,
            pending_candidates: Vec::new(),
            applied_candidates: HashSet::new(),
            replaying: false,
            reconnect_attempts: 0,
            backoff: ExponentialBackoff::new(config.reconnect_backoff),
            buffer,
            connection_timer: None,
            ice_timer: None,
            reconnect_timer: None,
            pump: None,
            role: role_state,
        };
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
                role,
                config,
                signaling,
                events,
                rotation_lock: AsyncLock::new(),
                shared: Mutex::new(shared),
            }),
        }
    }

    fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state
    }

    pub fn offer_id(&self) -> String {
        self.shared().offer_id.clone()
    }

    pub fn peer_identity(&self) -> Option<String> {
        self.shared().peer_identity.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared().reconnect_attempts
    }

    pub fn buffered_len(&self) -> usize {
        self.shared().buffer.as_ref().map_or(0, MessageBuffer::len)
    }

    pub fn buffered_ids(&self) -> Vec<MessageId> {
        self.shared()
            .buffer
            .as_ref()
            .map(MessageBuffer::ids)
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until the connection reaches `target`. Returns `false` on timeout or if the
    /// connection closes first.
    pub async fn wait_for(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut events = self.subscribe();
        if self.state() == target {
            return true;
        }
        let waited = tokio::time::timeout(limit, async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::StateChanged { to, .. }) if to == target => return true,
                    Ok(ConnectionEvent::StateChanged {
                        to: ConnectionState::Closed,
                        ..
                    }) => return false,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.state() == target {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;
        waited.unwrap_or(false)
    }

    fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared();
        shared.generation == generation && shared.state != ConnectionState::Closed
    }

    fn transition(&self, shared: &mut Shared, to: ConnectionState) -> bool {
        let from = shared.state;
        if from == to || from == ConnectionState::Closed {
            return false;
        }
        shared.state = to;
        tracing::debug!(
            target = "rendezvous::connection",
            connection = %self.inner.id,
            offer_id = %shared.offer_id,
            ?from,
            ?to,
            "state transition"
        );
        self.emit(ConnectionEvent::StateChanged { from, to });
        true
    }

    fn candidate_role_filter(&self) -> Option<CandidateRole> {
        match self.inner.role {
            Role::Offerer => None,
            Role::Answerer => Some(CandidateRole::Offerer),
        }
    }

    /// Attaches the transport (and channel, if already known) and starts consuming
    /// their events under the current generation.
    fn bind_transport(
        &self,
        transport: &Arc<dyn PeerTransport>,
        channel: Option<&Arc<dyn DataChannel>>,
    ) {
        let transport_rx = transport.take_events();
        let channel_rx = channel.and_then(|channel| channel.take_events());

        let mut shared = self.shared();
        shared.transport = Some(Arc::clone(transport));
        shared.channel = channel.cloned();
        shared.channel_open = channel.is_some_and(|channel| channel.is_open());
        let generation = shared.generation;
        match transport_rx {
            Some(transport_rx) => {
                let weak = self.downgrade();
                shared.pump = Some(tokio::spawn(run_pump(
                    weak,
                    generation,
                    transport_rx,
                    channel_rx,
                )));
            }
            None => {
                tracing::warn!(
                    target = "rendezvous::connection",
                    connection = %self.inner.id,
                    transport = %transport.id(),
                    "transport events already taken; state changes will not be observed"
                );
            }
        }
    }

    /// Our side of the negotiation is published: flush held-back candidates, enter
    /// `signaling`, and start the establishment timeout.
    async fn mark_signaled(&self, generation: u64) {
        let (offer_id, pending) = {
            let mut shared = self.shared();
            if shared.generation != generation || shared.state == ConnectionState::Closed {
                return;
            }
            shared.signaled = true;
            // The remote side may have connected while the answer was in flight.
            if matches!(
                shared.state,
                ConnectionState::Initializing
                    | ConnectionState::Gathering
                    | ConnectionState::Reconnecting
            ) {
                self.transition(&mut shared, ConnectionState::Signaling);
                self.arm_connection_timer(&mut shared);
            }
            (
                shared.offer_id.clone(),
                std::mem::take(&mut shared.pending_candidates),
            )
        };
        if !pending.is_empty() {
            self.post_candidates(&offer_id, &pending).await;
        }
    }

    fn arm_connection_timer(&self, shared: &mut Shared) {
        let weak = self.downgrade();
        let generation = shared.generation;
        shared.connection_timer = Some(Timer::schedule(
            self.inner.config.connection_timeout,
            move |timer| async move {
                let Some(conn) = weak.upgrade().map(Connection::from_inner) else {
                    return;
                };
                {
                    let mut shared = conn.shared();
                    if !detach_if_current(&mut shared.connection_timer, timer)
                        || shared.generation != generation
                        || matches!(
                            shared.state,
                            ConnectionState::Connected | ConnectionState::Closed
                        )
                    {
                        return;
                    }
                }
                conn.fail(generation, "connection timeout").await;
            },
        ));
    }

    fn arm_ice_timer(&self, shared: &mut Shared) {
        let weak = self.downgrade();
        let generation = shared.generation;
        shared.ice_timer = Some(Timer::schedule(
            self.inner.config.ice_gathering_timeout,
            move |timer| async move {
                let Some(conn) = weak.upgrade().map(Connection::from_inner) else {
                    return;
                };
                {
                    let mut shared = conn.shared();
                    if !detach_if_current(&mut shared.ice_timer, timer)
                        || shared.generation != generation
                        || shared.state != ConnectionState::Gathering
                    {
                        return;
                    }
                }
                conn.fail(generation, "ice gathering timeout").await;
            },
        ));
    }

    async fn handle_transport_event(
        &self,
        generation: u64,
        event: TransportEvent,
    ) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        tracing::trace!(
            target = "rendezvous::connection",
            connection = %self.inner.id,
            ?event,
            "transport event"
        );
        match event {
            TransportEvent::GatheringStarted => {
                let mut shared = self.shared();
                if shared.state == ConnectionState::Initializing {
                    self.transition(&mut shared, ConnectionState::Gathering);
                    self.arm_ice_timer(&mut shared);
                }
            }
            TransportEvent::GatheringComplete => {
                self.shared().ice_timer = None;
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.forward_local_candidate(candidate).await;
            }
            TransportEvent::StateChanged(state) => {
                self.on_transport_state(generation, state).await;
            }
            TransportEvent::DataChannel(channel) => {
                return self.attach_remote_channel(generation, channel).await;
            }
        }
        None
    }

    async fn attach_remote_channel(
        &self,
        generation: u64,
        channel: Arc<dyn DataChannel>,
    ) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        let events = channel.take_events();
        {
            let mut shared = self.shared();
            if shared.generation != generation {
                return None;
            }
            shared.channel_open = channel.is_open();
            shared.channel = Some(channel);
        }
        self.maybe_connected(generation).await;
        events
    }

    async fn on_transport_state(&self, generation: u64, state: TransportState) {
        match state {
            TransportState::New => {}
            TransportState::Checking | TransportState::Connecting => {
                let target = if state == TransportState::Checking {
                    ConnectionState::Checking
                } else {
                    ConnectionState::Connecting
                };
                let mut shared = self.shared();
                if shared.generation == generation && shared.state.is_negotiating() {
                    self.transition(&mut shared, target);
                }
            }
            TransportState::Connected => {
                {
                    let mut shared = self.shared();
                    if shared.generation != generation {
                        return;
                    }
                    shared.transport_connected = true;
                }
                self.maybe_connected(generation).await;
            }
            TransportState::Disconnected => {
                {
                    let mut shared = self.shared();
                    if shared.generation != generation {
                        return;
                    }
                    shared.transport_connected = false;
                }
                self.lose_connection(generation, "transport");
            }
            TransportState::Failed => self.fail(generation, "transport failed").await,
            TransportState::Closed => {
                if self.is_current(generation) {
                    // Closing aborts this pump, so it runs on its own task.
                    let conn = self.clone();
                    tokio::spawn(async move { conn.close().await });
                }
            }
        }
    }

    async fn handle_channel_event(&self, generation: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                {
                    let mut shared = self.shared();
                    if shared.generation != generation {
                        return;
                    }
                    shared.channel_open = true;
                }
                self.maybe_connected(generation).await;
            }
            ChannelEvent::Message(payload) => self.emit(ConnectionEvent::Message(payload)),
            ChannelEvent::Closed => {
                {
                    let mut shared = self.shared();
                    if shared.generation != generation {
                        return;
                    }
                    shared.channel_open = false;
                }
                self.lose_connection(generation, "data channel");
            }
            ChannelEvent::Error(message) => {
                tracing::warn!(
                    target = "rendezvous::connection",
                    connection = %self.inner.id,
                    error = %message,
                    "data channel error"
                );
                self.emit(ConnectionEvent::Error(message));
            }
        }
    }

    fn lose_connection(&self, generation: u64, cause: &'static str) {
        {
            let mut shared = self.shared();
            if shared.generation != generation || shared.state != ConnectionState::Connected {
                return;
            }
            tracing::info!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                cause,
                "connection lost"
            );
            self.transition(&mut shared, ConnectionState::Disconnected);
        }
        self.schedule_reconnect(generation);
    }

    /// Enters `connected` once the transport path and the data channel are both up.
    async fn maybe_connected(&self, generation: u64) {
        {
            let mut shared = self.shared();
            if shared.generation != generation
                || !(shared.transport_connected && shared.channel_open)
                || matches!(
                    shared.state,
                    ConnectionState::Connected | ConnectionState::Closed
                )
            {
                return;
            }
            self.transition(&mut shared, ConnectionState::Connected);
            shared.reconnect_attempts = 0;
            shared.backoff.reset();
            shared.connection_timer = None;
            shared.ice_timer = None;
            shared.reconnect_timer = None;
            if let RoleState::Offerer(offerer) = &mut shared.role {
                offerer.rotation_attempts = 0;
            }
            shared.replaying = true;
        }
        self.replay(generation).await;
    }

    async fn replay(&self, generation: u64) {
        let expired: Vec<MessageId> = {
            let mut shared = self.shared();
            match shared.buffer.as_mut() {
                Some(buffer) => buffer.get_expired().into_iter().map(|m| m.id).collect(),
                None => {
                    shared.replaying = false;
                    return;
                }
            }
        };
        if !expired.is_empty() {
            tracing::debug!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                count = expired.len(),
                "buffered messages expired while disconnected"
            );
            self.emit(ConnectionEvent::BufferExpired {
                message_ids: expired,
            });
        }

        loop {
            let (message, channel) = {
                let mut shared = self.shared();
                let next = shared.buffer.as_ref().and_then(MessageBuffer::front_valid);
                match (next, shared.channel.clone()) {
                    (Some(message), Some(channel))
                        if shared.generation == generation
                            && shared.state == ConnectionState::Connected =>
                    {
                        (message, channel)
                    }
                    _ => {
                        shared.replaying = false;
                        return;
                    }
                }
            };

            match channel.send(message.payload.clone()).await {
                Ok(()) => {
                    if let Some(buffer) = self.shared().buffer.as_mut() {
                        buffer.remove(message.id);
                    }
                    self.emit(ConnectionEvent::Replayed {
                        message_id: message.id,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        target = "rendezvous::connection",
                        connection = %self.inner.id,
                        error = %err,
                        "replay interrupted"
                    );
                    let mut shared = self.shared();
                    if let Some(buffer) = shared.buffer.as_mut() {
                        buffer.record_attempt(message.id);
                    }
                    shared.replaying = false;
                    return;
                }
            }
        }
    }

    /// Enters `failed` and, where the role allows it, schedules a reconnect.
    async fn fail(&self, generation: u64, reason: &str) {
        {
            let mut shared = self.shared();
            if shared.generation != generation
                || matches!(
                    shared.state,
                    ConnectionState::Failed | ConnectionState::Closed
                )
            {
                return;
            }
            shared.connection_timer = None;
            shared.ice_timer = None;
            shared.transport_connected = false;
            tracing::warn!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                offer_id = %shared.offer_id,
                reason,
                "connection failed"
            );
            self.transition(&mut shared, ConnectionState::Failed);
            self.emit(ConnectionEvent::Failed {
                reason: reason.to_owned(),
            });
        }
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(&self, generation: u64) {
        if !self.inner.config.reconnect_enabled {
            return;
        }
        let max_attempts = self.inner.config.max_reconnect_attempts;
        let mut shared = self.shared();
        if shared.generation != generation
            || shared.state == ConnectionState::Closed
            || shared.reconnect_timer.is_some()
        {
            return;
        }
        if max_attempts > 0 && shared.reconnect_attempts >= max_attempts {
            tracing::warn!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                attempts = shared.reconnect_attempts,
                "reconnect attempts exhausted"
            );
            self.emit(ConnectionEvent::ReconnectExhausted {
                attempts: shared.reconnect_attempts,
            });
            return;
        }

        let delay = shared.backoff.next();
        let attempt = shared.reconnect_attempts + 1;
        tracing::debug!(
            target = "rendezvous::connection",
            connection = %self.inner.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
        let weak = self.downgrade();
        shared.reconnect_timer = Some(Timer::schedule(delay, move |timer| async move {
            if let Some(conn) = weak.upgrade().map(Connection::from_inner) {
                conn.run_reconnect(timer).await;
            }
        }));
    }

    async fn run_reconnect(&self, timer: TimerId) {
        {
            let mut shared = self.shared();
            if !detach_if_current(&mut shared.reconnect_timer, timer)
                || shared.state == ConnectionState::Closed
            {
                return;
            }
            shared.reconnect_attempts += 1;
            self.transition(&mut shared, ConnectionState::Reconnecting);
        }

        let result = match self.inner.role {
            Role::Answerer => answerer::reconnect(self).await,
            Role::Offerer => Err(RendezvousError::WrongRole {
                operation: "reconnect",
            }),
        };
        if let Err(err) = result {
            tracing::warn!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                error = %err,
                "reconnect attempt failed"
            );
            // A failed attempt may already have moved to a new binding.
            let current = self.shared().generation;
            self.fail(current, &err.to_string()).await;
        }
    }

    async fn forward_local_candidate(&self, candidate: IceCandidate) {
        let offer_id = {
            let mut shared = self.shared();
            if !shared.signaled {
                shared.pending_candidates.push(candidate);
                return;
            }
            shared.offer_id.clone()
        };
        self.post_candidates(&offer_id, &[candidate]).await;
    }

    async fn post_candidates(&self, offer_id: &str, candidates: &[IceCandidate]) {
        match self
            .inner
            .signaling
            .add_ice_candidates(offer_id, candidates)
            .await
        {
            Ok(added) => tracing::trace!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                offer_id,
                count = added.count,
                "posted local candidates"
            ),
            Err(err) => tracing::warn!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                offer_id,
                error = %err,
                "failed to post local candidates"
            ),
        }
    }

    /// Applies remote candidates that pass this role's filter, each at most once per
    /// offer binding. A candidate the transport rejects stays eligible for redelivery.
    /// Returns how many were applied.
    pub async fn add_remote_candidates(&self, candidates: &[RemoteCandidate]) -> usize {
        let filter = self.candidate_role_filter();
        let (transport, fresh) = {
            let mut shared = self.shared();
            let Some(transport) = shared.transport.clone() else {
                return 0;
            };
            if shared.state == ConnectionState::Closed {
                return 0;
            }
            let fresh: Vec<IceCandidate> = candidates
                .iter()
                .filter(|remote| filter.is_none_or(|role| remote.role == role))
                .filter(|remote| {
                    shared
                        .applied_candidates
                        .insert(remote.candidate.candidate.clone())
                })
                .map(|remote| remote.candidate.clone())
                .collect();
            (transport, fresh)
        };

        let mut applied = 0;
        for candidate in &fresh {
            match transport.add_remote_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    // Release the claim so a later redelivery can try again.
                    self.shared()
                        .applied_candidates
                        .remove(&candidate.candidate);
                    tracing::warn!(
                        target = "rendezvous::connection",
                        connection = %self.inner.id,
                        error = %err,
                        "failed to apply remote candidate"
                    );
                }
            }
        }
        applied
    }

    /// Delivers now when connected, otherwise buffers (or drops when buffering is off).
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<SendOutcome, RendezvousError> {
        let data = data.into();
        let direct = {
            let shared = self.shared();
            if shared.state == ConnectionState::Closed {
                return Err(RendezvousError::Closed);
            }
            if shared.state == ConnectionState::Connected && !shared.replaying {
                shared.channel.clone().filter(|channel| channel.is_open())
            } else {
                None
            }
        };

        if let Some(channel) = direct {
            match channel.send(data.clone()).await {
                Ok(()) => {
                    self.emit(ConnectionEvent::Sent {
                        buffered: false,
                        message_id: None,
                    });
                    return Ok(SendOutcome::Sent);
                }
                Err(err) => tracing::debug!(
                    target = "rendezvous::connection",
                    connection = %self.inner.id,
                    error = %err,
                    "direct send failed; buffering"
                ),
            }
        }
        Ok(self.enqueue(data))
    }

    fn enqueue(&self, data: Bytes) -> SendOutcome {
        let mut shared = self.shared();
        let Some(buffer) = shared.buffer.as_mut() else {
            tracing::debug!(
                target = "rendezvous::connection",
                connection = %self.inner.id,
                bytes = data.len(),
                "message dropped; buffering disabled"
            );
            self.emit(ConnectionEvent::MessageDropped);
            return SendOutcome::Dropped;
        };
        let Enqueued { id, evicted } = buffer.add(data);
        match evicted {
            Some(evicted) if evicted.id == id => {
                self.emit(ConnectionEvent::MessageDropped);
                return SendOutcome::Dropped;
            }
            Some(evicted) => {
                tracing::debug!(
                    target = "rendezvous::connection",
                    connection = %self.inner.id,
                    evicted = %evicted.id,
                    "message buffer overflow"
                );
                self.emit(ConnectionEvent::BufferOverflow {
                    evicted: evicted.id,
                });
            }
            None => {}
        }
        self.emit(ConnectionEvent::Sent {
            buffered: true,
            message_id: Some(id),
        });
        SendOutcome::Buffered(id)
    }

    /// Cancels timers and candidate polling, closes the channel and transport, and
    /// clears the buffer unless configured to keep it. Idempotent.
    pub async fn close(&self) {
        let (transport, channel, pump, feed) = {
            let mut shared = self.shared();
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.generation += 1;
            shared.connection_timer = None;
            shared.ice_timer = None;
            shared.reconnect_timer = None;
            shared.pending_candidates.clear();
            if !self.inner.config.preserve_buffer_on_close {
                if let Some(buffer) = shared.buffer.as_mut() {
                    buffer.clear();
                }
            }
            let feed = match &mut shared.role {
                RoleState::Answerer(answerer) => answerer.candidate_feed.take(),
                RoleState::Offerer(_) => None,
            };
            let pump = shared.pump.take();
            let transport = shared.transport.take();
            let channel = shared.channel.take();
            shared.transport_connected = false;
            shared.channel_open = false;
            self.transition(&mut shared, ConnectionState::Closed);
            (transport, channel, pump, feed)
        };

        for task in [pump, feed].into_iter().flatten() {
            task.abort();
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        tracing::debug!(
            target = "rendezvous::connection",
            connection = %self.inner.id,
            "connection closed"
        );
    }
}

async fn next_channel_event(
    channel_rx: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match channel_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum PumpStep {
    Transport(Option<TransportEvent>),
    Channel(Option<ChannelEvent>),
}

async fn run_pump(
    weak: Weak<ConnectionInner>,
    generation: u64,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut channel_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
) {
    loop {
        let step = tokio::select! {
            event = transport_rx.recv() => PumpStep::Transport(event),
            event = next_channel_event(&mut channel_rx) => PumpStep::Channel(event),
        };
        let Some(conn) = weak.upgrade().map(Connection::from_inner) else {
            break;
        };
        if !conn.is_current(generation) {
            break;
        }
        match step {
            PumpStep::Transport(Some(event)) => {
                if let Some(rx) = conn.handle_transport_event(generation, event).await {
                    channel_rx = Some(rx);
                }
            }
            PumpStep::Transport(None) => break,
            PumpStep::Channel(Some(event)) => conn.handle_channel_event(generation, event).await,
            PumpStep::Channel(None) => channel_rx = None,
        }
    }
}

#[cfg(test)]
mod tests;
