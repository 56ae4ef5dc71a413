//! Hosting side: owns up to `max_offers` connections, keeps the free slots filled with
//! published offers, hands out connections as answers arrive, and rotates offers whose
//! negotiation fails.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backoff::ExponentialBackoff;
use crate::config::PoolConfig;
use crate::connection::{AnswerOutcome, Connection, ConnectionEvent, ConnectionId, ConnectionState};
use crate::error::{RendezvousError, SignalingError};
use crate::lock::AsyncLock;
use crate::polling::{PollEvent, PollingManager};
use crate::signaling::{PolledAnswer, PublishedOffer, RemoteCandidate, Signaling};
use crate::timer::{Timer, detach_if_current};
use crate::transport::{LocalOffer, TransportFactory};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    OfferPublished {
        offer_id: String,
        connection: ConnectionId,
    },
    OfferCreationFailed {
        error: String,
        retry_in: Duration,
    },
    Answered {
        offer_id: String,
        answerer: String,
    },
    ConnectionOpened {
        offer_id: String,
        connection: Connection,
        matched_tags: Option<Vec<String>>,
    },
    Rotated {
        connection: ConnectionId,
        old_offer_id: String,
        new_offer_id: String,
    },
    ConnectionRemoved {
        offer_id: String,
        connection: ConnectionId,
    },
    AnswerRejected {
        offer_id: String,
        error: String,
    },
}

struct PoolState {
    running: bool,
    /// Keyed by the offer id each connection is currently bound to.
    offers: HashMap<String, Connection>,
    watchers: HashMap<ConnectionId, JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    refill_timer: Option<Timer>,
    refill_backoff: ExponentialBackoff,
}

struct PoolInner {
    signaling: Arc<dyn Signaling>,
    factory: Arc<dyn TransportFactory>,
    tags: Vec<String>,
    config: PoolConfig,
    events: broadcast::Sender<PoolEvent>,
    fill_lock: AsyncLock,
    state: Mutex<PoolState>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, watcher) in state.watchers.drain() {
            watcher.abort();
        }
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

#[derive(Clone)]
pub struct OfferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for OfferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferPool")
            .field("tags", &self.inner.tags)
            .field("max_offers", &self.inner.config.max_offers)
            .field("connections", &self.len())
            .finish()
    }
}

fn is_pending(conn: &Connection) -> bool {
    !conn.answer_accepted() && conn.state() != ConnectionState::Closed
}

impl OfferPool {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        factory: Arc<dyn TransportFactory>,
        tags: Vec<String>,
        config: PoolConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let refill_backoff = ExponentialBackoff::new(config.refill_backoff);
        Self {
            inner: Arc::new(PoolInner {
                signaling,
                factory,
                tags,
                config,
                events,
                fill_lock: AsyncLock::new(),
                state: Mutex::new(PoolState {
                    running: false,
                    offers: HashMap::new(),
                    watchers: HashMap::new(),
                    dispatcher: None,
                    refill_timer: None,
                    refill_backoff,
                }),
            }),
        }
    }

    fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<PoolInner> {
        Arc::downgrade(&self.inner)
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn tags(&self) -> &[String] {
        &self.inner.tags
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Published offers still waiting for an answer. Bounded by `max_offers`.
    pub fn active_offer_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .offers
            .values()
            .filter(|conn| is_pending(conn))
            .count()
    }

    /// Every connection the pool owns, answered or not. Bounded by `max_offers`.
    pub fn len(&self) -> usize {
        self.inner.state.lock().offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn offer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().offers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection(&self, offer_id: &str) -> Option<Connection> {
        self.inner.state.lock().offers.get(offer_id).cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> =
            self.inner.state.lock().offers.values().cloned().collect();
        connections.sort_by_key(Connection::id);
        connections
    }

    /// Publishes the initial offers. Calling it on a running pool only tops it up.
    pub async fn start(&self) -> usize {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                state.running = true;
                tracing::info!(
                    target = "rendezvous::pool",
                    tags = ?self.inner.tags,
                    max_offers = self.inner.config.max_offers,
                    "offer pool started"
                );
            }
        }
        self.fill_offers().await
    }

    /// Closes every connection the pool owns and stops refilling. Idempotent.
    pub async fn stop(&self) {
        let (connections, watchers, dispatcher) = {
            let mut state = self.inner.state.lock();
            if !state.running && state.offers.is_empty() && state.dispatcher.is_none() {
                return;
            }
            state.running = false;
            state.refill_timer = None;
            let connections: Vec<Connection> = state.offers.drain().map(|(_, c)| c).collect();
            let watchers: Vec<JoinHandle<()>> = state.watchers.drain().map(|(_, w)| w).collect();
            (connections, watchers, state.dispatcher.take())
        };
        for task in watchers.into_iter().chain(dispatcher) {
            task.abort();
        }
        for conn in &connections {
            conn.close().await;
        }
        tracing::info!(
            target = "rendezvous::pool",
            closed = connections.len(),
            "offer pool stopped"
        );
    }

    /// Publishes offers until the pool owns `max_offers` connections. Concurrent callers
    /// run one after another. Returns how many offers this pass published.
    /// Boxed so refills spawned from connection watchers are provably `Send`.
    pub fn fill_offers(&self) -> Pin<Box<dyn Future<Output = usize> + Send + '_>> {
        Box::pin(self.fill_offers_inner())
    }

    async fn fill_offers_inner(&self) -> usize {
        let _fill = self.inner.fill_lock.acquire().await;
        let deficit = {
            let state = self.inner.state.lock();
            if !state.running {
                return 0;
            }
            self.inner.config.max_offers.saturating_sub(state.offers.len())
        };

        let mut created = 0;
        for _ in 0..deficit {
            match self.create_offer().await {
                Ok(_) => created += 1,
                Err(RendezvousError::Closed) => return created,
                Err(err) => {
                    self.schedule_refill(&err);
                    return created;
                }
            }
        }
        self.inner.state.lock().refill_backoff.reset();
        if created > 0 {
            tracing::debug!(target = "rendezvous::pool", created, "offers published");
        }
        created
    }

    fn schedule_refill(&self, err: &RendezvousError) {
        let mut state = self.inner.state.lock();
        if !state.running || state.refill_timer.is_some() {
            return;
        }
        let delay = state.refill_backoff.next();
        tracing::warn!(
            target = "rendezvous::pool",
            error = %err,
            retry_ms = delay.as_millis() as u64,
            "offer creation failed"
        );
        let weak = self.downgrade();
        state.refill_timer = Some(Timer::schedule(delay, move |timer| async move {
            let Some(pool) = weak.upgrade().map(OfferPool::from_inner) else {
                return;
            };
            if !detach_if_current(&mut pool.inner.state.lock().refill_timer, timer) {
                return;
            }
            pool.fill_offers().await;
        }));
        self.emit(PoolEvent::OfferCreationFailed {
            error: err.to_string(),
            retry_in: delay,
        });
    }

    /// Creates a transport offer and publishes it, closing the transport if publishing
    /// fails.
    async fn publish_local_offer(&self) -> Result<(PublishedOffer, LocalOffer), RendezvousError> {
        let local = self.inner.factory.create_offer().await?;
        let published = self
            .inner
            .signaling
            .publish(
                &self.inner.tags,
                vec![local.sdp.clone()],
                self.inner.config.offer_ttl,
            )
            .await
            .map_err(RendezvousError::from)
            .and_then(|published| {
                published.into_iter().next().ok_or_else(|| {
                    SignalingError::Rejected("publish returned no offer".into()).into()
                })
            });
        match published {
            Ok(offer) => Ok((offer, local)),
            Err(err) => {
                local.transport.close().await;
                Err(err)
            }
        }
    }

    async fn create_offer(&self) -> Result<Connection, RendezvousError> {
        let (offer, local) = self.publish_local_offer().await?;
        let conn = Connection::offerer_unbound(
            offer.offer_id.clone(),
            Arc::clone(&self.inner.signaling),
            self.inner.config.connection.clone(),
        );
        let events = conn.subscribe();
        conn.activate_offer(local);

        let registered = {
            let mut state = self.inner.state.lock();
            if state.running {
                state.offers.insert(offer.offer_id.clone(), conn.clone());
                let watcher = tokio::spawn(watch_connection(self.downgrade(), conn.clone(), events));
                state.watchers.insert(conn.id(), watcher);
                true
            } else {
                false
            }
        };
        if !registered {
            conn.close().await;
            return Err(RendezvousError::Closed);
        }

        tracing::debug!(
            target = "rendezvous::pool",
            offer_id = %offer.offer_id,
            connection = %conn.id(),
            "offer published"
        );
        self.emit(PoolEvent::OfferPublished {
            offer_id: offer.offer_id,
            connection: conn.id(),
        });
        Ok(conn)
    }

    /// Routes a polled answer to the connection owning its offer. Answers for offers this
    /// pool does not own are ignored (`Ok(None)`).
    pub async fn handle_poll_answer(
        &self,
        answer: &PolledAnswer,
    ) -> Result<Option<AnswerOutcome>, RendezvousError> {
        let Some(conn) = self.connection(&answer.offer_id) else {
            return Ok(None);
        };
        match conn
            .process_answer(&answer.sdp, &answer.answerer, answer.matched_tags.clone())
            .await
        {
            Ok(AnswerOutcome::Applied) => {
                self.emit(PoolEvent::Answered {
                    offer_id: answer.offer_id.clone(),
                    answerer: answer.answerer.clone(),
                });
                Ok(Some(AnswerOutcome::Applied))
            }
            Ok(AnswerOutcome::Duplicate) => Ok(Some(AnswerOutcome::Duplicate)),
            Err(err) => {
                tracing::warn!(
                    target = "rendezvous::pool",
                    offer_id = %answer.offer_id,
                    answerer = %answer.answerer,
                    error = %err,
                    "answer rejected"
                );
                self.emit(PoolEvent::AnswerRejected {
                    offer_id: answer.offer_id.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Applies polled candidates to the owning connection. Returns how many were applied.
    pub async fn handle_poll_ice(&self, offer_id: &str, candidates: &[RemoteCandidate]) -> usize {
        match self.connection(offer_id) {
            Some(conn) => conn.add_remote_candidates(candidates).await,
            None => 0,
        }
    }

    /// Feeds this pool from a shared poller until the pool stops.
    pub fn attach(&self, polling: &PollingManager) {
        let events = polling.subscribe();
        let task = tokio::spawn(dispatch_poll_events(self.downgrade(), events));
        if let Some(previous) = self.inner.state.lock().dispatcher.replace(task) {
            previous.abort();
        }
    }

    async fn rotate(&self, conn: &Connection) {
        let old_offer_id = conn.offer_id();
        let rotated = async {
            let attempts = conn.rotation_attempts();
            // Checked up front so a doomed rotation does not publish an offer.
            if attempts >= conn.config().max_rotation_attempts {
                return Err(RendezvousError::RotationLimit { attempts });
            }
            let (offer, local) = self.publish_local_offer().await?;
            conn.rebind_to_offer(offer.offer_id.clone(), local).await?;
            Ok::<_, RendezvousError>(offer.offer_id)
        }
        .await;

        match rotated {
            Ok(new_offer_id) => {
                {
                    let mut state = self.inner.state.lock();
                    if state.offers.get(&old_offer_id) == Some(conn) {
                        state.offers.remove(&old_offer_id);
                    }
                    state.offers.insert(new_offer_id.clone(), conn.clone());
                }
                tracing::info!(
                    target = "rendezvous::pool",
                    connection = %conn.id(),
                    old_offer_id = %old_offer_id,
                    new_offer_id = %new_offer_id,
                    "offer rotated"
                );
                self.emit(PoolEvent::Rotated {
                    connection: conn.id(),
                    old_offer_id,
                    new_offer_id,
                });
            }
            Err(err) => {
                tracing::warn!(
                    target = "rendezvous::pool",
                    connection = %conn.id(),
                    offer_id = %old_offer_id,
                    error = %err,
                    "rotation failed; retiring connection"
                );
                // The watcher sees the close, removes the entry and refills.
                conn.close().await;
            }
        }
    }

    fn remove_closed(&self, conn: &Connection) -> Option<String> {
        let mut state = self.inner.state.lock();
        let offer_id = state
            .offers
            .iter()
            .find(|(_, owned)| *owned == conn)
            .map(|(offer_id, _)| offer_id.clone())?;
        state.offers.remove(&offer_id);
        // The watcher calling this is the task behind the handle; dropping detaches it.
        state.watchers.remove(&conn.id());
        Some(offer_id)
    }

    async fn on_connection_closed(&self, conn: &Connection) {
        let Some(offer_id) = self.remove_closed(conn) else {
            return;
        };
        tracing::debug!(
            target = "rendezvous::pool",
            connection = %conn.id(),
            offer_id = %offer_id,
            "connection removed"
        );
        self.emit(PoolEvent::ConnectionRemoved {
            offer_id,
            connection: conn.id(),
        });
        if self.is_running() {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.fill_offers().await;
            });
        }
    }
}

enum Watch {
    Continue,
    Done,
}

async fn on_state(pool: &OfferPool, conn: &Connection, state: ConnectionState) -> Watch {
    match state {
        ConnectionState::Connected => {
            tracing::info!(
                target = "rendezvous::pool",
                connection = %conn.id(),
                offer_id = %conn.offer_id(),
                peer = ?conn.peer_identity(),
                "connection opened"
            );
            pool.emit(PoolEvent::ConnectionOpened {
                offer_id: conn.offer_id(),
                connection: conn.clone(),
                matched_tags: conn.matched_tags(),
            });
        }
        ConnectionState::Failed => pool.rotate(conn).await,
        ConnectionState::Closed => {
            pool.on_connection_closed(conn).await;
            return Watch::Done;
        }
        _ => {}
    }
    Watch::Continue
}

async fn watch_connection(
    weak: Weak<PoolInner>,
    conn: Connection,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        let state = match events.recv().await {
            Ok(ConnectionEvent::StateChanged { to, .. }) => to,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => conn.state(),
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(pool) = weak.upgrade().map(OfferPool::from_inner) else {
            break;
        };
        if let Watch::Done = on_state(&pool, &conn, state).await {
            break;
        }
    }
}

async fn dispatch_poll_events(weak: Weak<PoolInner>, mut events: broadcast::Receiver<PollEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    target = "rendezvous::pool",
                    skipped,
                    "poll events lagged"
                );
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(pool) = weak.upgrade().map(OfferPool::from_inner) else {
            break;
        };
        match event {
            PollEvent::Answer(answer) => {
                // Rejections are already logged and emitted by the handler.
                let _ = pool.handle_poll_answer(&answer).await;
            }
            PollEvent::Ice {
                offer_id,
                candidates,
            } => {
                pool.handle_poll_ice(&offer_id, &candidates).await;
            }
            PollEvent::Error(_) => {}
        }
    }
}
