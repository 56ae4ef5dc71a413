//! In-memory transports for tests and simulations.
//!
//! Offers and answers produced by one [`MockTransportFactory`] can find each other: when
//! an offering transport applies an answer created from its own SDP, the pair is linked
//! and, unless the factory is in manual mode, both sides walk through checking and
//! connected with open data channels that deliver to each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChannelEvent, DataChannel, IceCandidate, LocalAnswer, LocalOffer, PeerTransport,
    TransportEvent, TransportFactory, TransportId, TransportState, next_transport_id,
};
use crate::error::TransportError;

const CHANNEL_LABEL: &str = "rendezvous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRole {
    Offer,
    Answer,
}

#[derive(Default)]
struct MockNetwork {
    transports: Mutex<HashMap<TransportId, Arc<MockTransport>>>,
    manual: bool,
    hold_gathering: AtomicBool,
}

pub struct MockTransport {
    id: TransportId,
    role: MockRole,
    network: Weak<MockNetwork>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    channel: Mutex<Option<Arc<MockDataChannel>>>,
    peer: Mutex<Weak<MockTransport>>,
    remote_description: Mutex<Option<String>>,
    answers_applied: AtomicUsize,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    fail_apply: AtomicBool,
    fail_candidates: AtomicUsize,
    closed: AtomicBool,
}

impl MockTransport {
    fn new(role: MockRole, network: Weak<MockNetwork>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: next_transport_id(),
            role,
            network,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            channel: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
            remote_description: Mutex::new(None),
            answers_applied: AtomicUsize::new(0),
            remote_candidates: Mutex::new(Vec::new()),
            fail_apply: AtomicBool::new(false),
            fail_candidates: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> MockRole {
        self.role
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_state(&self, state: TransportState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    /// Hands a remotely opened channel to whoever owns this transport.
    pub fn announce_channel(&self, channel: Arc<MockDataChannel>) {
        *self.channel.lock() = Some(Arc::clone(&channel));
        self.emit(TransportEvent::DataChannel(channel));
    }

    pub fn channel(&self) -> Option<Arc<MockDataChannel>> {
        self.channel.lock().clone()
    }

    pub fn peer(&self) -> Option<Arc<MockTransport>> {
        self.peer.lock().upgrade()
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_description.lock().clone()
    }

    pub fn answers_applied(&self) -> usize {
        self.answers_applied.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn fail_next_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    /// The next `count` remote candidates are rejected.
    pub fn fail_next_candidates(&self, count: usize) {
        self.fail_candidates.store(count, Ordering::SeqCst);
    }

    /// Ends a gathering held back by [`MockTransportFactory::hold_gathering`].
    pub fn finish_gathering(&self) {
        self.emit(TransportEvent::GatheringComplete);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn offer_sdp(&self) -> String {
        format!("mock-offer:{}", self.id.0)
    }

    fn answer_sdp(&self, offer: TransportId) -> String {
        format!("mock-answer:{}:{}", self.id.0, offer.0)
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            self.id.0,
            40_000 + self.id.0 % 20_000
        ))
    }

    fn gather(&self) {
        self.emit(TransportEvent::GatheringStarted);
        self.emit(TransportEvent::LocalCandidate(self.local_candidate()));
        let held = self
            .network
            .upgrade()
            .is_some_and(|network| network.hold_gathering.load(Ordering::SeqCst));
        if !held {
            self.emit(TransportEvent::GatheringComplete);
        }
    }

    fn link(offer: &Arc<MockTransport>, answer: &Arc<MockTransport>, drive: bool) {
        *offer.peer.lock() = Arc::downgrade(answer);
        *answer.peer.lock() = Arc::downgrade(offer);
        if !drive {
            return;
        }

        let offer_channel = offer.channel();
        let answer_channel = MockDataChannel::new(CHANNEL_LABEL);
        if let Some(offer_channel) = offer_channel.as_ref() {
            MockDataChannel::pair(offer_channel, &answer_channel);
        }

        for transport in [offer, answer] {
            transport.set_state(TransportState::Checking);
            transport.set_state(TransportState::Connected);
        }
        answer.announce_channel(Arc::clone(&answer_channel));
        if let Some(offer_channel) = offer_channel {
            offer_channel.open();
        }
        answer_channel.open();
    }
}

fn parse_answer_sdp(sdp: &str) -> Option<(u64, u64)> {
    let rest = sdp.strip_prefix("mock-answer:")?;
    let (answer, offer) = rest.split_once(':')?;
    Some((answer.parse().ok()?, offer.parse().ok()?))
}

fn parse_offer_sdp(sdp: &str) -> Option<u64> {
    sdp.strip_prefix("mock-offer:")?.parse().ok()
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        if self.fail_apply.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Setup("injected remote description failure".into()));
        }

        let linked = match parse_answer_sdp(sdp) {
            Some((_, offer)) if offer != self.id.0 => {
                return Err(TransportError::Setup(format!(
                    "answer targets transport {offer}, not {}",
                    self.id.0
                )));
            }
            Some((answer, _)) => Some(TransportId(answer)),
            None => None,
        };

        *self.remote_description.lock() = Some(sdp.to_owned());
        self.answers_applied.fetch_add(1, Ordering::SeqCst);

        if let (Some(answer_id), Some(network)) = (linked, self.network.upgrade()) {
            let (offer, answer) = {
                let transports = network.transports.lock();
                (
                    transports.get(&self.id).cloned(),
                    transports.get(&answer_id).cloned(),
                )
            };
            if let (Some(offer), Some(answer)) = (offer, answer) {
                MockTransport::link(&offer, &answer, !network.manual);
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let rejected = self
            .fail_candidates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(TransportError::Setup("injected candidate failure".into()));
        }
        self.remote_candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = self.channel() {
            channel.close().await;
        }
        if let Some(peer) = self.peer() {
            peer.set_state(TransportState::Disconnected);
        }
    }
}

pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    peer: Mutex<Weak<MockDataChannel>>,
    sent: Mutex<Vec<Bytes>>,
    fail_sends: AtomicBool,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_owned(),
            open: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn pair(a: &Arc<MockDataChannel>, b: &Arc<MockDataChannel>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    pub fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    /// Simulates the remote end going away.
    pub fn remote_close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(ChannelEvent::Closed);
        }
    }

    pub fn deliver(&self, payload: Bytes) {
        let _ = self.events_tx.send(ChannelEvent::Message(payload));
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Setup("injected send failure".into()));
        }
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.sent.lock().push(data.clone());
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.deliver(data);
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.remote_close();
        }
    }
}

/// Factory handing out linked [`MockTransport`]s.
pub struct MockTransportFactory {
    network: Arc<MockNetwork>,
    created: Mutex<Vec<Arc<MockTransport>>>,
    fail_offers: AtomicUsize,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::with_network(MockNetwork::default())
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linked pairs stay in `New` until the test drives their state.
    pub fn manual() -> Self {
        Self::with_network(MockNetwork {
            manual: true,
            ..MockNetwork::default()
        })
    }

    fn with_network(network: MockNetwork) -> Self {
        Self {
            network: Arc::new(network),
            created: Mutex::new(Vec::new()),
            fail_offers: AtomicUsize::new(0),
        }
    }

    /// Transports created from now on start gathering but never finish on their own.
    pub fn hold_gathering(&self) {
        self.network.hold_gathering.store(true, Ordering::SeqCst);
    }

    /// The next `count` calls to `create_offer` fail.
    pub fn fail_next_offers(&self, count: usize) {
        self.fail_offers.store(count, Ordering::SeqCst);
    }

    pub fn offers(&self) -> Vec<Arc<MockTransport>> {
        self.by_role(MockRole::Offer)
    }

    pub fn answers(&self) -> Vec<Arc<MockTransport>> {
        self.by_role(MockRole::Answer)
    }

    pub fn transport(&self, id: TransportId) -> Option<Arc<MockTransport>> {
        self.network.transports.lock().get(&id).cloned()
    }

    /// Offering transport that produced `sdp`.
    pub fn offer_for_sdp(&self, sdp: &str) -> Option<Arc<MockTransport>> {
        parse_offer_sdp(sdp).and_then(|id| self.transport(TransportId(id)))
    }

    fn by_role(&self, role: MockRole) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|transport| transport.role == role)
            .cloned()
            .collect()
    }

    fn register(&self, transport: &Arc<MockTransport>) {
        self.network
            .transports
            .lock()
            .insert(transport.id, Arc::clone(transport));
        self.created.lock().push(Arc::clone(transport));
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_offer(&self) -> Result<LocalOffer, TransportError> {
        let failed = self
            .fail_offers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Setup("injected offer failure".into()));
        }

        let transport = MockTransport::new(MockRole::Offer, Arc::downgrade(&self.network));
        let channel = MockDataChannel::new(CHANNEL_LABEL);
        *transport.channel.lock() = Some(Arc::clone(&channel));
        transport.gather();
        self.register(&transport);

        Ok(LocalOffer {
            sdp: transport.offer_sdp(),
            transport,
            channel: Some(channel),
        })
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<LocalAnswer, TransportError> {
        let offer_id = parse_offer_sdp(offer_sdp)
            .ok_or_else(|| TransportError::Setup(format!("unrecognised offer: {offer_sdp}")))?;
        let transport = MockTransport::new(MockRole::Answer, Arc::downgrade(&self.network));
        *transport.remote_description.lock() = Some(offer_sdp.to_owned());
        transport.gather();
        self.register(&transport);

        Ok(LocalAnswer {
            sdp: transport.answer_sdp(TransportId(offer_id)),
            transport,
        })
    }
}
