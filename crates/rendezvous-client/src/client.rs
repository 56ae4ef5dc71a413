use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ClientConfig;
use crate::connection::{AnswererContext, Connection, ConnectionState};
use crate::error::RendezvousError;
use crate::polling::PollingManager;
use crate::pool::OfferPool;
use crate::signaling::{DiscoveredOffer, Signaling};
use crate::transport::TransportFactory;

/// Entry point tying a signaling session, a transport factory and one shared poller
/// together.
///
/// Hosting goes through [`publish`](Self::publish), which returns a running
/// [`OfferPool`]; joining goes through [`connect`](Self::connect), which answers a
/// discovered offer.
pub struct RendezvousClient {
    signaling: Arc<dyn Signaling>,
    factory: Arc<dyn TransportFactory>,
    config: ClientConfig,
    identity: String,
    polling: PollingManager,
    pools: Mutex<Vec<OfferPool>>,
    connections: Mutex<Vec<Connection>>,
}

impl std::fmt::Debug for RendezvousClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousClient")
            .field("identity", &self.identity)
            .field("pools", &self.pools.lock().len())
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl RendezvousClient {
    /// Resolves this peer's identity up front; everything else is lazy.
    pub async fn new(
        signaling: Arc<dyn Signaling>,
        factory: Arc<dyn TransportFactory>,
        config: ClientConfig,
    ) -> Result<Self, RendezvousError> {
        let identity = signaling.identity().await?;
        tracing::info!(target = "rendezvous::client", identity = %identity, "client ready");
        let polling = PollingManager::new(Arc::clone(&signaling), config.polling.clone());
        Ok(Self {
            signaling,
            factory,
            config,
            identity,
            polling,
            pools: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn polling(&self) -> &PollingManager {
        &self.polling
    }

    /// Starts hosting under `tags`: publishes a pool of offers and begins polling for
    /// their answers.
    pub async fn publish(&self, tags: Vec<String>) -> OfferPool {
        let pool = OfferPool::new(
            Arc::clone(&self.signaling),
            Arc::clone(&self.factory),
            tags,
            self.config.pool.clone(),
        );
        pool.attach(&self.polling);
        self.pools.lock().push(pool.clone());
        pool.start().await;
        self.polling.start();
        pool
    }

    /// Open offers matching any of `tags`, excluding this peer's own.
    pub async fn discover(
        &self,
        tags: &[String],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DiscoveredOffer>, RendezvousError> {
        let found = self.signaling.discover(tags, limit, offset).await?;
        Ok(found
            .offers
            .into_iter()
            .filter(|offer| offer.owner != self.identity)
            .collect())
    }

    fn answerer_context(&self) -> AnswererContext {
        AnswererContext {
            signaling: Arc::clone(&self.signaling),
            factory: Arc::clone(&self.factory),
            polling: Some(self.polling.clone()),
            poll_interval: self.config.polling.interval,
            config: self.config.connection.clone(),
            discover_limit: self.config.discover_limit,
        }
    }

    /// Answers the first usable offer under `tags`, optionally only from `peer`.
    ///
    /// Offers are tried in discovery order; one that was answered by someone else in
    /// the meantime is skipped.
    pub async fn connect(
        &self,
        tags: Vec<String>,
        peer: Option<&str>,
    ) -> Result<Connection, RendezvousError> {
        let offers: Vec<DiscoveredOffer> = self
            .discover(&tags, self.config.discover_limit, 0)
            .await?
            .into_iter()
            .filter(|offer| peer.is_none_or(|peer| offer.owner == peer))
            .collect();
        if offers.is_empty() {
            return Err(RendezvousError::NoOffersFound { tags });
        }

        self.polling.start();
        let mut last_error = None;
        for offer in &offers {
            match Connection::answer(offer, tags.clone(), self.answerer_context()).await {
                Ok(conn) => {
                    tracing::info!(
                        target = "rendezvous::client",
                        offer_id = %offer.offer_id,
                        peer = %offer.owner,
                        connection = %conn.id(),
                        "answered offer"
                    );
                    let mut connections = self.connections.lock();
                    connections.retain(|owned| owned.state() != ConnectionState::Closed);
                    connections.push(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    tracing::debug!(
                        target = "rendezvous::client",
                        offer_id = %offer.offer_id,
                        error = %err,
                        "offer unusable; trying next"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(RendezvousError::NoOffersFound { tags }))
    }

    /// Answered connections that have not closed yet.
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections = self.connections.lock();
        connections.retain(|owned| owned.state() != ConnectionState::Closed);
        connections.clone()
    }

    /// Stops polling, stops every pool created by this client and closes the
    /// connections it answered.
    pub async fn shutdown(&self) {
        self.polling.stop();
        let pools: Vec<OfferPool> = std::mem::take(&mut *self.pools.lock());
        for pool in &pools {
            pool.stop().await;
        }
        let connections: Vec<Connection> = std::mem::take(&mut *self.connections.lock());
        for conn in &connections {
            conn.close().await;
        }
        tracing::info!(
            target = "rendezvous::client",
            pools = pools.len(),
            connections = connections.len(),
            "client shut down"
        );
    }
}
