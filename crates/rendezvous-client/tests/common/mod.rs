#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rendezvous_client::signaling::memory::MemoryRendezvous;
use rendezvous_client::transport::mock::MockTransportFactory;
use rendezvous_client::{ClientConfig, RendezvousClient};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.polling.interval = Duration::from_millis(50);
    config.pool.max_offers = 2;
    config
}

pub async fn client(
    server: &MemoryRendezvous,
    name: &str,
    factory: &Arc<MockTransportFactory>,
    config: ClientConfig,
) -> RendezvousClient {
    RendezvousClient::new(Arc::new(server.session(name)), factory.clone(), config)
        .await
        .expect("client")
}

/// Sleeps in small steps until `check` holds; the test timeout bounds the wait.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
