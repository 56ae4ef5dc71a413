//! One shared poller per client. Each tick asks the server for everything newer than the
//! watermark and fans the results out as [`PollEvent`]s; consumers filter by offer id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backoff::ExponentialBackoff;
use crate::config::PollingConfig;
use crate::error::SignalingError;
use crate::signaling::{PolledAnswer, RemoteCandidate, Signaling, Timestamp};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Answer(PolledAnswer),
    Ice {
        offer_id: String,
        candidates: Vec<RemoteCandidate>,
    },
    /// A poll request failed; polling carries on.
    Error(String),
}

struct PollingInner {
    signaling: Arc<dyn Signaling>,
    config: PollingConfig,
    watermark: AtomicU64,
    events: broadcast::Sender<PollEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PollingInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct PollingManager {
    inner: Arc<PollingInner>,
}

impl std::fmt::Debug for PollingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingManager")
            .field("watermark", &self.watermark())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PollingManager {
    pub fn new(signaling: Arc<dyn Signaling>, config: PollingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PollingInner {
                signaling,
                config,
                watermark: AtomicU64::new(0),
                events,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.inner.events.subscribe()
    }

    /// Latest server timestamp seen in any poll result. Never decreases.
    pub fn watermark(&self) -> Timestamp {
        self.inner.watermark.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Starts the poll loop. The first poll runs immediately. Calling it again while
    /// running does nothing.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        tracing::debug!(
            target = "rendezvous::polling",
            interval_ms = self.inner.config.interval.as_millis() as u64,
            "polling started"
        );
        *task = Some(tokio::spawn(run_poll_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.clone(),
        )));
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
            tracing::debug!(target = "rendezvous::polling", "polling stopped");
        }
    }

    /// Runs one poll round trip and publishes its results. Returns the number of events
    /// emitted.
    pub async fn poll_once(&self) -> Result<usize, SignalingError> {
        let since = self.watermark();
        let batch = match self.inner.signaling.poll(since).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(
                    target = "rendezvous::polling",
                    since,
                    error = %err,
                    "poll failed"
                );
                let _ = self.inner.events.send(PollEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let mut emitted = 0;
        for answer in batch.answers {
            self.inner
                .watermark
                .fetch_max(answer.answered_at, Ordering::SeqCst);
            tracing::trace!(
                target = "rendezvous::polling",
                offer_id = %answer.offer_id,
                answered_at = answer.answered_at,
                "answer polled"
            );
            let _ = self.inner.events.send(PollEvent::Answer(answer));
            emitted += 1;
        }
        for (offer_id, candidates) in batch.ice_candidates {
            if candidates.is_empty() {
                continue;
            }
            if let Some(latest) = candidates.iter().map(|c| c.created_at).max() {
                self.inner.watermark.fetch_max(latest, Ordering::SeqCst);
            }
            let _ = self.inner.events.send(PollEvent::Ice {
                offer_id,
                candidates,
            });
            emitted += 1;
        }
        Ok(emitted)
    }
}

async fn run_poll_loop(weak: Weak<PollingInner>, config: PollingConfig) {
    let mut backoff = ExponentialBackoff::new(config.error_backoff);
    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let manager = PollingManager { inner };
        let delay = match manager.poll_once().await {
            Ok(_) => {
                backoff.reset();
                config.interval
            }
            Err(_) => config.interval.max(backoff.next()),
        };
        drop(manager);
        tokio::time::sleep(delay).await;
    }
}
