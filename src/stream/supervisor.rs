use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::FollowRegistry;
use crate::stream::router::EventRouter;
use crate::stream::worker;
use crate::upstream::StreamSource;

/// Sleep between unsuccessful queue polls. Polling is non-blocking; this is
/// the cooperative yield that keeps the rest of the bot responsive.
const POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Bounded backoff for restarts after a worker death.
const RESTART_DELAY: Duration = Duration::from_secs(2);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(64);

/// Parent-side lifecycle manager for the stream worker.
///
/// At most one worker is alive at a time. The supervisor owns the queue,
/// polls it cooperatively, detects worker death and restarts with bounded
/// backoff. `start` is not safe against overlapping calls; command handlers
/// run on the dispatcher and the poller only restarts after clearing its own
/// worker, which is all the serialization this needs.
pub struct StreamSupervisor {
    source: Arc<dyn StreamSource>,
    registry: Arc<Mutex<FollowRegistry>>,
    router: Arc<EventRouter>,
    active: Mutex<Option<ActiveStream>>,
    restart_attempts: AtomicU32,
}

struct ActiveStream {
    /// Feed ids the worker was launched with. Starting again with an
    /// identical set is a no-op: reconnecting with the same filter list
    /// risks upstream rate limiting.
    snapshot: BTreeSet<String>,
    worker: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl StreamSupervisor {
    pub fn new(
        source: Arc<dyn StreamSource>,
        registry: Arc<Mutex<FollowRegistry>>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            source,
            registry,
            router,
            active: Mutex::new(None),
            restart_attempts: AtomicU32::new(0),
        }
    }

    /// Whether a worker is currently alive.
    pub async fn is_online(&self) -> bool {
        match self.active.lock().await.as_ref() {
            Some(stream) => !stream.worker.is_finished(),
            None => false,
        }
    }

    /// Starts (or restarts) the worker for the current follow set. No-op
    /// when a live worker already covers exactly that set; stops outright
    /// when the set is empty.
    pub async fn start(self: &Arc<Self>) {
        let follows = self.registry.lock().await.feed_ids();

        let mut active = self.active.lock().await;
        if let Some(stream) = active.as_ref() {
            if !stream.worker.is_finished() && stream.snapshot == follows {
                return;
            }
        }
        if let Some(stream) = active.take() {
            info!("Replacing stream worker");
            stream.worker.abort();
            stream.poller.abort();
        }
        if follows.is_empty() {
            return;
        }

        *active = Some(self.spawn(follows));
    }

    /// Terminates the worker, cancels the poller and releases the queue.
    /// Idempotent: calling while already stopped does nothing.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(stream) = active.take() {
            info!("Stopping stream worker");
            stream.worker.abort();
            stream.poller.abort();
        }
    }

    fn spawn(self: &Arc<Self>, follows: BTreeSet<String>) -> ActiveStream {
        info!("Starting stream worker for {} feed(s)", follows.len());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker::run(
            self.source.clone(),
            follows.iter().cloned().collect(),
            tx,
        ));
        let poller = tokio::spawn(Self::poll_loop(self.clone(), rx));
        ActiveStream {
            snapshot: follows,
            worker,
            poller,
        }
    }

    /// Cooperative polling daemon: non-blocking dequeue, fixed sleep on
    /// empty, restart on a dead queue. Runs until the supervisor aborts it
    /// or the worker dies.
    async fn poll_loop(self: Arc<Self>, mut rx: UnboundedReceiver<String>) {
        loop {
            match rx.try_recv() {
                Ok(frame) => {
                    self.restart_attempts.store(0, Ordering::Relaxed);
                    self.router.handle_frame(&frame).await;
                }
                Err(TryRecvError::Empty) => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(TryRecvError::Disconnected) => {
                    // Sender gone with the queue drained: the worker is dead.
                    warn!("Stream worker died, restarting");
                    self.restart_after_death().await;
                    return;
                }
            }
        }
    }

    /// Teardown + start, called from inside the dying stream's own poller.
    /// Only the worker handle is aborted here; the poller is the current
    /// task and returns right after.
    async fn restart_after_death(self: &Arc<Self>) {
        {
            let mut active = self.active.lock().await;
            if let Some(stream) = active.take() {
                stream.worker.abort();
            }
        }
        let attempt = self.restart_attempts.fetch_add(1, Ordering::Relaxed);
        let delay = RESTART_DELAY
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_RESTART_DELAY);
        tokio::time::sleep(delay).await;
        self.start().await;
    }
}
