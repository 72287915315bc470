//! Per-recipient send queues
//!
//! One ordered queue per recipient identity, each drained by its own
//! sequential worker. Queues for different recipients run concurrently;
//! within a recipient, delivery order is submission order, preserved
//! across retries. Deliveries without a recipient share one dedicated
//! queue keyed by the management sentinel.

mod backoff;
mod worker;

pub use backoff::{backoff_delay, base_delay};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::MatrixClient;
use crate::gateway::{
    queue_key, ChannelId, DeliveryFailure, DeliveryJob, GatewayConfig, MessageId,
};
use crate::resolver::ChannelCache;

use worker::{run_worker, QueueEntry, WorkerContext};

/// The set of per-recipient send queues
pub struct SendQueues {
    ctx: Arc<WorkerContext>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<QueueEntry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Receiver<bool>,
}

impl SendQueues {
    pub fn new(
        client: Arc<MatrixClient>,
        cache: Arc<ChannelCache>,
        config: &GatewayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            client,
            cache,
            management_channel: config
                .management_channel
                .as_ref()
                .map(|c| ChannelId::new(c.clone())),
            max_retry_attempts: config.max_retry_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        });
        Self {
            ctx,
            workers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Hand a job to its recipient's queue.
    ///
    /// Returns immediately with the receiver for the job's terminal
    /// outcome. A dropped receiver-side sender (worker gone at
    /// shutdown) surfaces as a rejection to the awaiting submitter.
    pub async fn enqueue(
        &self,
        job: DeliveryJob,
    ) -> oneshot::Receiver<Result<MessageId, DeliveryFailure>> {
        let (done_tx, done_rx) = oneshot::channel();

        if *self.shutdown.borrow() {
            let _ = done_tx.send(Err(DeliveryFailure {
                reason: "gateway shutting down".to_string(),
            }));
            return done_rx;
        }

        let key = queue_key(&job.recipient);
        let entry = QueueEntry { job, done: done_tx };

        let tx = self.worker_for(&key).await;
        if let Err(mpsc::error::SendError(entry)) = tx.send(entry) {
            let _ = entry.done.send(Err(DeliveryFailure {
                reason: "gateway shutting down".to_string(),
            }));
        }

        done_rx
    }

    /// Number of recipient queues spawned so far.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Wait for workers to drain in-flight sends, bounded by `timeout`;
    /// whatever is still running afterwards is aborted.
    pub async fn drain(&self, timeout: Duration) {
        let mut tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = 0usize;
        for task in &mut tasks {
            if tokio::time::timeout_at(deadline, &mut *task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }

        if aborted == 0 {
            info!("send queues drained");
        } else {
            debug!(aborted = aborted, "drain timeout elapsed, abandoned in-flight sends");
        }
    }

    async fn worker_for(&self, key: &str) -> mpsc::UnboundedSender<QueueEntry> {
        let mut workers = self.workers.lock().await;
        if let Some(tx) = workers.get(key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(
            key.to_string(),
            self.ctx.clone(),
            rx,
            self.shutdown.clone(),
        ));
        self.tasks.lock().await.push(handle);
        workers.insert(key.to_string(), tx.clone());
        tx
    }
}
