//! Main Gateway implementation
//!
//! The facade owning every moving part: the protocol client and its
//! session, the channel cache, the per-recipient send queues, and the
//! background sync tasks. `start` brings the whole engine up; `submit`
//! is the ingestion contract; `stop` drains and shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::client::http::HttpTransport;
use crate::client::sync::{run_event_consumer, run_sync_loop};
use crate::client::transport::Transport;
use crate::client::MatrixClient;
use crate::data;
use crate::queue::SendQueues;
use crate::resolver::ChannelCache;

use super::config::GatewayConfig;
use super::error::GatewayError;
use super::types::{
    current_timestamp, DeliveryFailure, DeliveryJob, DeliveryOutcome, MessageId, Payload,
    Recipient,
};

/// The Courier gateway
///
/// This is the main entry point: start it, submit deliveries, stop it.
pub struct Gateway {
    config: GatewayConfig,
    client: Arc<MatrixClient>,
    cache: Arc<ChannelCache>,
    queues: Arc<SendQueues>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Start the gateway against the configured homeserver.
    ///
    /// Opens the session database, resumes or establishes the protocol
    /// session, warms the channel cache, and spawns the background sync
    /// tasks.
    pub async fn start(config: GatewayConfig) -> Result<Self, GatewayError> {
        let transport = Arc::new(
            HttpTransport::new(
                &config.homeserver_url,
                Duration::from_secs(config.request_timeout_secs),
            )
            .map_err(|e| GatewayError::StartFailed(e.to_string()))?,
        );
        Self::start_with_transport(config, transport).await
    }

    /// Start with a caller-provided transport (tests use the mock).
    pub async fn start_with_transport(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, GatewayError> {
        let db_path = config.db_path.clone().unwrap_or_else(data::default_db_path);
        let conn = data::open_db(&db_path)?;
        let db = Arc::new(Mutex::new(conn));

        let client = Arc::new(MatrixClient::connect(transport, db, &config).await?);
        let cache = Arc::new(ChannelCache::new());
        cache.warm_from_db(&client).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queues = Arc::new(SendQueues::new(
            client.clone(),
            cache.clone(),
            &config,
            shutdown_rx.clone(),
        ));

        // One producer draining the network sync stream, one consumer
        // acting on its events; the bounded channel applies back-pressure
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let sync_task = tokio::spawn(run_sync_loop(
            client.clone(),
            event_tx,
            shutdown_rx.clone(),
        ));
        let consumer_task = tokio::spawn(run_event_consumer(
            client.clone(),
            cache.clone(),
            event_rx,
            shutdown_rx,
        ));

        info!(
            user_id = %client.user_id().await,
            db_path = %db_path.display(),
            "gateway started"
        );

        Ok(Self {
            config,
            client,
            cache,
            queues,
            shutdown_tx,
            tasks: Mutex::new(vec![sync_task, consumer_task]),
        })
    }

    /// Submit a delivery and wait for its terminal outcome.
    ///
    /// This boundary is synchronous: the call suspends until the job
    /// succeeds or fails terminally, so fatal outcomes (including a
    /// transient failure exhausting its retry budget) surface here as
    /// `Rejected`. Callers integrating an asynchronous boundary should
    /// use [`Gateway::enqueue`] instead and treat failures as log-only.
    pub async fn submit(
        &self,
        recipient: Option<Recipient>,
        payload: Payload,
    ) -> DeliveryOutcome {
        let rx = match self.enqueue(recipient, payload).await {
            Ok(rx) => rx,
            Err(reason) => return DeliveryOutcome::Rejected(reason),
        };

        match rx.await {
            Ok(Ok(message_id)) => DeliveryOutcome::Accepted(message_id),
            Ok(Err(failure)) => DeliveryOutcome::Rejected(failure.reason),
            Err(_) => DeliveryOutcome::Rejected("delivery abandoned during shutdown".to_string()),
        }
    }

    /// Validate and hand a delivery to its recipient's queue without
    /// waiting for the outcome.
    ///
    /// Returns the receiver for the job's terminal outcome; enqueue
    /// order is delivery order within a recipient.
    pub async fn enqueue(
        &self,
        recipient: Option<Recipient>,
        payload: Payload,
    ) -> Result<oneshot::Receiver<Result<MessageId, DeliveryFailure>>, String> {
        if recipient.is_none() && self.config.management_channel.is_none() {
            return Err("no recipient given and no management channel configured".to_string());
        }
        if payload.is_empty() {
            return Err("empty payload".to_string());
        }
        if let Payload::Media { filename, .. } = &payload {
            match filename.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {}
                _ => {
                    return Err(format!(
                        "media filename '{}' has no extension",
                        filename
                    ))
                }
            }
        }

        let job = DeliveryJob {
            recipient,
            payload,
            received_at: current_timestamp(),
        };
        Ok(self.queues.enqueue(job).await)
    }

    /// The account the gateway is signed in as.
    pub async fn user_id(&self) -> String {
        self.client.user_id().await
    }

    /// The active configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Number of recipient queues spawned so far.
    pub async fn queue_count(&self) -> usize {
        self.queues.worker_count().await
    }

    /// Number of cached recipient channels.
    pub async fn cached_channels(&self) -> usize {
        self.cache.len().await
    }

    /// Stop the gateway.
    ///
    /// In-flight sends get a bounded drain window to finish; queued but
    /// unstarted jobs are discarded and their submitters see a rejection.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        self.queues
            .drain(Duration::from_secs(self.config.drain_timeout_secs))
            .await;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        info!("gateway stopped");
    }
}
