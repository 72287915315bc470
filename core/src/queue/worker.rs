//! Per-recipient send worker
//!
//! One sequential worker per recipient queue. The worker owns the
//! recipient's delivery order: it takes one job at a time and retries it
//! in place until a terminal outcome, so at most one send is in flight
//! per recipient and jobs can never overtake each other.
//!
//! State machine per job: `Idle -> Sending -> (Idle | BackoffWait -> Sending)`.
//! Backoff waits race against shutdown so stopping stays responsive.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::client::transport::ContentUri;
use crate::client::{MatrixClient, ResolveError, SendError};
use crate::gateway::{ChannelId, DeliveryFailure, DeliveryJob, MessageId, Payload, Recipient};
use crate::resolver::ChannelCache;

use super::backoff::backoff_delay;

/// A job queued for a recipient, with its completion notifier
pub(crate) struct QueueEntry {
    pub job: DeliveryJob,
    pub done: oneshot::Sender<Result<MessageId, DeliveryFailure>>,
}

/// Shared collaborators and settings for every worker
pub(crate) struct WorkerContext {
    pub client: Arc<MatrixClient>,
    pub cache: Arc<ChannelCache>,
    pub management_channel: Option<ChannelId>,
    pub max_retry_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// Delivery state of a worker, for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Sending,
    BackoffWait,
}

/// Outcome of a single delivery attempt
enum AttemptError {
    Transient {
        reason: String,
        floor: Option<Duration>,
    },
    Fatal {
        reason: String,
    },
}

/// Run one recipient's queue until shutdown or queue closure.
pub(crate) async fn run_worker(
    key: String,
    ctx: Arc<WorkerContext>,
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(recipient = %key, "send worker started");

    loop {
        trace!(recipient = %key, state = ?WorkerState::Idle, "waiting for next job");
        let entry = tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
            changed = shutdown.changed() => {
                // a closed shutdown channel means the gateway is gone
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        if !process_entry(&key, &ctx, entry, &mut shutdown).await {
            // shutdown interrupted the in-flight job
            break;
        }
    }

    // Queued-but-not-started jobs are discarded on shutdown; dropping
    // their notifiers surfaces the loss to waiting submitters.
    debug!(recipient = %key, "send worker stopped");
}

/// Drive one job to a terminal outcome. Returns false when shutdown
/// interrupted the job.
async fn process_entry(
    key: &str,
    ctx: &WorkerContext,
    entry: QueueEntry,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let job = entry.job;
    let txn_id = uuid::Uuid::new_v4().to_string();
    let mut upload: Option<ContentUri> = None;
    let mut retries: u32 = 0;

    loop {
        debug!(
            recipient = %key,
            txn_id = %txn_id,
            retries = retries,
            state = ?WorkerState::Sending,
            "sending"
        );

        match deliver_once(ctx, &job, &txn_id, &mut upload).await {
            Ok(message_id) => {
                info!(
                    recipient = %key,
                    message_id = %message_id,
                    retries = retries,
                    "delivered"
                );
                let _ = entry.done.send(Ok(message_id));
                return true;
            }
            Err(AttemptError::Fatal { reason }) => {
                warn!(recipient = %key, reason = %reason, "delivery failed fatally");
                let _ = entry.done.send(Err(DeliveryFailure { reason }));
                return true;
            }
            Err(AttemptError::Transient { reason, floor }) => {
                retries += 1;
                if retries > ctx.max_retry_attempts {
                    // retry budget exhausted: the failure becomes fatal
                    let reason = format!(
                        "giving up after {} attempts: {}",
                        retries, reason
                    );
                    warn!(recipient = %key, reason = %reason, "retry limit exceeded");
                    let _ = entry.done.send(Err(DeliveryFailure { reason }));
                    return true;
                }

                let delay =
                    backoff_delay(retries, ctx.base_backoff, ctx.max_backoff, floor);
                debug!(
                    recipient = %key,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    state = ?WorkerState::BackoffWait,
                    reason = %reason,
                    "transient failure, backing off"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            let _ = entry.done.send(Err(DeliveryFailure {
                                reason: "gateway shutting down".to_string(),
                            }));
                            return false;
                        }
                    }
                }
            }
        }
    }
}

/// One delivery attempt: resolve the channel, then send the payload.
async fn deliver_once(
    ctx: &WorkerContext,
    job: &DeliveryJob,
    txn_id: &str,
    upload: &mut Option<ContentUri>,
) -> Result<MessageId, AttemptError> {
    let (channel, cached_user) = match &job.recipient {
        None => match &ctx.management_channel {
            Some(channel) => (channel.clone(), false),
            None => {
                return Err(AttemptError::Fatal {
                    reason: "no management channel configured".to_string(),
                })
            }
        },
        Some(Recipient::Channel(channel)) => (channel.clone(), false),
        Some(Recipient::User(user_id)) => {
            match ctx.cache.resolve(&ctx.client, user_id).await {
                Ok(channel) => (channel, true),
                Err(ResolveError::RecipientUnknown(reason)) => {
                    return Err(AttemptError::Fatal { reason })
                }
                Err(ResolveError::CreateFailed(reason)) => {
                    return Err(AttemptError::Transient {
                        reason,
                        floor: None,
                    })
                }
            }
        }
    };

    let result = match &job.payload {
        Payload::Text(text) => ctx.client.send_text(&channel, text, txn_id).await,
        Payload::Media {
            bytes,
            content_type,
            filename,
        } => {
            ctx.client
                .send_media(&channel, bytes, content_type, filename, txn_id, upload)
                .await
        }
    };

    match result {
        Ok(message_id) => Ok(message_id),
        Err(SendError::Transient {
            reason,
            retry_after,
        }) => Err(AttemptError::Transient {
            reason,
            floor: retry_after,
        }),
        Err(SendError::Fatal {
            reason,
            channel_stale,
        }) => {
            if channel_stale && cached_user {
                // next resolve for this user re-creates the channel
                ctx.cache.invalidate_channel(&ctx.client, &channel).await;
            }
            Err(AttemptError::Fatal { reason })
        }
    }
}
