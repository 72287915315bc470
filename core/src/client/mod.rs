//! Protocol client
//!
//! Owns the one authenticated session against the messaging network and
//! exposes the delivery primitives: resolve-or-create a private channel,
//! send text, send media, accept invites. Outbound calls are serialized
//! through one internal path since a single session cannot safely issue
//! concurrent writes.
//!
//! The continuous synchronization loop lives in `client::sync`; the wire
//! itself is behind the `Transport` capability interface.

pub mod http;
pub mod sync;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::data::{load_session, save_session, SessionState};
use crate::gateway::{ChannelId, GatewayConfig, GatewayError, MessageId};

use transport::{ContentUri, SyncBatch, Transport, TransportError};

/// Join attempts for a single invite before giving up
const INVITE_JOIN_ATTEMPTS: u32 = 3;

/// Display name for private channels created on first contact
const PRIVATE_CHANNEL_NAME: &str = "Courier notifications";

/// Error sending into a resolved channel
#[derive(Debug, Clone)]
pub enum SendError {
    /// Worth retrying; `retry_after` is a server-imposed floor if present
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Retrying cannot succeed. `channel_stale` marks failures that mean
    /// the cached channel is gone and must be re-created.
    Fatal {
        reason: String,
        channel_stale: bool,
    },
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Transient { reason, .. } => write!(f, "transient send failure: {}", reason),
            SendError::Fatal { reason, .. } => write!(f, "fatal send failure: {}", reason),
        }
    }
}

impl std::error::Error for SendError {}

/// Error resolving a recipient to a channel
#[derive(Debug, Clone)]
pub enum ResolveError {
    /// The identity does not exist on the network (or the network
    /// permanently refuses a channel for it) — fatal, not retried
    RecipientUnknown(String),
    /// Transient network failure creating the channel — retryable
    CreateFailed(String),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::RecipientUnknown(e) => write!(f, "recipient unknown: {}", e),
            ResolveError::CreateFailed(e) => write!(f, "channel creation failed: {}", e),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Classify a transport failure of a send call.
fn classify_send(err: TransportError) -> SendError {
    match &err {
        TransportError::RateLimited { retry_after_ms } => SendError::Transient {
            reason: err.to_string(),
            retry_after: retry_after_ms.map(Duration::from_millis),
        },
        _ if err.is_transient() => SendError::Transient {
            reason: err.to_string(),
            retry_after: None,
        },
        _ => SendError::Fatal {
            reason: err.to_string(),
            channel_stale: err.is_gone(),
        },
    }
}

/// Classify a transport failure of a channel-creation call.
fn classify_resolve(err: TransportError) -> ResolveError {
    if err.is_transient() {
        ResolveError::CreateFailed(err.to_string())
    } else {
        ResolveError::RecipientUnknown(err.to_string())
    }
}

/// Message kind for a media payload, from filename extension and
/// declared content type.
fn media_msgtype(filename: &str, content_type: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if matches!(extension.as_str(), "jpg" | "jpeg" | "gif" | "png" | "svg") {
        "m.image"
    } else if content_type.starts_with("audio/") {
        "m.audio"
    } else if content_type.starts_with("video/") {
        "m.video"
    } else {
        "m.file"
    }
}

/// The protocol client service
pub struct MatrixClient {
    transport: Arc<dyn Transport>,
    db: Arc<Mutex<Connection>>,
    session: RwLock<SessionState>,
    /// Serializes outbound writes on the single session
    outbound: Mutex<()>,
    sync_timeout_ms: u64,
}

impl std::fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixClient").finish_non_exhaustive()
    }
}

impl MatrixClient {
    /// Establish the session: resume the stored one if its token is
    /// still valid, otherwise log in fresh and persist the result.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        db: Arc<Mutex<Connection>>,
        config: &GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let stored = {
            let conn = db.lock().await;
            load_session(&conn).map_err(|e| GatewayError::Database(e.to_string()))?
        };

        let session = match stored {
            Some(session) if session.user_id == config.user_id => {
                match transport.whoami(&session.access_token).await {
                    Ok(user_id) if user_id == session.user_id => {
                        info!(
                            user_id = %session.user_id,
                            device_id = %session.device_id,
                            "resumed stored session"
                        );
                        session
                    }
                    Ok(user_id) => {
                        warn!(
                            stored = %session.user_id,
                            actual = %user_id,
                            "stored token belongs to a different account, logging in fresh"
                        );
                        Self::login(&*transport, config).await?
                    }
                    Err(err) if err.is_transient() => {
                        return Err(GatewayError::Network(err.to_string()));
                    }
                    Err(err) => {
                        info!(error = %err, "stored session rejected, logging in fresh");
                        Self::login(&*transport, config).await?
                    }
                }
            }
            _ => Self::login(&*transport, config).await?,
        };

        let client = Self {
            transport,
            db,
            session: RwLock::new(session),
            outbound: Mutex::new(()),
            sync_timeout_ms: config.sync_timeout_ms,
        };
        client.persist_session().await;
        Ok(client)
    }

    async fn login(
        transport: &dyn Transport,
        config: &GatewayConfig,
    ) -> Result<SessionState, GatewayError> {
        let login = transport
            .login(&config.user_id, &config.password, &config.device_name)
            .await
            .map_err(|e| match e {
                TransportError::Timeout | TransportError::Network(_) => {
                    GatewayError::Network(e.to_string())
                }
                _ => GatewayError::Auth(e.to_string()),
            })?;

        info!(
            user_id = %login.user_id,
            device_id = %login.device_id,
            "logged in"
        );

        Ok(SessionState {
            user_id: login.user_id,
            device_id: login.device_id,
            access_token: login.access_token,
            since: None,
        })
    }

    /// The account this session is authenticated as.
    pub async fn user_id(&self) -> String {
        self.session.read().await.user_id.clone()
    }

    /// Create a private channel with the recipient invited into it.
    ///
    /// Callers (the resolver) own caching and single-flight; this always
    /// issues one creation call.
    pub async fn create_private_channel(&self, user_id: &str) -> Result<ChannelId, ResolveError> {
        let token = self.session.read().await.access_token.clone();
        let _guard = self.outbound.lock().await;

        let channel = self
            .transport
            .create_private_channel(&token, user_id, PRIVATE_CHANNEL_NAME)
            .await
            .map_err(classify_resolve)?;

        debug!(user_id = %user_id, channel = %channel, "private channel created");
        Ok(channel)
    }

    /// Send text as a non-pinging notice.
    ///
    /// `txn_id` must be stable across retries of the same job so the
    /// server deduplicates resends.
    pub async fn send_text(
        &self,
        channel: &ChannelId,
        text: &str,
        txn_id: &str,
    ) -> Result<MessageId, SendError> {
        let content = serde_json::json!({
            "msgtype": "m.notice",
            "body": text,
        });

        let token = self.session.read().await.access_token.clone();
        let _guard = self.outbound.lock().await;

        self.transport
            .send_event(&token, channel, txn_id, &content)
            .await
            .map_err(classify_send)
    }

    /// Upload media and send a message referencing it.
    ///
    /// `upload` memoizes the content reference across retries: when the
    /// upload step already succeeded for this job, only the message-send
    /// step is re-attempted; the binary is never re-uploaded.
    pub async fn send_media(
        &self,
        channel: &ChannelId,
        bytes: &[u8],
        content_type: &str,
        filename: &str,
        txn_id: &str,
        upload: &mut Option<ContentUri>,
    ) -> Result<MessageId, SendError> {
        let token = self.session.read().await.access_token.clone();

        let content_uri = match upload {
            Some(uri) => {
                debug!(filename = %filename, "reusing uploaded content reference");
                uri.clone()
            }
            None => {
                let _guard = self.outbound.lock().await;
                let uri = self
                    .transport
                    .upload_media(&token, bytes, content_type, filename)
                    .await
                    .map_err(classify_send)?;
                debug!(filename = %filename, uri = %uri.0, size = bytes.len(), "media uploaded");
                *upload = Some(uri.clone());
                uri
            }
        };

        let content = serde_json::json!({
            "msgtype": media_msgtype(filename, content_type),
            "body": filename,
            "url": content_uri.0,
            "info": {
                "mimetype": content_type,
                "size": bytes.len(),
            },
        });

        let _guard = self.outbound.lock().await;
        self.transport
            .send_event(&token, channel, txn_id, &content)
            .await
            .map_err(classify_send)
    }

    /// Join a channel we were invited to, retrying a few times.
    ///
    /// Policy: every invite is accepted; an accepted invite becomes a
    /// valid delivery target once it appears as a recipient's channel.
    pub async fn accept_invite(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let token = self.session.read().await.access_token.clone();

        let mut last_err = None;
        for attempt in 1..=INVITE_JOIN_ATTEMPTS {
            let _guard = self.outbound.lock().await;
            match self.transport.join_channel(&token, channel).await {
                Ok(()) => {
                    info!(channel = %channel, "joined channel");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        channel = %channel,
                        attempt = attempt,
                        error = %e,
                        "failed to join channel"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(TransportError::Timeout))
    }

    /// One long-poll of the synchronization stream.
    ///
    /// Advances the sync cursor and persists the session afterwards;
    /// persistence failure is logged and does not block delivery.
    pub async fn sync_once(&self) -> Result<SyncBatch, TransportError> {
        let (token, since) = {
            let session = self.session.read().await;
            (session.access_token.clone(), session.since.clone())
        };

        let batch = self
            .transport
            .sync(&token, since.as_deref(), self.sync_timeout_ms)
            .await?;

        {
            let mut session = self.session.write().await;
            session.since = Some(batch.next_batch.clone());
        }
        self.persist_session().await;

        Ok(batch)
    }

    /// Best-effort session persistence; a failed save degrades to
    /// re-authenticating on next restart, never to blocking delivery.
    async fn persist_session(&self) {
        let session = self.session.read().await.clone();
        let mut conn = self.db.lock().await;
        if let Err(e) = save_session(&mut conn, &session) {
            warn!(error = %e, "failed to persist session state");
        }
    }

    /// Shared database handle (resolver write-through uses it too).
    pub fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }
}
