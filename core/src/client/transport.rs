//! Protocol network boundary
//!
//! The messaging network is consumed through the [`Transport`] capability
//! interface: session login, the continuous sync stream, channel
//! creation/joining, event sends, and media uploads. The production
//! implementation lives in `client::http`; tests use the in-memory mock
//! from `crate::testing`.
//!
//! Failure classification happens here, at the lowest layer that has the
//! information. Everything above only consumes the classification.

use async_trait::async_trait;

use crate::gateway::{ChannelId, MessageId};

/// Credentials returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSession {
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}

/// Reference to uploaded media content (`mxc://` URI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUri(pub String);

/// An invite observed on the sync stream.
#[derive(Debug, Clone)]
pub struct InviteEvent {
    pub channel: ChannelId,
    pub sender: String,
}

/// One batch of updates from the synchronization stream.
#[derive(Debug, Clone, Default)]
pub struct SyncBatch {
    /// Cursor to resume from on the next poll
    pub next_batch: String,
    /// Channels the account was invited to
    pub invites: Vec<InviteEvent>,
    /// Channels that announced encryption being enabled
    pub encryption_enabled: Vec<ChannelId>,
}

/// Error at the wire, classified by the transport
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The call exceeded its bounded timeout (transient)
    Timeout,
    /// Connection-level failure (transient)
    Network(String),
    /// The server asked us to slow down; delay in milliseconds if given
    RateLimited { retry_after_ms: Option<u64> },
    /// The server rejected the call with a protocol error
    Api {
        status: u16,
        code: String,
        message: String,
    },
    /// The response could not be decoded
    Malformed(String),
}

impl TransportError {
    /// Whether retrying the same call can plausibly succeed.
    ///
    /// Timeouts, connection failures, rate limits, and server-side (5xx)
    /// errors are transient; client-side (4xx) protocol errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Network(_) => true,
            TransportError::RateLimited { .. } => true,
            TransportError::Api { status, .. } => *status >= 500,
            TransportError::Malformed(_) => false,
        }
    }

    /// Whether the error indicates the target of the call no longer
    /// exists or is no longer accessible (stale channel, revoked access).
    pub fn is_gone(&self) -> bool {
        match self {
            TransportError::Api { status, code, .. } => {
                (*status == 403 || *status == 404)
                    && (code == "M_FORBIDDEN" || code == "M_NOT_FOUND" || code == "M_UNKNOWN")
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Network(e) => write!(f, "network error: {}", e),
            TransportError::RateLimited { retry_after_ms } => match retry_after_ms {
                Some(ms) => write!(f, "rate limited, retry after {}ms", ms),
                None => write!(f, "rate limited"),
            },
            TransportError::Api {
                status,
                code,
                message,
            } => write!(f, "server error {} {}: {}", status, code, message),
            TransportError::Malformed(e) => write!(f, "malformed response: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// Capability interface over the messaging network.
///
/// One authenticated session per gateway; every call carries a bounded
/// timeout and returns a classified [`TransportError`] on failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate with password credentials and obtain a session.
    async fn login(
        &self,
        user_id: &str,
        password: &str,
        device_name: &str,
    ) -> Result<LoginSession, TransportError>;

    /// Validate an access token, returning the user id it belongs to.
    async fn whoami(&self, access_token: &str) -> Result<String, TransportError>;

    /// Long-poll the synchronization stream.
    async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout_ms: u64,
    ) -> Result<SyncBatch, TransportError>;

    /// Create a private channel with `invitee` as the only other member.
    async fn create_private_channel(
        &self,
        access_token: &str,
        invitee: &str,
        name: &str,
    ) -> Result<ChannelId, TransportError>;

    /// Join a channel we were invited to.
    async fn join_channel(
        &self,
        access_token: &str,
        channel: &ChannelId,
    ) -> Result<(), TransportError>;

    /// Send a message event into a channel.
    ///
    /// `txn_id` deduplicates retries server-side: resending with the same
    /// transaction id never produces a second message.
    async fn send_event(
        &self,
        access_token: &str,
        channel: &ChannelId,
        txn_id: &str,
        content: &serde_json::Value,
    ) -> Result<MessageId, TransportError>;

    /// Upload media content, returning a reference usable in messages.
    async fn upload_media(
        &self,
        access_token: &str,
        bytes: &[u8],
        content_type: &str,
        filename: &str,
    ) -> Result<ContentUri, TransportError>;
}
