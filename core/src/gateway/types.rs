//! Core delivery types
//!
//! The data model shared by the ingestion boundary, the send queues,
//! and the protocol client.

use std::fmt;

/// Reserved queue key for deliveries without an explicit recipient.
///
/// Not a valid user or channel address on any homeserver, so it can
/// never collide with a real recipient's queue.
pub const MANAGEMENT_SENTINEL: &str = "<management>";

/// Identifier of a conversation channel (a room on the network).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a delivered message (the event id returned by the network).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a delivery should go.
///
/// A `User` recipient is resolved to its private channel (created on
/// first contact, cached thereafter). A `Channel` recipient names a
/// channel directly and bypasses resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A user address, `@user:domain`
    User(String),
    /// An explicit channel, `!channel:domain`
    Channel(ChannelId),
}

impl Recipient {
    /// Parse a recipient from its textual address.
    ///
    /// Accepts `@user:domain` and `!channel:domain`; anything else is
    /// rejected with a reason suitable for the ingestion response.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let valid_form = |s: &str| {
            // sigil + localpart + ':' + domain, none of them empty
            s.len() >= 4 && s[1..].contains(':') && !s[1..].starts_with(':') && !s.ends_with(':')
        };
        if s.starts_with('@') && valid_form(s) {
            Ok(Recipient::User(s.to_string()))
        } else if s.starts_with('!') && valid_form(s) {
            Ok(Recipient::Channel(ChannelId::new(s)))
        } else {
            Err(format!(
                "invalid recipient '{}': must be @user:domain or !channel:domain",
                s
            ))
        }
    }

    /// The key identifying this recipient's send queue.
    pub fn queue_key(&self) -> String {
        match self {
            Recipient::User(id) => id.clone(),
            Recipient::Channel(id) => id.as_str().to_string(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::User(id) => write!(f, "{}", id),
            Recipient::Channel(id) => write!(f, "{}", id),
        }
    }
}

/// Queue key for an optional recipient (management sentinel when absent).
pub fn queue_key(recipient: &Option<Recipient>) -> String {
    match recipient {
        Some(r) => r.queue_key(),
        None => MANAGEMENT_SENTINEL.to_string(),
    }
}

/// Payload of a single delivery.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Plain text, delivered as a non-pinging notice
    Text(String),
    /// A binary blob, uploaded and delivered as a media message
    Media {
        bytes: Vec<u8>,
        content_type: String,
        filename: String,
    },
}

impl Payload {
    /// Size of the payload body in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(t) => t.len(),
            Payload::Media { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A unit of work accepted by the ingestion boundary.
///
/// Created when a request is accepted, destroyed when the send queue
/// reaches a terminal outcome for it.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    /// Explicit recipient, or `None` for the management channel
    pub recipient: Option<Recipient>,
    /// What to deliver
    pub payload: Payload,
    /// Unix seconds when the job was accepted
    pub received_at: i64,
}

/// Terminal outcome of a submitted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The payload was delivered; the network assigned this message id
    Accepted(MessageId),
    /// The delivery was rejected or failed terminally
    Rejected(String),
}

impl DeliveryOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted(_))
    }
}

/// Terminal failure reported by a send queue worker.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    /// Human-readable reason, surfaced through the ingestion boundary
    pub reason: String,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// Current Unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
