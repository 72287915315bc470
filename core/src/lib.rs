//! Courier Core
//!
//! Notification gateway: accepts HTTP payloads and reliably delivers
//! them as messages into a federated messaging network, creating or
//! reusing a private channel per recipient.
//!
//! This crate provides:
//! - One authenticated, continuously-synchronizing protocol session
//! - Recipient -> channel resolution with single-flight creation
//! - Per-recipient ordered send queues with retry and backoff
//! - Durable session state surviving process restarts
//!
//! # Module Structure
//!
//! - `gateway/`: Public interface (Gateway, config, errors, types)
//! - `client/`: Protocol client (transport interface, HTTP impl, sync loop)
//! - `resolver/`: Recipient resolver / channel cache
//! - `queue/`: Per-recipient send workers with retry/backoff
//! - `data/`: SQLite persistence (session record, channel cache)
//! - `testing/`: Test utilities (scripted mock transport)
//!
//! # Quick Start
//!
//! ```ignore
//! use courier_core::{Gateway, GatewayConfig, Payload, Recipient};
//!
//! // Start the gateway
//! let config = GatewayConfig::new("https://matrix.example.org", "@courier:example.org", password)
//!     .with_management_channel("!ops:example.org");
//! let gateway = Gateway::start(config).await?;
//!
//! // Deliver a notification
//! let recipient = Recipient::parse("@oncall:example.org")?;
//! let outcome = gateway
//!     .submit(Some(recipient), Payload::Text("disk almost full".into()))
//!     .await;
//! ```

// Public interface
pub mod gateway;

// Infrastructure modules (pub for flexibility)
pub mod client;
pub mod data;
pub mod queue;
pub mod resolver;
pub mod testing;

// Re-export main API types for convenience
pub use gateway::{
    ChannelId,
    DeliveryFailure,
    DeliveryJob,
    DeliveryOutcome,
    Gateway,
    GatewayConfig,
    GatewayError,
    MessageId,
    Payload,
    Recipient,
};
