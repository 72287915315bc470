//! Public gateway interface
//!
//! The facade, its configuration, error type, and the delivery data
//! model. Implementation is split across:
//! - `gateway/` (this module): core struct, start/stop, submit
//! - `client/`: protocol client and background sync
//! - `resolver/`: channel cache
//! - `queue/`: per-recipient send workers

mod config;
mod core;
mod error;
mod types;

pub use config::GatewayConfig;
pub use core::Gateway;
pub use error::GatewayError;
pub use types::{
    current_timestamp, queue_key, ChannelId, DeliveryFailure, DeliveryJob, DeliveryOutcome,
    MessageId, Payload, Recipient, MANAGEMENT_SENTINEL,
};
