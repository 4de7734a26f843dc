//! Core primitives shared across courier crates.
//!
//! Includes identifier newtypes, message lifecycle enums, the clock
//! abstraction, and the base error type.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use types::{
    Channel, ExchangeDirection, MessageId, MessageStatus, NodeId, PModeKey, PartyId, Timestamp,
    DEFAULT_CHANNEL_SEPARATOR,
};
