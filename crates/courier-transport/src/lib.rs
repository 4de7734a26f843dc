//! Transport abstractions for courier.
//!
//! The engine never builds envelopes; it only hands opaque [`envelope::Envelope`]
//! values to a [`adapter::MessageTransport`] and reads inbound ones back.

pub mod adapter;
pub mod envelope;
pub mod spool;
