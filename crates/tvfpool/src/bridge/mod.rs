//! Message bridge between the session router and the workers.
//!
//! - **protocol**: message types (API messages, slot messages, worker frames)
//! - **channel**: per-slot in-memory duplex channels
//! - **codec**: JSON framing codec for worker process pipes

pub mod channel;
pub mod codec;
pub mod protocol;
