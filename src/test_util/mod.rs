//! Utilities for testing code that is based on this crate: a concrete message type and fake
//!  peers speaking the streaming protocol. They are used by this crate's own tests, but they are
//!  also exported for application testing.

pub mod message;
pub mod peer;

