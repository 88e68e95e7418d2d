use std::sync::atomic::{AtomicU32, Ordering};

pub mod send_queue;
pub mod tcp_receiver;
pub mod tcp_sender;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// process-wide unique id of a streaming connection, reported by bus introspection
pub fn next_connection_id() -> u32 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}
