//! The outbound queue of a single sender connection. Any number of publishing threads push,
//!  the sender's worker drains everything that is available in one go and applies the drop
//!  policy to the drained batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::topic::message::WireMessage;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Arc<dyn WireMessage>,
    pub byte_len: usize,
}

impl QueuedMessage {
    pub fn new(message: Arc<dyn WireMessage>) -> QueuedMessage {
        let byte_len = message.byte_len();
        QueuedMessage { message, byte_len }
    }
}

pub struct SendQueue {
    entries: Mutex<VecDeque<QueuedMessage>>,
    signal: Notify,
    /// set while a wake-up is pending, so that a burst of pushes notifies the consumer once
    signal_pending: AtomicBool,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            entries: Default::default(),
            signal: Notify::new(),
            signal_pending: AtomicBool::new(false),
        }
    }

    pub fn push(&self, message: QueuedMessage) {
        self.entries.lock()
            .expect("lock poisoned")
            .push_back(message);

        if !self.signal_pending.swap(true, Ordering::AcqRel) {
            self.signal.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock()
            .expect("lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until the queue is non-empty, then takes all of its entries, oldest first.
    ///
    /// Cancel safe: entries are only removed in the same poll that returns them.
    pub async fn take_all(&self) -> Vec<QueuedMessage> {
        loop {
            self.signal_pending.store(false, Ordering::Release);
            let drained: Vec<QueuedMessage> = self.entries.lock()
                .expect("lock poisoned")
                .drain(..)
                .collect();
            if !drained.is_empty() {
                return drained;
            }
            self.signal.notified().await;
        }
    }
}

#[derive(Debug)]
pub struct DrainSelection {
    /// the messages to send, oldest first
    pub kept: Vec<QueuedMessage>,
    pub num_dropped: usize,
    pub bytes_dropped: usize,
}

/// The drop policy: a batch that fits into `max_bytes`, or that has no more than
///  `min_retained` entries, is sent completely. Otherwise the newest `min_retained` messages
///  are kept unconditionally, and older messages are added (newest first) as long as the total
///  stays within `max_bytes`. Everything older than that is dropped.
pub fn select_for_sending(mut entries: Vec<QueuedMessage>, max_bytes: usize, min_retained: usize) -> DrainSelection {
    let total_bytes: usize = entries.iter().map(|e| e.byte_len).sum();
    if entries.len() <= min_retained || total_bytes <= max_bytes {
        return DrainSelection {
            kept: entries,
            num_dropped: 0,
            bytes_dropped: 0,
        };
    }

    let mut kept_bytes = 0;
    let mut num_kept = 0;
    for entry in entries.iter().rev() {
        if num_kept >= min_retained && kept_bytes + entry.byte_len > max_bytes {
            break;
        }
        kept_bytes += entry.byte_len;
        num_kept += 1;
    }

    let kept = entries.split_off(entries.len() - num_kept);
    DrainSelection {
        kept,
        num_dropped: entries.len(),
        bytes_dropped: total_bytes - kept_bytes,
    }
}
