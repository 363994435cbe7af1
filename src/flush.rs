//! # Flush Policies
//!
//! The buffering half of every transport pipeline, kept free of I/O and of
//! any notion of threads or tasks. A scheduling adapter feeds messages into a
//! [`Flusher`] together with the current instant and writes whatever
//! [`Batch`] comes back.
//!
//! - **Immediate**: each message becomes its own batch.
//! - **Coalescing**: messages accumulate in one buffer. The window timer starts
//!   with the first buffered message; once more than `window` has elapsed the
//!   whole buffer is released as a single batch and the timer resets.
//!
//! [`Flusher::finish`] releases whatever is still buffered regardless of the
//! window, which is how the final partial buffer reaches the wire at shutdown.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How dequeued messages are turned into socket writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushPolicy {
    /// One write per message, no buffering.
    Immediate,
    /// Accumulate messages and write them together once the buffer is older
    /// than `window`.
    Coalescing { window: Duration },
}

impl FlushPolicy {
    pub fn is_coalescing(&self) -> bool {
        matches!(self, FlushPolicy::Coalescing { .. })
    }
}

impl std::fmt::Display for FlushPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushPolicy::Immediate => write!(f, "immediate"),
            FlushPolicy::Coalescing { window } => write!(f, "coalescing ({:?} window)", window),
        }
    }
}

/// Bytes ready for one socket write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub bytes: Vec<u8>,
    /// Number of logical messages merged into `bytes`.
    pub messages: usize,
}

/// Applies a [`FlushPolicy`] to a stream of messages.
#[derive(Debug)]
pub struct Flusher {
    policy: FlushPolicy,
    buffer: Vec<u8>,
    buffered_messages: usize,
    window_start: Option<Instant>,
}

impl Flusher {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            buffer: Vec::new(),
            buffered_messages: 0,
            window_start: None,
        }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Messages accepted but not yet released in a batch.
    pub fn buffered_messages(&self) -> usize {
        self.buffered_messages
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Accept one message observed at `now`.
    pub fn offer(&mut self, message: Vec<u8>, now: Instant) -> Option<Batch> {
        match self.policy {
            FlushPolicy::Immediate => Some(Batch {
                bytes: message,
                messages: 1,
            }),
            FlushPolicy::Coalescing { .. } => {
                if self.window_start.is_none() {
                    self.window_start = Some(now);
                }
                if self.buffer.is_empty() {
                    self.buffer = message;
                } else {
                    self.buffer.extend_from_slice(&message);
                }
                self.buffered_messages += 1;
                self.poll(now)
            }
        }
    }

    /// Release the buffer if its window has expired by `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Batch> {
        let window = match self.policy {
            FlushPolicy::Immediate => return None,
            FlushPolicy::Coalescing { window } => window,
        };
        let started = self.window_start?;
        if now.saturating_duration_since(started) > window {
            self.take()
        } else {
            None
        }
    }

    /// Release everything still buffered, window or not.
    pub fn finish(&mut self) -> Option<Batch> {
        self.take()
    }

    fn take(&mut self) -> Option<Batch> {
        self.window_start = None;
        if self.buffered_messages == 0 {
            return None;
        }
        let batch = Batch {
            bytes: std::mem::take(&mut self.buffer),
            messages: self.buffered_messages,
        };
        self.buffered_messages = 0;
        Some(batch)
    }
}
