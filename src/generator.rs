//! # Message Generator
//!
//! Produces the synthetic message stream every tester transmits. Sizes are
//! drawn uniformly from `[1, max_size]` by a seeded RNG, so the same seed
//! always yields the same byte sequence and benchmark runs are repeatable.
//!
//! The generator is an explicit object: the benchmark runner creates one per
//! run and lends it to each pipeline in turn, so testers consume one shared,
//! reproducible sequence.

use crate::utils::current_timestamp_ns;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Byte used to fill every message up to its end marker.
pub const FILLER: u8 = b'a';

/// An immutable generated payload.
///
/// Always at least one byte long; the final byte is the end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8>,
}

impl Message {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A payload (or received chunk) paired with a wall-clock timestamp.
///
/// Client side this is a message and its production time; receiver side a
/// chunk and its arrival time. Timestamps are nanoseconds since the Unix
/// epoch because they are compared across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    pub data: Vec<u8>,
    pub timestamp_ns: u64,
}

impl DataPoint {
    pub fn new(data: Vec<u8>, timestamp_ns: u64) -> Self {
        Self { data, timestamp_ns }
    }

    /// Stamp `data` with the current wall-clock time.
    pub fn now(data: Vec<u8>) -> Self {
        Self::new(data, current_timestamp_ns())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Seeded pseudo-random message source.
pub struct MessageGenerator {
    rng: StdRng,
    end_marker: u8,
    max_size: usize,
}

impl MessageGenerator {
    /// Create a generator producing messages of up to
    /// [`defaults::MAX_MESSAGE_SIZE`](crate::defaults::MAX_MESSAGE_SIZE) bytes.
    pub fn new(seed: u64, end_marker: u8) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            end_marker,
            max_size: crate::defaults::MAX_MESSAGE_SIZE,
        }
    }

    /// Change the upper bound of the size distribution. Values below one are
    /// raised to one.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Draw the next message of the sequence.
    pub fn next_message(&mut self) -> Message {
        let size = self.rng.gen_range(1..=self.max_size);
        let mut bytes = vec![FILLER; size - 1];
        bytes.push(self.end_marker);
        Message { bytes }
    }
}

impl Iterator for MessageGenerator {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        Some(self.next_message())
    }
}
