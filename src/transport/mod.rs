//! # Transport Pipelines
//!
//! A pipeline takes messages from the [`MessageGenerator`], runs them through
//! a [`Flusher`](crate::flush::Flusher) and writes the resulting batches to a
//! non-blocking sink (the client `TcpStream` in a benchmark run).
//!
//! The flush policy is the same code for every variant; only the scheduling
//! differs:
//!
//! - [`Scheduler::Synchronous`]: production and flushing inline, no queue
//! - [`Scheduler::Threaded`]: the caller produces into a bounded queue, a
//!   worker thread drains it, polling with a short timeout so the coalescing
//!   window is re-checked while idle
//! - [`Scheduler::Cooperative`]: producer and flusher share a single-threaded
//!   tokio event loop and hand control to each other at explicit yield points
//!
//! ## Lifecycle
//!
//! Idle until the first message, then alternating between collecting and
//! flushing. After the last message a [`QueueItem::Stop`] is queued; the
//! flusher writes what is still buffered followed by the stop sentinel and
//! exits (draining). The owner waits for the drain barrier before the
//! pipeline is considered closed.
//!
//! ## Delivery guarantees
//!
//! Bytes reach the sink in production order, without loss or duplication.
//! Adjacent messages may share a write (coalescing) and a single write may be
//! split by partial sends; nothing is ever reordered.

use crate::flush::FlushPolicy;
use crate::generator::{DataPoint, Message, MessageGenerator};
use crate::queue::QueueError;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

mod cooperative;
mod synchronous;
mod threaded;

/// Fatal transmission failures. A would-block condition never surfaces here;
/// it is retried after yielding.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket write failed: {0}")]
    Io(#[from] io::Error),
    #[error("socket accepted zero bytes with {remaining} byte(s) left to send")]
    WriteZero { remaining: usize },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("flusher worker panicked")]
    WorkerPanicked,
    #[error("failed to build the cooperative runtime: {0}")]
    Runtime(io::Error),
}

/// What travels through the bounded queue.
#[derive(Debug)]
pub enum QueueItem {
    Data(Message),
    /// No more messages follow; flush and write the stop sentinel.
    Stop,
}

/// Concurrency model used to connect production and flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheduler {
    Synchronous,
    Threaded,
    Cooperative,
}

impl std::fmt::Display for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheduler::Synchronous => write!(f, "synchronous"),
            Scheduler::Threaded => write!(f, "threaded"),
            Scheduler::Cooperative => write!(f, "cooperative"),
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Every produced message with its production timestamp, in order.
    pub produced: Vec<DataPoint>,
    /// Batches written to the sink, the stop sentinel not included.
    pub writes: usize,
}

impl PipelineOutput {
    pub fn total_bytes(&self) -> usize {
        self.produced.iter().map(DataPoint::len).sum()
    }
}

/// One scheduler paired with one flush policy.
#[derive(Debug, Clone)]
pub struct TransportPipeline {
    pub scheduler: Scheduler,
    pub policy: FlushPolicy,
    pub queue_capacity: usize,
    /// Always [`crate::STOP_SENTINEL`], the sequence the receiver waits for.
    sentinel: Vec<u8>,
}

impl TransportPipeline {
    pub fn new(scheduler: Scheduler, policy: FlushPolicy) -> Self {
        Self {
            scheduler,
            policy,
            queue_capacity: crate::defaults::QUEUE_CAPACITY,
            sentinel: crate::STOP_SENTINEL.to_vec(),
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Produce `count` messages from `generator` and deliver them, followed
    /// by the stop sentinel, to `sink`.
    ///
    /// `sink` is expected to be non-blocking; `WouldBlock` results are retried
    /// after yielding. The call returns once every byte has been written and
    /// the queue (if any) is drained.
    pub fn run<W>(
        &self,
        generator: &mut MessageGenerator,
        count: usize,
        sink: W,
    ) -> Result<PipelineOutput, TransportError>
    where
        W: Write + Send + 'static,
    {
        debug!(
            "Running {} pipeline with {} flush policy for {} messages",
            self.scheduler, self.policy, count
        );
        let started = Instant::now();
        let output = match self.scheduler {
            Scheduler::Synchronous => synchronous::run(self, generator, count, sink)?,
            Scheduler::Threaded => threaded::run(self, generator, count, sink)?,
            Scheduler::Cooperative => cooperative::run(self, generator, count, sink)?,
        };
        debug!(
            "{} pipeline finished: {} messages in {} writes after {:?}",
            self.scheduler,
            output.produced.len(),
            output.writes,
            started.elapsed()
        );
        Ok(output)
    }
}

/// Classify one `write` attempt: `Some(n)` bytes accepted, `None` to retry.
fn write_progress(
    result: io::Result<usize>,
    remaining: usize,
) -> Result<Option<usize>, TransportError> {
    match result {
        Ok(0) => Err(TransportError::WriteZero { remaining }),
        Ok(written) => Ok(Some(written)),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(TransportError::Io(e)),
    }
}

/// Write all of `buf`, yielding the OS thread whenever the sink would block.
pub fn send_all<W: Write + ?Sized>(sink: &mut W, mut buf: &[u8]) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match write_progress(sink.write(buf), buf.len())? {
            Some(written) => buf = &buf[written..],
            None => std::thread::yield_now(),
        }
    }
    Ok(())
}

/// Write all of `buf`, yielding to the event loop whenever the sink would
/// block.
pub async fn send_all_cooperative<W: Write + ?Sized>(
    sink: &mut W,
    mut buf: &[u8],
) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match write_progress(sink.write(buf), buf.len())? {
            Some(written) => buf = &buf[written..],
            None => tokio::task::yield_now().await,
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Sink that accepts a few bytes per call, reports `WouldBlock` on every
    /// other call and can be told to fail after a byte budget.
    #[derive(Clone, Default)]
    pub(crate) struct ChoppySink {
        pub written: Arc<Mutex<Vec<u8>>>,
        calls: u64,
        max_chunk: usize,
        fail_after: Option<usize>,
    }

    impl ChoppySink {
        pub(crate) fn new(max_chunk: usize) -> Self {
            Self {
                max_chunk,
                ..Default::default()
            }
        }

        pub(crate) fn failing_after(max_chunk: usize, budget: usize) -> Self {
            Self {
                max_chunk,
                fail_after: Some(budget),
                ..Default::default()
            }
        }
    }

    impl Write for ChoppySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut written = self.written.lock();
            if let Some(budget) = self.fail_after {
                if written.len() >= budget {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
            }
            let n = buf.len().min(self.max_chunk);
            written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn all_pipelines() -> Vec<TransportPipeline> {
        let coalescing = FlushPolicy::Coalescing {
            window: Duration::from_micros(50),
        };
        let mut pipelines = Vec::new();
        for scheduler in [
            Scheduler::Synchronous,
            Scheduler::Threaded,
            Scheduler::Cooperative,
        ] {
            for policy in [FlushPolicy::Immediate, coalescing] {
                pipelines.push(TransportPipeline::new(scheduler, policy).with_queue_capacity(8));
            }
        }
        pipelines
    }

    #[test]
    fn test_send_all_survives_partial_and_blocked_writes() {
        let mut sink = ChoppySink::new(3);
        send_all(&mut sink, b"hello, partial world").unwrap();
        assert_eq!(sink.written.lock().as_slice(), b"hello, partial world");
    }

    #[test]
    fn test_send_all_propagates_fatal_errors() {
        let mut sink = ChoppySink::failing_after(4, 4);
        let err = send_all(&mut sink, b"0123456789").unwrap_err();
        match err {
            TransportError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_send_all_rejects_zero_length_writes() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = send_all(&mut Closed, b"abc").unwrap_err();
        assert!(matches!(err, TransportError::WriteZero { remaining: 3 }));
    }

    #[tokio::test]
    async fn test_send_all_cooperative_survives_blocked_writes() {
        let mut sink = ChoppySink::new(5);
        send_all_cooperative(&mut sink, b"cooperative bytes")
            .await
            .unwrap();
        assert_eq!(sink.written.lock().as_slice(), b"cooperative bytes");
    }

    #[test]
    fn test_pipeline_stream_ends_a_receiver_run() {
        use crate::receiver::{ReceiverConfig, SentinelTracker};

        for pipeline in all_pipelines() {
            let sink = ChoppySink::new(64);
            let written = sink.written.clone();
            let mut generator = MessageGenerator::new(3, b'\n');
            let output = pipeline.run(&mut generator, 50, sink).unwrap();

            let mut tracker = SentinelTracker::new(ReceiverConfig::default().sentinel);
            let mut received = Vec::new();
            let mut ended = false;
            for (i, chunk) in written.lock().chunks(40).enumerate() {
                let out = tracker.feed(DataPoint::new(chunk.to_vec(), i as u64));
                received.extend(out.chunks.into_iter().flat_map(|c| c.data));
                ended |= out.end_of_stream;
            }

            assert!(ended, "{} / {} never ended the run", pipeline.scheduler, pipeline.policy);
            assert_eq!(received.len(), output.total_bytes());
        }
    }

    #[test]
    fn test_every_pipeline_delivers_exact_ordered_bytes() {
        for pipeline in all_pipelines() {
            let sink = ChoppySink::new(97);
            let written = sink.written.clone();
            let mut generator = MessageGenerator::new(11, b'\n');
            let output = pipeline.run(&mut generator, 500, sink).unwrap();

            let mut expected: Vec<u8> = output
                .produced
                .iter()
                .flat_map(|p| p.data.iter().copied())
                .collect();
            expected.extend_from_slice(crate::STOP_SENTINEL);
            assert_eq!(
                written.lock().as_slice(),
                expected.as_slice(),
                "{} / {}",
                pipeline.scheduler,
                pipeline.policy
            );

            // Production order matches the generator sequence.
            let mut replay = MessageGenerator::new(11, b'\n');
            for point in &output.produced {
                assert_eq!(point.data.as_slice(), replay.next_message().as_bytes());
            }
            assert_eq!(output.produced.len(), 500);

            if pipeline.policy == FlushPolicy::Immediate {
                assert_eq!(output.writes, 500);
            } else {
                assert!(output.writes >= 1 && output.writes <= 500);
            }
        }
    }

    #[test]
    fn test_production_timestamps_are_monotonic() {
        for pipeline in all_pipelines() {
            let mut generator = MessageGenerator::new(5, b'\n');
            let output = pipeline
                .run(&mut generator, 200, ChoppySink::new(4096))
                .unwrap();
            assert!(output
                .produced
                .windows(2)
                .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
        }
    }

    #[test]
    fn test_fatal_sink_error_aborts_every_pipeline() {
        for pipeline in all_pipelines() {
            let mut generator = MessageGenerator::new(1, b'\n');
            let result = pipeline.run(&mut generator, 2_000, ChoppySink::failing_after(64, 1_000));
            match result {
                Err(TransportError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
                other => panic!(
                    "{} / {}: expected broken pipe, got {:?}",
                    pipeline.scheduler,
                    pipeline.policy,
                    other.map(|o| o.writes)
                ),
            }
        }
    }

    #[test]
    fn test_zero_capacity_is_rejected_for_queued_schedulers() {
        for scheduler in [Scheduler::Threaded, Scheduler::Cooperative] {
            let pipeline =
                TransportPipeline::new(scheduler, FlushPolicy::Immediate).with_queue_capacity(0);
            let mut generator = MessageGenerator::new(1, b'\n');
            let err = pipeline
                .run(&mut generator, 10, ChoppySink::new(16))
                .unwrap_err();
            assert!(matches!(err, TransportError::Queue(QueueError::ZeroCapacity)));
        }
    }
}
