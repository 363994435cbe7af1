//! # Coalesce Benchmark Library
//!
//! Benchmarks strategies for batching and transmitting a synthetic stream of
//! messages over a single TCP connection, and reconstructs per-message
//! end-to-end latency from nothing but cumulative byte counts.
//!
//! ## Strategies
//!
//! Every tester combines a scheduling model with a flush policy:
//!
//! - **Synchronous**: production and transmission interleave in one control flow
//! - **Thread-based**: the caller produces into a bounded queue drained by a worker thread
//! - **Cooperative**: producer and flusher share one single-threaded tokio event loop
//!
//! crossed with
//!
//! - **Immediate**: every message is its own socket write
//! - **Coalescing**: messages are buffered and flushed as one write per time window
//!
//! and TCP_NODELAY switched on or off.
//!
//! ## Architecture Overview
//!
//! - `generator`: seeded, deterministic message generator
//! - `flush`: the shared flush-policy logic (pure buffering, no I/O)
//! - `queue`: bounded FIFO with a drain barrier
//! - `transport`: the three scheduling adapters and non-blocking send
//! - `receiver`: the receiver process body and its cross-process record channel
//! - `coordination`: spawning and talking to the receiver process
//! - `correlator`: cumulative byte-offset latency reconstruction
//! - `metrics`: reduction of latency samples into run statistics
//! - `benchmark`: the runner driving every tester over one connection
//! - `results`: report printing and JSON output
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use coalesce_bench::{BenchmarkConfig, BenchmarkRunner};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         msg_count: 1000,
//!         ..Default::default()
//!     };
//!     let results = BenchmarkRunner::new(config).run()?;
//!     for metrics in &results {
//!         println!("{}: p99 {:?}", metrics.name, metrics.p99_latency);
//!     }
//!     Ok(())
//! }
//! ```

/// Benchmark orchestration
///
/// Owns the receiver process and the client connection for a whole run and
/// executes each selected tester in turn, always releasing both on exit.
pub mod benchmark;

/// Command-line interface and tester selection
pub mod cli;

/// Receiver process lifecycle
///
/// Spawns the receiver in its own process, performs the ready handshake and
/// drains the record channel on a collector thread.
pub mod coordination;

/// Latency reconstruction from cumulative byte offsets
pub mod correlator;

/// Time-window coalescing and immediate flush policies
pub mod flush;

/// Deterministic synthetic message generation
pub mod generator;

pub mod logging;

/// Run statistics: run time, throughput and latency distribution
pub mod metrics;

/// Bounded single-producer single-consumer queue with a drain barrier
pub mod queue;

/// Receiver process body and cross-process record framing
pub mod receiver;

/// Report printing and JSON results output
pub mod results;

/// Producer/queue/flush pipelines over a non-blocking socket
///
/// One flush policy abstraction, three scheduling adapters (inline call,
/// worker thread, cooperative task).
pub mod transport;

pub mod utils;

pub use benchmark::{BenchmarkConfig, BenchmarkRunner};
pub use cli::{Args, TesterKind};
pub use correlator::{correlate, CorrelationError};
pub use flush::{FlushPolicy, Flusher};
pub use generator::{DataPoint, Message, MessageGenerator};
pub use metrics::Metrics;
pub use results::ResultsManager;
pub use transport::{PipelineOutput, Scheduler, TransportPipeline};

/// The current version of the benchmark suite
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reserved byte sequence written after the last real message of a test run.
///
/// The generator only emits the filler byte and a single end-marker byte, so
/// this sequence cannot appear inside generated payloads.
pub const STOP_SENTINEL: &[u8] = b"\x00__STOP__\x00";

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Messages produced per tester.
    pub const MSG_COUNT: usize = 10_000;

    /// Capacity of the bounded queue used by the threaded and cooperative
    /// schedulers.
    pub const QUEUE_CAPACITY: usize = 1_000;

    /// Coalescing window. A buffer older than this is flushed as one write.
    pub const COALESCE_WINDOW: Duration = Duration::from_micros(100);

    /// Largest generated message, end marker included.
    pub const MAX_MESSAGE_SIZE: usize = 500;

    /// Final byte of every generated message.
    pub const END_MARKER: u8 = b'\n';

    /// Seed of the message generator, fixed so runs are repeatable.
    pub const SEED: u64 = 1;

    pub const HOST: &str = "127.0.0.1";

    pub const PORT: u16 = 8085;

    /// Upper bound of a single receiver read.
    pub const READ_SIZE: usize = 5_000;

    /// Receiver idle-read timeout. Expiry only triggers another read.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

    /// How long the client waits for the receiver process to report ready.
    pub const RECEIVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

    /// How long the threaded flusher waits for an item before re-checking the
    /// coalescing window. Roughly one context switch.
    pub const QUEUE_POLL_TIMEOUT: Duration = Duration::from_micros(1);
}
