//! # Benchmark Engine Module
//!
//! Orchestrates a complete benchmark run: one receiver process, one client
//! connection, and every selected tester executed over that connection in
//! turn.
//!
//! ## Test Execution Lifecycle
//!
//! 1. **Setup**: spawn the receiver process, wait for it to report ready,
//!    connect a non-blocking client socket
//! 2. **Per tester**: configure Nagle on the socket, run the transport
//!    pipeline, collect the receiver's chunks up to the stop sentinel,
//!    correlate byte offsets into latencies, reduce them into [`Metrics`]
//! 3. **Cleanup**: close the client socket and terminate the receiver, on
//!    success and on failure alike
//!
//! The message generator is created once per run, so every tester consumes
//! the next slice of the same seeded sequence.

use crate::{
    cli::{Args, TesterKind},
    coordination::ReceiverProcess,
    correlator::correlate,
    generator::MessageGenerator,
    metrics::Metrics,
    receiver::ReceiverConfig,
    transport::TransportPipeline,
    utils,
};
use anyhow::{bail, Context, Result};
use socket2::SockRef;
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A helper struct to provide a single source of truth for displaying the
/// run configuration.
struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
    testers: &'a [TesterKind],
}

impl<'a> std::fmt::Display for BenchmarkConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.testers.iter().map(ToString::to_string).collect();
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark")?;
        writeln!(f, "  Testers:            {}", names.join(", "))?;
        writeln!(f, "  Message Count:      {}", self.config.msg_count)?;
        writeln!(
            f,
            "  Message Size:       1..={} bytes (end marker {:?})",
            self.config.max_message_size, self.config.end_marker as char
        )?;
        writeln!(f, "  Queue Capacity:     {}", self.config.queue_capacity)?;
        writeln!(
            f,
            "  Coalesce Window:    {}",
            utils::format_duration(self.config.coalesce_window)
        )?;
        writeln!(f, "  Seed:               {}", self.config.seed)?;
        writeln!(
            f,
            "  Receiver:           {}:{} (read size {} bytes)",
            self.config.host, self.config.port, self.config.read_size
        )?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Configuration of one benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    /// Testers to run, in order. `TesterKind::All` expands to all nine.
    pub testers: Vec<TesterKind>,

    /// Messages produced per tester
    pub msg_count: usize,

    /// Capacity of the bounded queue between producer and flusher
    pub queue_capacity: usize,

    /// Age at which a coalescing buffer is flushed
    pub coalesce_window: Duration,

    pub end_marker: u8,

    /// Largest generated message, end marker included
    pub max_message_size: usize,

    pub seed: u64,

    pub host: String,

    /// Receiver port; 0 lets the OS choose
    pub port: u16,

    /// Largest single receiver read
    pub read_size: usize,

    /// Receiver idle-read timeout. Expiry only retries; it also sets how
    /// often the client checks that the receiver is still alive.
    pub idle_timeout: Duration,

    /// How long to wait for the receiver to report ready
    pub startup_timeout: Duration,

    /// Receiver binary; the running benchmark binary when unset
    pub receiver_exe: Option<PathBuf>,

    /// Log verbosity forwarded to the receiver process
    pub verbosity: u8,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            testers: vec![TesterKind::All],
            msg_count: crate::defaults::MSG_COUNT,
            queue_capacity: crate::defaults::QUEUE_CAPACITY,
            coalesce_window: crate::defaults::COALESCE_WINDOW,
            end_marker: crate::defaults::END_MARKER,
            max_message_size: crate::defaults::MAX_MESSAGE_SIZE,
            seed: crate::defaults::SEED,
            host: crate::defaults::HOST.to_string(),
            port: crate::defaults::PORT,
            read_size: crate::defaults::READ_SIZE,
            idle_timeout: crate::defaults::IDLE_TIMEOUT,
            startup_timeout: crate::defaults::RECEIVER_STARTUP_TIMEOUT,
            receiver_exe: None,
            verbosity: 0,
        }
    }
}

impl BenchmarkConfig {
    /// Create a validated configuration from CLI arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            testers: TesterKind::expand_all(args.testers.clone()),
            msg_count: args.msg_count,
            queue_capacity: args.queue_capacity,
            coalesce_window: args.coalesce_window,
            end_marker: args.end_marker,
            max_message_size: args.max_message_size,
            seed: args.seed,
            host: args.host.clone(),
            port: args.port,
            read_size: args.read_size,
            idle_timeout: args.idle_timeout,
            startup_timeout: crate::defaults::RECEIVER_STARTUP_TIMEOUT,
            receiver_exe: None,
            verbosity: args.verbose,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.testers.is_empty() {
            bail!("At least one tester must be selected");
        }
        if self.msg_count == 0 {
            bail!("Message count must be at least 1");
        }
        if self.idle_timeout.is_zero() {
            bail!("Idle timeout must be greater than zero");
        }
        if self.end_marker == crate::generator::FILLER {
            bail!(
                "End marker must differ from the filler byte {:?}",
                crate::generator::FILLER as char
            );
        }
        utils::validate_queue_capacity(self.queue_capacity)?;
        utils::validate_message_size(self.max_message_size)?;
        utils::validate_port(self.port)?;
        utils::validate_read_size(self.read_size)?;
        Ok(())
    }

    /// Settings handed to the receiver process
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            host: self.host.clone(),
            port: self.port,
            read_size: self.read_size,
            idle_timeout: self.idle_timeout,
            sentinel: crate::STOP_SENTINEL.to_vec(),
        }
    }
}

/// Runs every selected tester against one receiver process
///
/// ```rust,no_run
/// # use coalesce_bench::{BenchmarkConfig, BenchmarkRunner, TesterKind};
/// # fn main() -> anyhow::Result<()> {
/// let config = BenchmarkConfig {
///     testers: vec![TesterKind::SimpleNagle, TesterKind::AsyncCoalescing],
///     msg_count: 500,
///     port: 0,
///     ..Default::default()
/// };
/// for metrics in BenchmarkRunner::new(config).run()? {
///     println!("{}: p99 {:?}", metrics.name, metrics.p99_latency);
/// }
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Run all testers and return their metrics in execution order.
    ///
    /// The client socket is closed and the receiver process terminated
    /// before this returns, whatever the outcome.
    pub fn run(&self) -> Result<Vec<Metrics>> {
        self.config.validate()?;
        let testers = TesterKind::expand_all(self.config.testers.clone());
        info!(
            "\n{}",
            BenchmarkConfigDisplay {
                config: &self.config,
                testers: &testers,
            }
        );

        let mut receiver = ReceiverProcess::spawn(
            &self.config.receiver_config(),
            self.config.receiver_exe.as_deref(),
            self.config.verbosity,
            self.config.startup_timeout,
        )
        .context("Failed to start receiver process")?;

        let outcome = connect_client(receiver.address()).and_then(|client| {
            let result = self.run_testers(&testers, &mut receiver, &client);
            close_client(client);
            result
        });
        let cleanup = receiver.terminate();

        let results = outcome?;
        cleanup?;
        Ok(results)
    }

    fn run_testers(
        &self,
        testers: &[TesterKind],
        receiver: &mut ReceiverProcess,
        client: &TcpStream,
    ) -> Result<Vec<Metrics>> {
        let mut generator = MessageGenerator::new(self.config.seed, self.config.end_marker)
            .with_max_size(self.config.max_message_size);
        let mut results = Vec::with_capacity(testers.len());

        for tester in testers {
            info!("Running {}", tester);
            let metrics = self
                .execute_test(*tester, &mut generator, receiver, client)
                .with_context(|| format!("Tester '{}' failed", tester))?;
            info!(
                "{} done: {} messages in {} writes, p99 {}",
                metrics.name,
                metrics.message_count,
                metrics.client_writes,
                utils::format_duration(metrics.p99_latency)
            );
            results.push(metrics);
        }
        Ok(results)
    }

    fn execute_test(
        &self,
        tester: TesterKind,
        generator: &mut MessageGenerator,
        receiver: &mut ReceiverProcess,
        client: &TcpStream,
    ) -> Result<Metrics> {
        let stale = receiver.pending_events();
        if stale != 0 {
            bail!("Receiver channel holds {} stale event(s) from an earlier run", stale);
        }

        SockRef::from(client)
            .set_nodelay(tester.tcp_nodelay())
            .context("Failed to set TCP_NODELAY")?;
        let sink = client
            .try_clone()
            .context("Failed to clone client socket")?;

        let pipeline = TransportPipeline::new(
            tester.scheduler(),
            tester.policy(self.config.coalesce_window),
        )
        .with_queue_capacity(self.config.queue_capacity);
        let output = pipeline.run(generator, self.config.msg_count, sink)?;
        debug!(
            "{}: sent {} bytes in {} writes",
            tester,
            output.total_bytes(),
            output.writes
        );

        let received = receiver.collect_stream()?;
        let latencies = correlate(&output.produced, &received)?;
        if latencies.len() != output.produced.len() {
            bail!(
                "Correlated {} latencies for {} messages",
                latencies.len(),
                output.produced.len()
            );
        }

        Metrics::from_run(
            tester.to_string(),
            &output.produced,
            &received,
            &latencies,
            output.writes,
        )
    }
}

fn connect_client(address: &str) -> Result<TcpStream> {
    let client = TcpStream::connect(address)
        .with_context(|| format!("Failed to connect to receiver at {}", address))?;
    client
        .set_nonblocking(true)
        .context("Failed to make client socket non-blocking")?;
    debug!("Client connected to {}", address);
    Ok(client)
}

fn close_client(client: TcpStream) {
    if let Err(e) = client.shutdown(Shutdown::Both) {
        if e.kind() != std::io::ErrorKind::NotConnected {
            warn!("Failed to shut down client socket: {}", e);
        }
    }
}
