use crate::flush::FlushPolicy;
use crate::transport::Scheduler;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Coalesce Bench - measures end-to-end latency of small TCP messages under
/// different write-coalescing strategies
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Testers to run (comma or space separated, or all)
    #[clap(short = 't', long, value_enum, default_values_t = vec![TesterKind::All], num_args = 1.., value_delimiter = ',', help_heading = "Core Options")]
    pub testers: Vec<TesterKind>,

    /// Messages produced per tester
    #[clap(short = 'n', long, default_value_t = crate::defaults::MSG_COUNT, help_heading = "Core Options")]
    pub msg_count: usize,

    /// Capacity of the producer/flusher queue
    #[clap(short = 'q', long, default_value_t = crate::defaults::QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Coalescing window (e.g. 100us, 1ms, 2s)
    #[clap(short = 'w', long, value_parser = parse_duration, default_value = "100us")]
    pub coalesce_window: Duration,

    /// Final byte of every generated message (single ASCII character, or \n, \t, \r)
    #[clap(long, value_parser = parse_end_marker, default_value = "\\n")]
    pub end_marker: u8,

    /// Largest generated message in bytes, end marker included
    #[clap(long, default_value_t = crate::defaults::MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Seed of the message generator
    #[clap(long, default_value_t = crate::defaults::SEED)]
    pub seed: u64,

    /// Host address of the receiver
    #[clap(long, default_value = crate::defaults::HOST, help_heading = "Receiver Options")]
    pub host: String,

    /// Port of the receiver (0 picks a free port)
    #[clap(long, default_value_t = crate::defaults::PORT, help_heading = "Receiver Options")]
    pub port: u16,

    /// Largest single read on the receiver side, in bytes
    #[clap(long, default_value_t = crate::defaults::READ_SIZE, help_heading = "Receiver Options")]
    pub read_size: usize,

    /// Receiver idle-read timeout; expiry only retries the read
    #[clap(long, value_parser = parse_duration, default_value = "30s", help_heading = "Receiver Options")]
    pub idle_timeout: Duration,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(long, default_value_t = false, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Run as the receiver process (spawned by the benchmark itself)
    #[clap(long, hide = true, default_value_t = false)]
    pub internal_run_as_receiver: bool,
}

/// One combination of scheduler, flush policy and Nagle setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum TesterKind {
    #[clap(name = "async-coalescing")]
    AsyncCoalescing,

    #[clap(name = "async-no-delay")]
    AsyncNoDelay,

    #[clap(name = "async-nagle")]
    AsyncNagle,

    #[clap(name = "threaded-coalescing")]
    ThreadedCoalescing,

    #[clap(name = "threaded-no-delay")]
    ThreadedNoDelay,

    #[clap(name = "threaded-nagle")]
    ThreadedNagle,

    #[clap(name = "simple-coalescing")]
    SimpleCoalescing,

    #[clap(name = "simple-no-delay")]
    SimpleNoDelay,

    #[clap(name = "simple-nagle")]
    SimpleNagle,

    /// All nine testers
    #[clap(name = "all")]
    All,
}

impl std::fmt::Display for TesterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TesterKind::AsyncCoalescing => write!(f, "async coalescing tester"),
            TesterKind::AsyncNoDelay => write!(f, "async no_delay tester"),
            TesterKind::AsyncNagle => write!(f, "async nagle tester"),
            TesterKind::ThreadedCoalescing => write!(f, "threaded coalescing tester"),
            TesterKind::ThreadedNoDelay => write!(f, "threaded no_delay tester"),
            TesterKind::ThreadedNagle => write!(f, "threaded_nagle_tester"),
            TesterKind::SimpleCoalescing => write!(f, "simple coalescing"),
            TesterKind::SimpleNoDelay => write!(f, "simple no_delay"),
            TesterKind::SimpleNagle => write!(f, "simple nagle"),
            TesterKind::All => write!(f, "all testers"),
        }
    }
}

impl TesterKind {
    const EVERY: [TesterKind; 9] = [
        TesterKind::AsyncCoalescing,
        TesterKind::AsyncNoDelay,
        TesterKind::AsyncNagle,
        TesterKind::ThreadedCoalescing,
        TesterKind::ThreadedNoDelay,
        TesterKind::ThreadedNagle,
        TesterKind::SimpleCoalescing,
        TesterKind::SimpleNoDelay,
        TesterKind::SimpleNagle,
    ];

    /// Expand the "All" variant to every tester, in run order
    pub fn expand_all(testers: Vec<TesterKind>) -> Vec<TesterKind> {
        if testers.contains(&TesterKind::All) {
            Self::EVERY.to_vec()
        } else {
            testers
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        match self {
            TesterKind::AsyncCoalescing | TesterKind::AsyncNoDelay | TesterKind::AsyncNagle => {
                Scheduler::Cooperative
            }
            TesterKind::ThreadedCoalescing
            | TesterKind::ThreadedNoDelay
            | TesterKind::ThreadedNagle => Scheduler::Threaded,
            _ => Scheduler::Synchronous,
        }
    }

    pub fn policy(&self, window: Duration) -> FlushPolicy {
        match self {
            TesterKind::AsyncCoalescing
            | TesterKind::ThreadedCoalescing
            | TesterKind::SimpleCoalescing => FlushPolicy::Coalescing { window },
            _ => FlushPolicy::Immediate,
        }
    }

    /// Whether Nagle's algorithm is disabled on the client socket.
    pub fn tcp_nodelay(&self) -> bool {
        !matches!(
            self,
            TesterKind::AsyncNagle | TesterKind::ThreadedNagle | TesterKind::SimpleNagle
        )
    }
}

/// Parse duration from string (e.g., "100us", "10ms", "2s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ns") {
        (stripped, "ns")
    } else if let Some(stripped) = s.strip_suffix("us") {
        (stripped, "us")
    } else if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    if unit == "ns" {
        if let Ok(nanos) = num_str.trim().parse::<u64>() {
            return Ok(Duration::from_nanos(nanos));
        }
    }

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ns" => num / 1e9,
        "us" => num / 1e6,
        "ms" => num / 1e3,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(Duration::from_secs_f64(seconds))
}

/// Parse the message end marker: one ASCII character or a `\n`, `\r`, `\t`
/// escape. The generator's filler byte is rejected.
pub fn parse_end_marker(s: &str) -> Result<u8, String> {
    let byte = match s {
        "\\n" => b'\n',
        "\\r" => b'\r',
        "\\t" => b'\t',
        _ => match s.as_bytes() {
            [b] if b.is_ascii() => *b,
            _ => return Err(format!("End marker must be a single ASCII character: {:?}", s)),
        },
    };
    if byte == crate::generator::FILLER {
        return Err(format!(
            "End marker must differ from the filler byte {:?}",
            crate::generator::FILLER as char
        ));
    }
    Ok(byte)
}
