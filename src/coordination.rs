//! # Receiver Process Coordination
//!
//! Parent-side management of the receiver process:
//!
//! ```text
//! ┌──────────────────────┐  TCP (payload)   ┌──────────────────────┐
//! │ client process       │ ───────────────► │ receiver process     │
//! │  TransportPipeline   │                  │  serve()             │
//! │                      │ ◄─────────────── │                      │
//! │  collector thread    │  stdout pipe     │  ReceiverEvent frames│
//! └──────────────────────┘                  └──────────────────────┘
//! ```
//!
//! The collector thread decodes frames from the pipe into an unbounded
//! channel as soon as they arrive. The receiver therefore never blocks on a
//! full pipe while the client is still writing, regardless of when the runner
//! gets around to reading the events.

use crate::generator::DataPoint;
use crate::receiver::{read_event, ReceiverConfig, ReceiverEvent};
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use os_pipe::PipeReader;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const BINARY_NAME: &str = "coalesce-bench";

/// Handle on a running receiver process.
///
/// Dropping the handle kills and reaps the process.
pub struct ReceiverProcess {
    child: Option<Child>,
    events: Receiver<ReceiverEvent>,
    collector: Option<JoinHandle<()>>,
    address: String,
    poll_interval: Duration,
}

impl ReceiverProcess {
    /// Start a receiver and wait until it reports its listening address.
    ///
    /// `exe` overrides the binary to launch; by default the running benchmark
    /// binary is re-executed.
    pub fn spawn(
        config: &ReceiverConfig,
        exe: Option<&Path>,
        verbosity: u8,
        startup_timeout: Duration,
    ) -> Result<Self> {
        let exe_path = match exe {
            Some(path) => path.to_path_buf(),
            None => resolve_binary()?,
        };
        let (reader, writer) =
            os_pipe::pipe().context("Failed to create OS pipe for the receiver channel")?;

        debug!("Spawning receiver binary: {}", exe_path.display());
        let mut cmd = Command::new(&exe_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(writer);
        cmd.stderr(Stdio::inherit());
        cmd.arg("--internal-run-as-receiver")
            .arg("--host")
            .arg(&config.host)
            .arg("--port")
            .arg(config.port.to_string())
            .arg("--read-size")
            .arg(config.read_size.to_string())
            .arg("--idle-timeout")
            .arg(duration_arg(config.idle_timeout));
        if verbosity > 0 {
            cmd.arg(format!("-{}", "v".repeat(verbosity as usize)));
        }

        let child = cmd.spawn().context("Failed to spawn receiver process")?;
        // Release the parent's copy of the write end so EOF is observed once
        // the child exits.
        drop(cmd);

        let (sender, events) = channel::unbounded();
        let collector = thread::Builder::new()
            .name("receiver-collector".to_string())
            .spawn(move || collect_events(reader, sender))
            .context("Failed to start receiver collector thread")?;

        let mut process = Self {
            child: Some(child),
            events,
            collector: Some(collector),
            address: String::new(),
            poll_interval: config.idle_timeout,
        };
        process.address = process.wait_ready(startup_timeout)?;
        debug!("Receiver ready on {}", process.address);
        Ok(process)
    }

    fn wait_ready(&mut self, startup_timeout: Duration) -> Result<String> {
        match self.events.recv_timeout(startup_timeout) {
            Ok(ReceiverEvent::Ready { address }) => Ok(address),
            Ok(ReceiverEvent::Failed { reason }) => {
                Err(anyhow!("Receiver failed to start: {}", reason))
            }
            Ok(other) => Err(anyhow!("Receiver sent {:?} before Ready", other)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("Receiver exited before reporting ready"))
            }
            Err(RecvTimeoutError::Timeout) => Err(anyhow!(
                "Receiver did not report ready within {:?}",
                startup_timeout
            )),
        }
    }

    /// Address the receiver is listening on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Events received but not yet consumed.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Collect the chunks of one test run, up to its end-of-stream event.
    ///
    /// Waits as long as the receiver process is alive.
    pub fn collect_stream(&mut self) -> Result<Vec<DataPoint>> {
        let mut chunks = Vec::new();
        loop {
            match self.events.recv_timeout(self.poll_interval) {
                Ok(ReceiverEvent::Chunk(chunk)) => chunks.push(chunk),
                Ok(ReceiverEvent::EndOfStream) => {
                    debug!("Collected {} chunks", chunks.len());
                    return Ok(chunks);
                }
                Ok(ReceiverEvent::Failed { reason }) => bail!("Receiver failed: {}", reason),
                Ok(ReceiverEvent::Ready { address }) => {
                    warn!("Ignoring repeated ready event from {}", address)
                }
                Err(RecvTimeoutError::Disconnected) => bail!(
                    "Receiver exited after {} chunks without an end of stream",
                    chunks.len()
                ),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(status) = self.exit_status()? {
                        bail!("Receiver exited with {} during a run", status);
                    }
                    debug!("Waiting for receiver end of stream ({} chunks so far)", chunks.len());
                }
            }
        }
    }

    fn exit_status(&mut self) -> Result<Option<std::process::ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Err(anyhow!("Receiver process already terminated")),
        }
    }

    /// Kill and reap the receiver, then stop the collector.
    pub fn terminate(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                if let Err(e) = child.kill() {
                    // Exited between the check and the kill.
                    if e.kind() != std::io::ErrorKind::InvalidInput {
                        return Err(e).context("Failed to kill receiver process");
                    }
                }
            }
            let status = child.wait().context("Failed to reap receiver process")?;
            debug!("Receiver process exited with {}", status);
        }
        if let Some(collector) = self.collector.take() {
            if collector.join().is_err() {
                warn!("Receiver collector thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ReceiverProcess {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Failed to clean up receiver process: {:#}", e);
        }
    }
}

fn collect_events(mut reader: PipeReader, sender: Sender<ReceiverEvent>) {
    loop {
        match read_event(&mut reader) {
            Ok(Some(event)) => {
                if sender.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("Receiver channel closed");
                return;
            }
            Err(e) => {
                let _ = sender.send(ReceiverEvent::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

/// Locate the benchmark binary.
///
/// Under `cargo test` the running executable is the test harness, so the
/// binary is looked up in this order: the current executable if it is the
/// benchmark, `CARGO_BIN_EXE_coalesce-bench`, then `target/debug` under the
/// manifest directory.
pub fn resolve_binary() -> Result<PathBuf> {
    let exe_name = format!("{}{}", BINARY_NAME, std::env::consts::EXE_SUFFIX);

    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    if current_exe.file_name().and_then(|n| n.to_str()) == Some(exe_name.as_str()) {
        return Ok(current_exe);
    }

    if let Ok(path) = std::env::var("CARGO_BIN_EXE_coalesce-bench") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    let fallback = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("debug")
        .join(&exe_name);
    if fallback.exists() {
        return Ok(fallback);
    }

    Err(anyhow!(
        "Could not resolve '{}' binary for receiver mode. Build it with \
         `cargo build --bin {}` first.",
        BINARY_NAME,
        BINARY_NAME
    ))
}

/// Render a duration as a command-line value without losing precision.
fn duration_arg(duration: Duration) -> String {
    format!("{}ns", duration.as_nanos())
}
