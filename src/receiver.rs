//! # Receiver Process
//!
//! The receiver runs in its own process (the benchmark binary re-executed
//! with `--internal-run-as-receiver`). It accepts one TCP connection,
//! timestamps every read and reports what it saw to the parent over its
//! stdout.
//!
//! ## Parent Channel
//!
//! Every event is one frame: a little-endian `u32` length followed by the
//! bincode encoding of a [`ReceiverEvent`]. A run produces:
//!
//! ```text
//! Ready{address}  Chunk ... Chunk  EndOfStream  Chunk ... EndOfStream  (EOF)
//! ```
//!
//! `Ready` is sent once after the listener is bound. Each test run ends with
//! one `EndOfStream`, emitted when the byte stream ends with the stop
//! sentinel. A bind failure is reported as `Failed` before the process exits.

use crate::generator::DataPoint;
use crate::utils::current_timestamp_ns;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Frames larger than this are treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One record on the receiver-to-parent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReceiverEvent {
    /// Listener bound; the client may connect to `address`.
    Ready { address: String },
    /// One read from the connection, sentinel bytes removed.
    Chunk(DataPoint),
    /// The stop sentinel was seen; the current test run is complete.
    EndOfStream,
    /// The receiver could not start.
    Failed { reason: String },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("receiver channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed receiver frame: {0}")]
    Codec(#[from] bincode::Error),
    #[error("receiver frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
}

/// Encode one event as a length-prefixed frame.
pub fn encode_event(event: &ReceiverEvent) -> Result<Vec<u8>, ChannelError> {
    let body = bincode::serialize(event)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame. `Ok(None)` when the channel is closed at a frame boundary.
pub fn read_event<R: Read>(reader: &mut R) -> Result<Option<ReceiverEvent>, ChannelError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(bincode::deserialize(&body)?))
}

async fn send_event<O: AsyncWrite + Unpin>(out: &mut O, event: &ReceiverEvent) -> Result<()> {
    let frame = encode_event(event)?;
    out.write_all(&frame)
        .await
        .context("Failed to write to the parent channel")?;
    out.flush().await?;
    Ok(())
}

/// Receiver settings, passed from the parent on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub host: String,
    /// Port 0 binds an ephemeral port; `Ready` carries the actual address.
    pub port: u16,
    pub read_size: usize,
    pub idle_timeout: Duration,
    pub sentinel: Vec<u8>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::HOST.to_string(),
            port: crate::defaults::PORT,
            read_size: crate::defaults::READ_SIZE,
            idle_timeout: crate::defaults::IDLE_TIMEOUT,
            sentinel: crate::STOP_SENTINEL.to_vec(),
        }
    }
}

/// Result of feeding one read to a [`SentinelTracker`].
#[derive(Debug, Default, PartialEq)]
pub struct TrackerOutput {
    /// Records that can no longer contain sentinel bytes, in arrival order.
    pub chunks: Vec<DataPoint>,
    /// The stream ended with the sentinel; `chunks` completes the run.
    pub end_of_stream: bool,
}

/// Finds the stop sentinel at the tail of the received byte stream.
///
/// The sentinel may be split across any number of reads, so the trailing
/// records are held back until enough later bytes have arrived to rule out
/// their participation. Only the final `sentinel.len()` bytes are ever held.
#[derive(Debug)]
pub struct SentinelTracker {
    sentinel: Vec<u8>,
    pending: VecDeque<DataPoint>,
    pending_bytes: usize,
}

impl SentinelTracker {
    pub fn new(sentinel: Vec<u8>) -> Self {
        Self {
            sentinel,
            pending: VecDeque::new(),
            pending_bytes: 0,
        }
    }

    pub fn feed(&mut self, record: DataPoint) -> TrackerOutput {
        self.pending_bytes += record.len();
        self.pending.push_back(record);

        if self.ends_with_sentinel() {
            self.strip_sentinel();
            let chunks = self.pending.drain(..).filter(|r| !r.is_empty()).collect();
            self.pending_bytes = 0;
            return TrackerOutput {
                chunks,
                end_of_stream: true,
            };
        }

        let mut chunks = Vec::new();
        while let Some(front) = self.pending.front() {
            if self.pending_bytes - front.len() < self.sentinel.len() {
                break;
            }
            self.pending_bytes -= front.len();
            if let Some(front) = self.pending.pop_front() {
                if !front.is_empty() {
                    chunks.push(front);
                }
            }
        }
        TrackerOutput {
            chunks,
            end_of_stream: false,
        }
    }

    /// Records still held back, e.g. when the connection closes mid-run.
    pub fn take_pending(&mut self) -> Vec<DataPoint> {
        self.pending_bytes = 0;
        self.pending.drain(..).filter(|r| !r.is_empty()).collect()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    fn ends_with_sentinel(&self) -> bool {
        if self.sentinel.is_empty() || self.pending_bytes < self.sentinel.len() {
            return false;
        }
        let mut expected = self.sentinel.iter().rev();
        for byte in self.pending.iter().rev().flat_map(|r| r.data.iter().rev()) {
            match expected.next() {
                Some(e) if e == byte => {}
                Some(_) => return false,
                None => return true,
            }
        }
        expected.next().is_none()
    }

    fn strip_sentinel(&mut self) {
        let mut remaining = self.sentinel.len();
        while remaining > 0 {
            let Some(last) = self.pending.back_mut() else {
                break;
            };
            if last.len() <= remaining {
                remaining -= last.len();
                self.pending.pop_back();
            } else {
                let keep = last.len() - remaining;
                last.data.truncate(keep);
                remaining = 0;
            }
        }
        self.pending_bytes = self.pending.iter().map(DataPoint::len).sum();
    }
}

/// Serve one client connection, reporting to `out` until the client
/// disconnects.
pub async fn serve<O: AsyncWrite + Unpin>(config: &ReceiverConfig, out: &mut O) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let reason = format!("failed to bind {}: {}", addr, e);
            send_event(out, &ReceiverEvent::Failed { reason: reason.clone() }).await?;
            return Err(anyhow!(reason));
        }
    };
    let local_addr = listener.local_addr()?;
    debug!("Receiver listening on {}", local_addr);
    send_event(
        out,
        &ReceiverEvent::Ready {
            address: local_addr.to_string(),
        },
    )
    .await?;

    let (mut stream, peer) = loop {
        match timeout(config.idle_timeout, listener.accept()).await {
            Ok(accepted) => break accepted.context("Failed to accept client connection")?,
            Err(_) => debug!("Still waiting for a client on {}", local_addr),
        }
    };
    drop(listener);
    info!("Client connected from {}", peer);

    let mut tracker = SentinelTracker::new(config.sentinel.clone());
    let mut buf = vec![0u8; config.read_size.max(1)];
    let mut runs = 0usize;
    let mut chunks = 0usize;

    loop {
        let n = match timeout(config.idle_timeout, stream.read(&mut buf)).await {
            Err(_) => {
                debug!("No data for {:?}, reading again", config.idle_timeout);
                continue;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e).context("Failed to read from client connection"),
        };
        let arrival_ns = current_timestamp_ns();

        let output = tracker.feed(DataPoint::new(buf[..n].to_vec(), arrival_ns));
        for chunk in output.chunks {
            chunks += 1;
            send_event(out, &ReceiverEvent::Chunk(chunk)).await?;
        }
        if output.end_of_stream {
            runs += 1;
            debug!("Run {} complete after {} chunks", runs, chunks);
            chunks = 0;
            send_event(out, &ReceiverEvent::EndOfStream).await?;
        }
    }

    let leftover = tracker.take_pending();
    if !leftover.is_empty() {
        warn!(
            "Connection closed with {} bytes not followed by the stop sentinel",
            leftover.iter().map(DataPoint::len).sum::<usize>()
        );
    }
    info!("Client disconnected after {} run(s)", runs);
    Ok(())
}

/// Entry point of the receiver process: serve on a fresh runtime, reporting
/// on stdout.
pub fn run_receiver_process(config: ReceiverConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build receiver runtime")?;
    runtime.block_on(async {
        let mut stdout = tokio::io::stdout();
        serve(&config, &mut stdout).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::net::TcpStream;

    const SENTINEL: &[u8] = b"#STOP#";

    fn record(data: &[u8], timestamp_ns: u64) -> DataPoint {
        DataPoint::new(data.to_vec(), timestamp_ns)
    }

    fn concat(records: &[DataPoint]) -> Vec<u8> {
        records.iter().flat_map(|r| r.data.clone()).collect()
    }

    #[test]
    fn test_frame_codec() {
        let events = vec![
            ReceiverEvent::Ready {
                address: "127.0.0.1:4000".to_string(),
            },
            ReceiverEvent::Chunk(record(b"aaa\n", 42)),
            ReceiverEvent::EndOfStream,
        ];
        let mut wire = Vec::new();
        for event in &events {
            wire.extend(encode_event(event).unwrap());
        }

        let mut reader = Cursor::new(wire);
        for event in &events {
            assert_eq!(read_event(&mut reader).unwrap().as_ref(), Some(event));
        }
        assert!(read_event(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut reader = Cursor::new(u32::MAX.to_le_bytes().to_vec());
        assert!(matches!(
            read_event(&mut reader),
            Err(ChannelError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_sentinel_in_single_read() {
        let mut tracker = SentinelTracker::new(SENTINEL.to_vec());
        let output = tracker.feed(record(b"aa\nb\n#STOP#", 10));
        assert!(output.end_of_stream);
        assert_eq!(output.chunks, vec![record(b"aa\nb\n", 10)]);
        assert_eq!(tracker.pending_bytes(), 0);
    }

    #[test]
    fn test_sentinel_split_across_reads() {
        let mut tracker = SentinelTracker::new(SENTINEL.to_vec());
        let mut released = Vec::new();

        for (i, part) in [&b"aaaaaaaaaa\n"[..], b"bb\n#S", b"TO", b"P#"].iter().enumerate() {
            let output = tracker.feed(record(part, i as u64));
            released.extend(output.chunks);
            assert_eq!(output.end_of_stream, i == 3);
        }

        assert_eq!(concat(&released), b"aaaaaaaaaa\nbb\n");
        // The read that carried the sentinel's first byte keeps its payload
        // prefix and timestamp; reads holding only sentinel bytes vanish.
        assert_eq!(released.last(), Some(&record(b"bb\n", 1)));
        assert_eq!(released.len(), 2);
    }

    #[test]
    fn test_read_of_only_sentinel_is_dropped() {
        let mut tracker = SentinelTracker::new(SENTINEL.to_vec());
        let first = tracker.feed(record(b"abc\n", 1));
        let second = tracker.feed(record(SENTINEL, 2));
        let mut released = first.chunks;
        released.extend(second.chunks);
        assert!(second.end_of_stream);
        assert_eq!(released, vec![record(b"abc\n", 1)]);
    }

    #[test]
    fn test_early_records_are_released() {
        let mut tracker = SentinelTracker::new(SENTINEL.to_vec());
        assert!(tracker.feed(record(b"abc", 1)).chunks.is_empty());
        let output = tracker.feed(record(b"defghij", 2));
        assert_eq!(output.chunks, vec![record(b"abc", 1)]);
        assert_eq!(tracker.pending_bytes(), 7);
        assert_eq!(tracker.take_pending(), vec![record(b"defghij", 2)]);
    }

    #[test]
    fn test_partial_sentinel_prefix_is_not_end() {
        let mut tracker = SentinelTracker::new(SENTINEL.to_vec());
        let output = tracker.feed(record(b"xx#STO", 1));
        assert!(!output.end_of_stream);
        let output = tracker.feed(record(b"x\n", 2));
        assert!(!output.end_of_stream);
    }

    #[test]
    fn test_tracker_resets_between_runs() {
        let mut tracker = SentinelTracker::new(SENTINEL.to_vec());
        assert!(tracker.feed(record(b"a\n#STOP#", 1)).end_of_stream);
        let output = tracker.feed(record(b"b\n#STOP#", 2));
        assert!(output.end_of_stream);
        assert_eq!(output.chunks, vec![record(b"b\n", 2)]);
    }

    #[tokio::test]
    async fn test_serve_reports_chunks_and_end_of_stream() {
        let config = ReceiverConfig {
            port: 0,
            idle_timeout: Duration::from_millis(200),
            sentinel: SENTINEL.to_vec(),
            ..Default::default()
        };
        let (mut parent_side, mut receiver_side) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move { serve(&config, &mut receiver_side).await });

        // Ready arrives first.
        let mut len = [0u8; 4];
        parent_side.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        parent_side.read_exact(&mut body).await.unwrap();
        let address = match bincode::deserialize(&body).unwrap() {
            ReceiverEvent::Ready { address } => address,
            other => panic!("expected Ready, got {:?}", other),
        };

        let mut client = TcpStream::connect(&address).await.unwrap();
        client.write_all(b"hello\nworld\n").await.unwrap();
        client.write_all(SENTINEL).await.unwrap();

        let mut wire = Vec::new();
        let mut received = Vec::new();
        loop {
            let mut buf = [0u8; 1024];
            let n = parent_side.read(&mut buf).await.unwrap();
            wire.extend_from_slice(&buf[..n]);
            let mut cursor = Cursor::new(wire.clone());
            received.clear();
            let mut done = false;
            while let Ok(Some(event)) = read_event(&mut cursor) {
                match event {
                    ReceiverEvent::Chunk(chunk) => received.push(chunk),
                    ReceiverEvent::EndOfStream => done = true,
                    other => panic!("unexpected event {:?}", other),
                }
            }
            if done {
                break;
            }
        }
        assert_eq!(concat(&received), b"hello\nworld\n");
        assert!(received.iter().all(|c| c.timestamp_ns > 0));

        drop(client);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ReceiverConfig {
            port: occupied.local_addr().unwrap().port(),
            ..Default::default()
        };
        let mut out = Vec::new();
        assert!(serve(&config, &mut out).await.is_err());

        let event = read_event(&mut Cursor::new(out)).unwrap();
        assert!(matches!(event, Some(ReceiverEvent::Failed { .. })));
    }
}
