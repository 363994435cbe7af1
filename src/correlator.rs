//! # Latency Correlator
//!
//! Nothing on the wire marks where one message ends and the next begins: the
//! sender may merge messages into one write and the receiver may split or
//! merge writes into arbitrary reads. Arrival times are recovered from byte
//! accounting alone.
//!
//! Two cumulative cursors walk the client messages (production order) and the
//! server chunks (arrival order). A message whose bytes end at cumulative
//! offset `c` is assigned the arrival time of the first chunk whose cumulative
//! offset reaches `c`, i.e. the read that completed the message.
//!
//! Both streams must carry exactly the same number of bytes (stop sentinel
//! excluded). Any difference means a pipeline lost or duplicated bytes and
//! the run is rejected.

use crate::generator::DataPoint;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error(
        "server stream ended after {server_bytes} bytes but message {message_index} \
         needs {client_bytes} bytes"
    )]
    ServerStreamShort {
        message_index: usize,
        client_bytes: usize,
        server_bytes: usize,
    },
    #[error("server delivered {server_bytes} bytes but the client produced only {client_bytes}")]
    ServerStreamLong {
        client_bytes: usize,
        server_bytes: usize,
    },
}

/// Compute one latency per client message, in production order.
///
/// A latency is `arrival - production`. When the wall clock stepped backwards
/// between the two timestamps the sample is clamped to zero and counted in a
/// warning.
pub fn correlate(
    client: &[DataPoint],
    server: &[DataPoint],
) -> Result<Vec<Duration>, CorrelationError> {
    let mut latencies = Vec::with_capacity(client.len());
    let mut chunks = server.iter();
    let mut client_offset = 0usize;
    let mut server_offset = 0usize;
    let mut arrival_ns = None;
    let mut clamped = 0usize;

    for (index, message) in client.iter().enumerate() {
        client_offset += message.len();
        while server_offset < client_offset || arrival_ns.is_none() {
            let chunk = chunks.next().ok_or(CorrelationError::ServerStreamShort {
                message_index: index,
                client_bytes: client_offset,
                server_bytes: server_offset,
            })?;
            server_offset += chunk.len();
            arrival_ns = Some(chunk.timestamp_ns);
        }

        // Set by the loop above before the first message is attributed.
        let arrival = arrival_ns.unwrap_or_default();
        if arrival < message.timestamp_ns {
            clamped += 1;
        }
        latencies.push(Duration::from_nanos(
            arrival.saturating_sub(message.timestamp_ns),
        ));
    }

    let remaining: usize = chunks.map(DataPoint::len).sum();
    if server_offset + remaining != client_offset {
        return Err(CorrelationError::ServerStreamLong {
            client_bytes: client_offset,
            server_bytes: server_offset + remaining,
        });
    }

    if clamped > 0 {
        warn!(
            "{} latency sample(s) clamped to zero: arrival preceded production (clock step?)",
            clamped
        );
    }
    Ok(latencies)
}
