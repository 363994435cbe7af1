use crate::generator::DataPoint;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Statistics of one tester run.
///
/// Computed once from the produced messages, the received chunks and the
/// correlated latencies; never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub name: String,
    pub message_count: usize,
    pub total_bytes: usize,
    /// Socket writes issued by the pipeline, stop sentinel excluded.
    pub client_writes: usize,
    /// Reads that delivered payload bytes on the receiver side.
    pub server_chunks: usize,
    /// Last arrival minus first production.
    pub run_time: Duration,
    /// Messages per second over `run_time`.
    pub throughput: f64,
    pub first_latency: Duration,
    pub last_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub avg_latency: Duration,
    pub p99_latency: Duration,
    pub p9999_latency: Duration,
}

impl Metrics {
    /// Reduce one run into its statistics.
    ///
    /// `latencies` must hold one sample per produced message, in production
    /// order, as returned by [`correlate`](crate::correlator::correlate).
    pub fn from_run(
        name: impl Into<String>,
        produced: &[DataPoint],
        received: &[DataPoint],
        latencies: &[Duration],
        client_writes: usize,
    ) -> Result<Self> {
        let name = name.into();
        let (first_produced, last_arrival) = match (produced.first(), received.last()) {
            (Some(first), Some(last)) => (first.timestamp_ns, last.timestamp_ns),
            _ => return Err(anyhow!("Run '{}' produced or received nothing", name)),
        };
        if latencies.len() != produced.len() {
            return Err(anyhow!(
                "Run '{}' has {} latencies but expected {}",
                name,
                latencies.len(),
                produced.len()
            ));
        }

        let run_time = Duration::from_nanos(last_arrival.saturating_sub(first_produced));
        let throughput = if run_time.is_zero() {
            0.0
        } else {
            produced.len() as f64 / run_time.as_secs_f64()
        };

        let summary = LatencySummary::from_samples(latencies)
            .ok_or_else(|| anyhow!("Run '{}' has no latency samples", name))?;
        let [p99_latency, p9999_latency] = percentiles(latencies, [99.0, 99.99])
            .ok_or_else(|| anyhow!("Run '{}' has no latency samples", name))?;

        Ok(Self {
            name,
            message_count: produced.len(),
            total_bytes: produced.iter().map(DataPoint::len).sum(),
            client_writes,
            server_chunks: received.len(),
            run_time,
            throughput,
            first_latency: summary.first,
            last_latency: summary.last,
            min_latency: summary.min,
            max_latency: summary.max,
            avg_latency: summary.avg,
            p99_latency,
            p9999_latency,
        })
    }

    /// Mean number of messages carried by one socket write.
    pub fn messages_per_write(&self) -> f64 {
        if self.client_writes == 0 {
            0.0
        } else {
            self.message_count as f64 / self.client_writes as f64
        }
    }
}

/// Linear-scan statistics over a latency sequence.
struct LatencySummary {
    first: Duration,
    last: Duration,
    min: Duration,
    max: Duration,
    avg: Duration,
}

impl LatencySummary {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        let first = *samples.first()?;
        let last = *samples.last()?;
        let mut min = first;
        let mut max = first;
        let mut total_ns: u128 = 0;
        for &sample in samples {
            min = min.min(sample);
            max = max.max(sample);
            total_ns += sample.as_nanos();
        }
        let avg_ns = total_ns / samples.len() as u128;
        Some(Self {
            first,
            last,
            min,
            max,
            avg: Duration::from_nanos(avg_ns as u64),
        })
    }
}

/// Nearest-rank percentile of a non-empty ascending slice.
fn nearest_rank(sorted: &[Duration], percent: f64) -> Duration {
    let rank = (sorted.len() as f64 * percent / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Nearest-rank percentiles: sort a copy ascending once, then take index
/// `ceil(len * percent / 100) - 1` for each requested percent.
///
/// `None` for an empty input. The input is not modified.
///
/// ```rust
/// # use coalesce_bench::metrics::percentiles;
/// # use std::time::Duration;
/// let latencies: Vec<Duration> = (1..=100).rev().map(Duration::from_micros).collect();
/// let [p50, p99] = percentiles(&latencies, [50.0, 99.0]).unwrap();
/// assert_eq!(p50, Duration::from_micros(50));
/// assert_eq!(p99, Duration::from_micros(99));
/// ```
pub fn percentiles<const N: usize>(
    latencies: &[Duration],
    percents: [f64; N],
) -> Option<[Duration; N]> {
    if latencies.is_empty() {
        return None;
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();
    Some(percents.map(|percent| nearest_rank(&sorted, percent)))
}
