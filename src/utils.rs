//! # Utility Functions
//!
//! Helpers shared by the runner, the receiver and the results output:
//!
//! - **Timing**: wall-clock timestamps comparable across processes
//! - **Formatting**: human-readable durations, byte counts and message rates
//! - **Validation**: configuration checks with clear error messages
//! - **Display**: plain-text table rows for the console report
//!
//! ```rust
//! use coalesce_bench::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_message_rate(15500.0), "15.50K msg/s");
//!
//! validate_queue_capacity(1000)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Largest message the generator may be asked to produce.
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Unique identifier of one benchmark run (UUID v4).
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Nanoseconds since the Unix epoch.
///
/// Production and arrival timestamps are taken in different processes, so a
/// monotonic clock cannot be used. Returns 0 if the clock reads before the
/// epoch.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Format a duration in a human-readable way
///
/// Picks the largest unit that keeps the value at or above one:
///
/// ```rust
/// # use coalesce_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        if minutes < 60 {
            format!("{}m {}s", minutes, seconds % 60)
        } else {
            format!("{}h {}m {}s", minutes / 60, minutes % 60, seconds % 60)
        }
    }
}

/// Format a byte count with binary (1024-based) units
pub fn format_bytes(bytes: usize) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a message rate with decimal (1000-based) units
///
/// ```rust
/// # use coalesce_bench::utils::format_message_rate;
/// assert_eq!(format_message_rate(750.0), "750 msg/s");
/// assert_eq!(format_message_rate(2300000.0), "2.30M msg/s");
/// ```
pub fn format_message_rate(messages_per_second: f64) -> String {
    if messages_per_second < 1000.0 {
        format!("{:.0} msg/s", messages_per_second)
    } else if messages_per_second < 1_000_000.0 {
        format!("{:.2}K msg/s", messages_per_second / 1000.0)
    } else {
        format!("{:.2}M msg/s", messages_per_second / 1_000_000.0)
    }
}

/// Validate a receiver port
///
/// Port 0 asks the OS for a free port. Other ports below 1024 need root
/// privileges and are rejected.
pub fn validate_port(port: u16) -> Result<()> {
    if port != 0 && port < 1024 {
        anyhow::bail!("Port number {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Validate the producer/flusher queue capacity
pub fn validate_queue_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        anyhow::bail!("Queue capacity cannot be zero");
    }
    if capacity > 10_000_000 {
        anyhow::bail!("Queue capacity {} is too large (maximum 10000000)", capacity);
    }
    Ok(())
}

/// Validate the largest generated message size
///
/// A message is at least its end marker, so the minimum is one byte.
pub fn validate_message_size(message_size: usize) -> Result<()> {
    if message_size == 0 {
        anyhow::bail!("Message size cannot be zero");
    }
    if message_size > MAX_MESSAGE_SIZE_LIMIT {
        anyhow::bail!("Message size {} is too large (maximum 16MB)", message_size);
    }
    Ok(())
}

/// Validate the receiver's read size
pub fn validate_read_size(read_size: usize) -> Result<()> {
    if read_size == 0 {
        anyhow::bail!("Read size cannot be zero");
    }
    if read_size > 64 * 1024 * 1024 {
        anyhow::bail!("Read size {} is too large (maximum 64MB)", read_size);
    }
    Ok(())
}

/// Logical CPU cores available to this process.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Format a table row
///
/// ```rust
/// # use coalesce_bench::utils::{format_table_row, format_table_separator};
/// let widths = [12, 7];
/// assert_eq!(format_table_separator(&widths), "+--------------+---------+");
/// assert_eq!(
///     format_table_row(&["simple nagle", "41.20μs"], &widths),
///     "| simple nagle | 41.20μs |"
/// );
/// ```
pub fn format_table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut row = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        row.push_str(&format!(" {:width$} |", column, width = width));
    }
    row
}

/// Format a table separator matching `format_table_row` column widths
pub fn format_table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}
