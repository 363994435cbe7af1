use crate::{benchmark::BenchmarkConfig, metrics::Metrics, utils};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration recorded alongside the results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub testers: Vec<String>,
    pub msg_count: usize,
    pub queue_capacity: usize,
    pub coalesce_window: Duration,
    pub max_message_size: usize,
    pub end_marker: u8,
    pub seed: u64,
    pub read_size: usize,
}

impl From<&BenchmarkConfig> for TestConfiguration {
    fn from(config: &BenchmarkConfig) -> Self {
        Self {
            testers: config.testers.iter().map(ToString::to_string).collect(),
            msg_count: config.msg_count,
            queue_capacity: config.queue_capacity,
            coalesce_window: config.coalesce_window,
            max_message_size: config.max_message_size,
            end_marker: config.end_marker,
            seed: config.seed,
            read_size: config.read_size,
        }
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: utils::get_cpu_cores(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Final results document
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalBenchmarkResults {
    pub metadata: BenchmarkMetadata,
    pub configuration: TestConfiguration,
    pub results: Vec<Metrics>,
    pub summary: OverallSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_tests: usize,
    pub system_info: SystemInfo,
}

/// Overall summary across all testers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallSummary {
    pub total_messages: usize,
    pub total_bytes: usize,
    pub total_client_writes: usize,
    pub highest_throughput_tester: Option<String>,
    pub lowest_p99_tester: Option<String>,
}

/// One row group of the console report.
struct Statistic {
    title: &'static str,
    value: fn(&Metrics) -> String,
}

const STATISTICS: &[Statistic] = &[
    Statistic {
        title: "Run time",
        value: |m| utils::format_duration(m.run_time),
    },
    Statistic {
        title: "Throughput",
        value: |m| utils::format_message_rate(m.throughput),
    },
    Statistic {
        title: "Total bytes",
        value: |m| utils::format_bytes(m.total_bytes),
    },
    Statistic {
        title: "Writes (messages/write)",
        value: |m| format!("{} ({:.2})", m.client_writes, m.messages_per_write()),
    },
    Statistic {
        title: "Min latency",
        value: |m| utils::format_duration(m.min_latency),
    },
    Statistic {
        title: "Max latency",
        value: |m| utils::format_duration(m.max_latency),
    },
    Statistic {
        title: "Avg latency",
        value: |m| utils::format_duration(m.avg_latency),
    },
    Statistic {
        title: "p99 latency",
        value: |m| utils::format_duration(m.p99_latency),
    },
    Statistic {
        title: "p99.99 latency",
        value: |m| utils::format_duration(m.p9999_latency),
    },
];

/// Results manager for console and file output
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    configuration: TestConfiguration,
    run_id: String,
    results: Vec<Metrics>,
}

impl ResultsManager {
    pub fn new(output_file: Option<&Path>, config: &BenchmarkConfig) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            configuration: TestConfiguration::from(config),
            run_id: utils::generate_run_id(),
            results: Vec::new(),
        }
    }

    pub fn add_results(&mut self, results: impl IntoIterator<Item = Metrics>) {
        for metrics in results {
            debug!("Adding results for {}", metrics.name);
            self.results.push(metrics);
        }
    }

    pub fn results(&self) -> &[Metrics] {
        &self.results
    }

    /// Print the per-statistic comparison tables to stdout.
    pub fn display_stats(&self) {
        print!("{}", self.render_stats());
    }

    /// One table per statistic, one row per tester.
    pub fn render_stats(&self) -> String {
        let name_width = self
            .results
            .iter()
            .map(|m| m.name.len())
            .max()
            .unwrap_or(0)
            .max("Tester".len());
        let value_rows: Vec<Vec<String>> = STATISTICS
            .iter()
            .map(|stat| self.results.iter().map(|m| (stat.value)(m)).collect())
            .collect();

        let mut out = String::new();
        for (stat, values) in STATISTICS.iter().zip(&value_rows) {
            let value_width = values
                .iter()
                .map(|v| v.chars().count())
                .max()
                .unwrap_or(0)
                .max(stat.title.len());
            let widths = [name_width, value_width];

            out.push('\n');
            out.push_str(&utils::format_table_separator(&widths));
            out.push('\n');
            out.push_str(&utils::format_table_row(&["Tester", stat.title], &widths));
            out.push('\n');
            out.push_str(&utils::format_table_separator(&widths));
            out.push('\n');
            for (metrics, value) in self.results.iter().zip(values) {
                out.push_str(&utils::format_table_row(&[&metrics.name, value], &widths));
                out.push('\n');
            }
            out.push_str(&utils::format_table_separator(&widths));
            out.push('\n');
        }
        out
    }

    /// Write the results document if an output file is configured.
    pub fn finalize(&self) -> Result<()> {
        let Some(output_file) = &self.output_file else {
            debug!("No output file configured, skipping results document");
            return Ok(());
        };
        info!("Finalizing benchmark results");

        let document = self.build_document();
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(output_file, json)
            .with_context(|| format!("Failed to write results to {:?}", output_file))?;

        info!("Results written to: {:?}", output_file);
        Ok(())
    }

    fn build_document(&self) -> FinalBenchmarkResults {
        FinalBenchmarkResults {
            metadata: BenchmarkMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                timestamp: chrono::Utc::now(),
                total_tests: self.results.len(),
                system_info: SystemInfo::default(),
            },
            configuration: self.configuration.clone(),
            results: self.results.clone(),
            summary: self.calculate_overall_summary(),
        }
    }

    fn calculate_overall_summary(&self) -> OverallSummary {
        OverallSummary {
            total_messages: self.results.iter().map(|m| m.message_count).sum(),
            total_bytes: self.results.iter().map(|m| m.total_bytes).sum(),
            total_client_writes: self.results.iter().map(|m| m.client_writes).sum(),
            highest_throughput_tester: self
                .results
                .iter()
                .max_by(|a, b| {
                    a.throughput
                        .partial_cmp(&b.throughput)
                        .unwrap_or(Ordering::Equal)
                })
                .map(|m| m.name.clone()),
            lowest_p99_tester: self
                .results
                .iter()
                .min_by_key(|m| m.p99_latency)
                .map(|m| m.name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn metrics(name: &str, throughput: f64, p99_us: u64) -> Metrics {
        Metrics {
            name: name.to_string(),
            message_count: 100,
            total_bytes: 2_500,
            client_writes: 20,
            server_chunks: 10,
            run_time: Duration::from_millis(5),
            throughput,
            first_latency: Duration::from_micros(10),
            last_latency: Duration::from_micros(12),
            min_latency: Duration::from_micros(8),
            max_latency: Duration::from_micros(p99_us + 5),
            avg_latency: Duration::from_micros(11),
            p99_latency: Duration::from_micros(p99_us),
            p9999_latency: Duration::from_micros(p99_us + 5),
        }
    }

    #[test]
    fn test_summary_picks_best_testers() {
        let mut manager = ResultsManager::new(None, &BenchmarkConfig::default());
        manager.add_results(vec![
            metrics("simple nagle", 20_000.0, 40),
            metrics("async coalescing tester", 50_000.0, 90),
            metrics("threaded no_delay tester", 10_000.0, 15),
        ]);

        let summary = manager.calculate_overall_summary();
        assert_eq!(summary.total_messages, 300);
        assert_eq!(summary.total_bytes, 7_500);
        assert_eq!(summary.total_client_writes, 60);
        assert_eq!(
            summary.highest_throughput_tester.as_deref(),
            Some("async coalescing tester")
        );
        assert_eq!(
            summary.lowest_p99_tester.as_deref(),
            Some("threaded no_delay tester")
        );
    }

    #[test]
    fn test_render_stats_has_one_table_per_statistic() {
        let mut manager = ResultsManager::new(None, &BenchmarkConfig::default());
        manager.add_results(vec![
            metrics("simple nagle", 20_000.0, 40),
            metrics("simple no_delay", 30_000.0, 20),
        ]);

        let rendered = manager.render_stats();
        for stat in STATISTICS {
            assert!(rendered.contains(stat.title), "missing {}", stat.title);
        }
        assert_eq!(rendered.matches("| simple nagle").count(), STATISTICS.len());
        assert!(rendered.contains("20.00K msg/s"));
        assert!(rendered.contains("40.00μs"));
        assert!(rendered.contains("| Total bytes |"));
        assert!(rendered.contains("2.44 KB"));
    }

    #[test]
    fn test_finalize_writes_json_document() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut manager = ResultsManager::new(Some(temp_file.path()), &BenchmarkConfig::default());
        manager.add_results(vec![metrics("simple nagle", 20_000.0, 40)]);
        manager.finalize().unwrap();

        let json = std::fs::read_to_string(temp_file.path()).unwrap();
        let document: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(document["metadata"]["total_tests"], 1);
        assert_eq!(document["metadata"]["version"], crate::VERSION);
        assert_eq!(document["results"][0]["name"], "simple nagle");
        assert_eq!(document["configuration"]["msg_count"], crate::defaults::MSG_COUNT);
        assert_eq!(document["summary"]["lowest_p99_tester"], "simple nagle");
    }

    #[test]
    fn test_finalize_without_output_file_is_noop() {
        let manager = ResultsManager::new(None, &BenchmarkConfig::default());
        assert!(manager.finalize().is_ok());
        assert!(manager.results().is_empty());
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();
        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
    }
}
