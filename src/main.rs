//! # Coalesce Bench - Main Entry Point
//!
//! The same binary plays two roles:
//!
//! - **Client** (default): parses the configuration, spawns the receiver,
//!   runs every selected tester and reports the results
//! - **Receiver** (`--internal-run-as-receiver`, spawned by the client):
//!   accepts the benchmark connection and streams timestamped chunks back
//!   over stdout
//!
//! `main` is synchronous. The cooperative testers build their own
//! single-threaded runtime and the receiver builds one for itself.

use anyhow::Result;
use clap::Parser;
use coalesce_bench::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::Args,
    logging::{self, Role},
    receiver::{self, ReceiverConfig},
    results::ResultsManager,
};
use tracing::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.internal_run_as_receiver {
        // Stdout is the event channel; logs go to stderr only.
        let _guard = logging::init(Role::Receiver, args.verbose, args.quiet, None)?;
        return run_receiver(&args);
    }

    let _guard = logging::init(
        Role::Client,
        args.verbose,
        args.quiet,
        args.log_file.as_deref(),
    )?;
    info!("Starting Coalesce Bench {}", coalesce_bench::VERSION);

    let config = BenchmarkConfig::from_args(&args)?;
    let mut results_manager = ResultsManager::new(args.output_file.as_deref(), &config);

    match BenchmarkRunner::new(config).run() {
        Ok(results) => results_manager.add_results(results),
        Err(e) => {
            error!("Benchmark failed: {:#}", e);
            return Err(e);
        }
    }

    results_manager.display_stats();
    results_manager.finalize()?;

    info!("Coalesce Bench completed successfully");
    Ok(())
}

fn run_receiver(args: &Args) -> Result<()> {
    let config = ReceiverConfig {
        host: args.host.clone(),
        port: args.port,
        read_size: args.read_size,
        idle_timeout: args.idle_timeout,
        sentinel: coalesce_bench::STOP_SENTINEL.to_vec(),
    };
    receiver::run_receiver_process(config).map_err(|e| {
        error!("Receiver failed: {:#}", e);
        e
    })
}
