//! txrelay: multi-process bitcoin raw-transaction front-end.
//!
//! Without `--worker-id` this process is the supervisor; with it, a
//! worker. The supervisor re-executes its own binary to spawn the
//! worker fleet.

mod net;
mod supervisor;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use txrelay_http::config::Config;

#[derive(Parser)]
#[command(name = "txrelay", version, about = "hardened bitcoin raw-transaction relay front-end")]
struct Args {
    /// Path to the configuration file.
    #[arg(default_value = "config.ini")]
    config: PathBuf,

    /// Override the number of worker processes.
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=64))]
    workers: Option<u8>,

    /// Validate the configuration and exit.
    #[arg(short, long)]
    test: bool,

    /// Internal: run as worker with this id.
    #[arg(long, hide = true)]
    worker_id: Option<usize>,
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn init_logging(config: &Config, identity: &str) {
    let level = if config.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    if config.json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }

    // every event from this process carries its identity.
    let span = tracing::info_span!("proc", id = %identity).entered();
    std::mem::forget(span);
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // worker mode: this process was spawned by the supervisor.
    if let Some(worker_id) = args.worker_id {
        init_logging(&config, &format!("worker[{worker_id}]"));
        return match worker::run(worker_id, config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("worker {worker_id} failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let num_workers = args
        .workers
        .map(usize::from)
        .unwrap_or_else(num_cpus)
        .clamp(1, 64);

    if args.test {
        println!("configuration ok:\n{config}");
        println!("workers: {num_workers}");
        println!("cpus available: {}", num_cpus());
        return ExitCode::SUCCESS;
    }

    init_logging(&config, "master");
    info!("configuration loaded from {}", args.config.display());
    info!("workers: {num_workers}, cpus: {}", num_cpus());
    info!("listen port: {}", config.listen_port);

    supervisor::run(&args.config, &config, num_workers)
}
