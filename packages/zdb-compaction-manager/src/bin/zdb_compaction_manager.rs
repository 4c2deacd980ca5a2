//! zdb-compaction-manager - supervises a 0-db server and compacts it on a schedule
//!
//! Usage:
//!   zdb-compaction-manager [--config config.yaml] [--verbose]
//!
//! Exits with the server's exit code once the server stops for any reason
//! other than a scheduled compaction. SIGINT/SIGTERM stop the server and
//! exit without restarting it.

use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};
use std::thread;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use zdb_compaction_manager::schedule;
use zdb_compaction_manager::{BackendState, CompactionSchedule, CompactionTrigger, ManagerConfig, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "zdb-compaction-manager", version, about)]
struct Cli {
    /// Config file location
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<ExitStatus> {
    let config = ManagerConfig::from_yaml_file(&cli.config)
        .with_context(|| format!("loading config {:?}", cli.config))?;
    let compaction_schedule = CompactionSchedule::parse(&config.schedule)?;
    tracing::info!(schedule = compaction_schedule.expr(), "compaction schedule");

    let state = BackendState::open(&config.backend_dir)
        .with_context(|| format!("resolving generation under {:?}", config.backend_dir))?;
    tracing::info!(
        generation = state.generation(),
        data = ?state.data_dir(),
        index = ?state.index_dir(),
        "active generation"
    );

    let mut supervisor = Supervisor::new(state, config.server_settings(), config.toolchain());

    forward_shutdown_signals(supervisor.trigger())?;
    let _scheduler = schedule::start(compaction_schedule, supervisor.trigger())?;

    let status = supervisor.run().context("running zdb")?;
    Ok(status)
}

/// Turn SIGINT/SIGTERM into a supervisor shutdown request
fn forward_shutdown_signals(trigger: CompactionTrigger) -> anyhow::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("registering signal handlers")?;

    thread::Builder::new()
        .name("signal-forwarder".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                tracing::info!(signal = sig, "received signal, stopping server");
                trigger.shutdown();
            }
        })
        .context("spawning signal thread")?;

    Ok(())
}

fn exit_code(status: ExitStatus) -> ExitCode {
    if status.success() {
        return ExitCode::SUCCESS;
    }
    tracing::warn!(%status, "server terminated");
    match status.code() {
        Some(code) => ExitCode::from(code.clamp(1, 255) as u8),
        None => ExitCode::FAILURE,
    }
}
