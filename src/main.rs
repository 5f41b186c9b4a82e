//! Employee worker binary
//!
//! Started by the boss with its environment set. Every setting can also be
//! given as a flag, which wins over the environment.

use std::process;
use std::time::Duration;

use clap::Parser;
use employee::config::{env, ConfigSource};
use employee::crash::CrashReporter;
use employee::executor::{panic, Executor};
use employee::{bootstrap, builtins, fork_guard, mapreduce};
use employee::{FunctionRegistry, LogContext, LoopExit, StandaloneContext, Worker, WorkerConfig};

/// How long to wait for queued reports before exiting.
const EXIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "employee")]
#[command(about = "Per-job worker process", version)]
struct Cli {
    /// Directory holding the boss socket
    #[arg(long, env = env::SERVER_ADDRESS)]
    server_address: Option<String>,

    /// Boss port
    #[arg(long, env = env::SERVER_PORT)]
    server_port: Option<String>,

    /// Job descriptor announced to the boss
    #[arg(long, env = env::QDESC)]
    qdesc: Option<String>,

    /// Data-source root for map-phase jobs
    #[arg(long, env = env::FILES_ROOT)]
    files_root: Option<String>,

    /// Upstream results directory for reduce-phase jobs
    #[arg(long, env = env::RESULTS_DIR)]
    results_dir: Option<String>,

    /// Do not cap the process count of jobs
    #[arg(long)]
    no_containment: bool,
}

impl Cli {
    fn source(&self) -> ConfigSource {
        ConfigSource {
            server_address: self.server_address.clone(),
            server_port: self.server_port.clone(),
            qdesc: self.qdesc.clone(),
            files_root: self.files_root.clone(),
            results_dir: self.results_dir.clone(),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let log = LogContext::new();
    if let Err(e) = log.install() {
        eprintln!("employee: could not install logging: {}", e);
    }
    panic::install_hook();

    let mut config = match WorkerConfig::from_source(cli.source()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("employee: {}", e);
            process::exit(1);
        }
    };
    if cli.no_containment {
        config.executor.containment = false;
    }

    let channel = match bootstrap::start(&config, &log) {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("employee: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = fork_guard::install(channel.raw_fd()) {
        tracing::warn!(error = %e, "could not install fork guard");
    }

    let registry = FunctionRegistry::new();
    mapreduce::register_builtins(&registry);
    builtins::register(&registry);

    let context = StandaloneContext::new(config.files_root.clone(), config.results_dir.clone());
    let executor = Executor::new(config.executor.clone(), registry, Box::new(context));
    let mut worker = Worker::new(channel, executor, log);

    match worker.run() {
        LoopExit::Died => tracing::info!("exiting on request"),
        LoopExit::Terminated(reason) => tracing::info!(%reason, "exiting after job"),
        LoopExit::ConnectionLost(e) => tracing::warn!(error = %e, "exiting without boss"),
    }

    match worker.channel().flush(EXIT_FLUSH_TIMEOUT) {
        Ok(true) => {}
        Ok(false) => tracing::warn!("exiting with unsent reports"),
        Err(e) => tracing::debug!(error = %e, "channel already closed"),
    }

    CrashReporter::disable();
    process::exit(0);
}
