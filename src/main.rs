//! prefork-server
//!
//! A pre-forking HTTP application server built with Tokio and Hyper.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────┐
//!                      │                 SUPERVISOR                   │
//!     SIGTERM/INT ────▶│  signals ─┐                                  │
//!     SIGHUP/QUIT      │  admin ───┼──▶ control loop ──▶ worker table │
//!     file changes     │  watcher ─┘        │                         │
//!                      │                    │ spawn (fd inherited)    │
//!                      │   listening  ◀─────┤ SIGTERM / SIGKILL       │
//!                      │   endpoint         │ status lines (stdout)   │
//!                      └───────┬────────────┼─────────────────────────┘
//!                              │ shared fd  │
//!              ┌───────────────┼────────────┼───────────────┐
//!              ▼               ▼            ▼               ▼
//!         ┌─────────┐     ┌─────────┐  ┌─────────┐     ┌─────────┐
//!         │ worker  │     │ worker  │  │ worker  │ ... │ worker  │
//!         │ accept  │     │ accept  │  │ accept  │     │ accept  │
//!         │ → http  │     │ → http  │  │ → http  │     │ → http  │
//!         │ → app   │     │ → app   │  │ → app   │     │ → app   │
//!         └─────────┘     └─────────┘  └─────────┘     └─────────┘
//! ```
//!
//! The same binary runs both roles: without a subcommand it supervises,
//! `prefork-server worker` (spawned by the supervisor) serves.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use prefork_server::app::demo;
use prefork_server::config::{self, ConfigOverrides, ExecutionModel, ServerConfig};
use prefork_server::config::schema::LogFormat;
use prefork_server::config::watcher::ReloadWatcher;
use prefork_server::lifecycle::signals::SupervisorSignals;
use prefork_server::observability::{logging, metrics};
use prefork_server::supervisor::spawn::WorkerCommand;
use prefork_server::supervisor::Supervisor;
use prefork_server::worker::run_worker_process;
use prefork_server::ServerError;

#[derive(Parser)]
#[command(name = "prefork-server", version)]
#[command(about = "Pre-forking HTTP application server", long_about = None)]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run as a pool worker (started by the supervisor)
    #[command(hide = true)]
    Worker,
}

#[derive(Args)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long, env = "PREFORK_CONFIG")]
    config: Option<PathBuf>,

    /// Number of worker processes
    #[arg(short, long, env = "PREFORK_WORKERS")]
    workers: Option<usize>,

    /// Address to listen on (host:port)
    #[arg(short, long, env = "PREFORK_BIND")]
    bind: Option<String>,

    /// Execution model: `sync` or `async_event_loop`
    #[arg(short = 'k', long = "worker-class", env = "PREFORK_WORKER_CLASS")]
    worker_class: Option<ExecutionModel>,

    /// Blocking threads per worker for the sync model
    #[arg(long, env = "PREFORK_THREADS")]
    threads: Option<usize>,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, env = "PREFORK_GRACEFUL_TIMEOUT")]
    graceful_timeout: Option<u64>,

    #[arg(long, env = "PREFORK_LOG_LEVEL")]
    log_level: Option<String>,
}

impl ServeArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            workers: self.workers,
            bind: self.bind.clone(),
            execution_model: self.worker_class,
            threads: self.threads,
            graceful_timeout_secs: self.graceful_timeout,
            log_level: self.log_level.clone(),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Command::Worker) => match run_worker_process(demo::application) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("prefork-server worker: {e}");
                1
            }
        },
        None => run_supervisor(&cli.serve),
    };

    std::process::exit(code);
}

fn run_supervisor(args: &ServeArgs) -> i32 {
    let config = match config::load(args.config.as_deref(), &args.overrides()) {
        Ok(config) => config,
        Err(e) => {
            logging::init_logging("info", LogFormat::Pretty);
            tracing::error!(error = %e, "Configuration rejected");
            return ServerError::from(e).exit_code();
        }
    };

    logging::init_logging(&config.observability.log_level, config.observability.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "prefork-server starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build runtime");
            return 1;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            e.exit_code()
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let signals = SupervisorSignals::install()?;
    let command = WorkerCommand::current_exe()?;
    let supervisor = Supervisor::start(config.clone(), command).await?;
    let handle = supervisor.handle();

    tokio::spawn(signals.forward(handle.clone()));

    if config.admin.enabled {
        let admin = config.admin.clone();
        let admin_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = prefork_server::admin::serve_admin(&admin, admin_handle).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    // Dropping the watcher stops it, so it lives as long as the pool.
    let _watcher = if config.reload.watch_paths.is_empty() {
        None
    } else {
        let paths = config.reload.watch_paths.iter().map(PathBuf::from).collect();
        match ReloadWatcher::new(paths, config.reload.debounce()).run(handle.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "File watching disabled");
                None
            }
        }
    };

    supervisor.monitor().await;
    Ok(())
}
