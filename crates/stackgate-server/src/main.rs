use clap::Parser;
use stackgate_core::{install_signal_handler, Engine};
use stackgate_schema::Config;
use stackgate_server::{bind, serve, spawn_event_logger, App};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stackgate-server", version, about = "stackgate HTTP server")]
struct Cli {
    /// Path to the configuration file (default: ./stackgate.toml if present).
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `server.listen`).
    #[arg(long)]
    listen: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STACKGATE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("config error: {e}");
            return ExitCode::from(2);
        }
    };
    let engine = match Engine::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(3);
        }
    };

    let addr = cli.listen.unwrap_or(config.server.listen);
    let server = match bind(&addr) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!("starting stackgate-server on {addr}");
    info!("store directory: {}", config.store_dir.display());
    info!("work directory: {}", config.root_folder.display());

    install_signal_handler();
    let app = App::new(engine);
    spawn_event_logger(&app);

    match serve(&app, &server, &AtomicBool::new(false)) {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
