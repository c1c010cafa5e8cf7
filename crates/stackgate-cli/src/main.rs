mod commands;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use stackgate_core::{install_signal_handler, Engine};
use stackgate_schema::Config;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stackgate",
    version,
    about = "Plan and apply infrastructure changes per environment"
)]
struct Cli {
    /// Path to the configuration file (default: ./stackgate.toml if present).
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Show a spinner instead of streaming engine output.
    #[arg(long, short, default_value_t = false, global = true)]
    quiet: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage environments.
    #[command(subcommand)]
    Env(EnvCommands),
    /// Plan a revision of an environment as a new change.
    Plan {
        /// Environment id or name.
        env: String,
        /// Commit to check out.
        revision: String,
    },
    /// Apply a planned change (the most recent one by default).
    Apply {
        /// Environment id or name.
        env: String,
        /// Change id to apply.
        #[arg(long)]
        change: Option<u64>,
    },
    /// Verify store integrity.
    VerifyStore,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum EnvCommands {
    /// Register a new environment.
    Add(EnvAddArgs),
    /// Register every `[[environment]]` defined in a TOML file.
    Import {
        /// Path to the environments file.
        file: PathBuf,
    },
    /// List all known environments.
    List,
    /// Show an environment and its change history.
    Show {
        /// Environment id or name.
        env: String,
    },
}

#[derive(Debug, Args)]
struct EnvAddArgs {
    /// Unique environment name.
    name: String,
    /// Repository URL holding the infrastructure configuration.
    #[arg(long)]
    repo: String,
    /// Environment id (default: next free id).
    #[arg(long)]
    id: Option<u64>,
    /// Branch to clone.
    #[arg(long, default_value = "master")]
    branch: String,
    /// Subdirectory of the repository the engine runs in.
    #[arg(long, default_value = "")]
    path: String,
    /// Input variable binding, repeatable.
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = commands::parse_var)]
    vars: Vec<(String, String)>,
    /// Apply automatically after every successful plan.
    #[arg(long, default_value_t = false)]
    auto_apply: bool,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STACKGATE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        return exit_code(commands::completions::run::<Cli>(shell));
    }

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: config error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    install_signal_handler();

    let engine = match Engine::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => return exit_code(Err(e.to_string())),
    };
    let output = commands::OutputMode::new(cli.json, cli.quiet);

    let result = match cli.command {
        Commands::Env(EnvCommands::Add(args)) => commands::env::add(
            &engine,
            commands::env::AddRequest {
                id: args.id,
                name: args.name,
                repo: args.repo,
                branch: args.branch,
                path: args.path,
                vars: args.vars,
                auto_apply: args.auto_apply,
            },
            output,
        ),
        Commands::Env(EnvCommands::Import { file }) => {
            commands::env::import(&engine, &file, output)
        }
        Commands::Env(EnvCommands::List) => commands::env::list(&engine, output),
        Commands::Env(EnvCommands::Show { env }) => commands::env::show(&engine, &env, output),
        Commands::Plan { env, revision } => commands::plan::run(&engine, &env, &revision, output),
        Commands::Apply { env, change } => commands::apply::run(&engine, &env, change, output),
        Commands::VerifyStore => commands::verify_store::run(&engine, output),
        Commands::Completions { .. } => Ok(commands::EXIT_SUCCESS),
    };

    exit_code(result)
}

fn exit_code(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("schema error:") || msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
