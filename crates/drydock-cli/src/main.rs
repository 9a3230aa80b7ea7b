mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::EXIT_FAILURE;
use drydock_core::{install_signal_handler, CoreError, Engine, EngineConfig};
use drydock_runtime::{MockBackend, Registry};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(
    name = "drydock",
    version,
    about = "Declarative orchestrator for ephemeral developer environments"
)]
struct Cli {
    /// Drydock home directory (defaults to $DRYDOCK_HOME, then ~/.drydock).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Provider backend for well-known resource types.
    #[arg(long, value_enum, default_value_t = Backend::Plugins, global = true)]
    backend: Backend,

    /// Maximum number of provider operations in flight.
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    parallelism: Option<u32>,

    /// Skip the check of network subnets against host interfaces.
    #[arg(long, default_value_t = false, global = true)]
    no_host_check: bool,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Only built-in types and executables found in the plugins directory.
    Plugins,
    /// In-memory recording backend for every well-known type.
    Mock,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create, update and remove resources so the environment matches a blueprint.
    Apply {
        /// Blueprint file or directory.
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Set a blueprint variable (repeatable).
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// TOML file of variable values.
        #[arg(long)]
        var_file: Option<PathBuf>,
    },
    /// Show what apply would change without touching any resource.
    Plan {
        /// Blueprint file or directory.
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Set a blueprint variable (repeatable).
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// TOML file of variable values.
        #[arg(long)]
        var_file: Option<PathBuf>,
    },
    /// Destroy every resource recorded in state.
    Destroy {
        /// Ask providers to remove resources even if they are in use.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Summarize committed resources by status.
    Status,
    /// Mark a resource so the next apply recreates it.
    Taint {
        /// Resource id, e.g. resource.container.consul.
        id: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
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
            tracing_subscriber::EnvFilter::try_from_env("DRYDOCK_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL"))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    if let Commands::Completions { shell } = cli.command {
        return finish(commands::completions::run::<Cli>(shell));
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let engine = match open_engine(&cli) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());
    let json = cli.json;
    let command = cli.command;

    let result = runtime.block_on(async {
        match command {
            Commands::Apply {
                path,
                vars,
                var_file,
            } => {
                commands::apply::run(&engine, &path, &vars, var_file.as_deref(), &cancel, json)
                    .await
            }
            Commands::Plan {
                path,
                vars,
                var_file,
            } => commands::plan::run(&engine, &path, &vars, var_file.as_deref(), json).await,
            Commands::Destroy { force } => {
                commands::destroy::run(&engine, force, &cancel, json).await
            }
            Commands::Status => commands::status::run(&engine, json),
            Commands::Taint { id } => commands::taint::run(&engine, &id, json).await,
            Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        }
    });
    finish(result)
}

fn open_engine(cli: &Cli) -> Result<Engine, CoreError> {
    let mut settings = EngineConfig::load(cli.home.clone())?;
    if let Some(n) = cli.parallelism {
        settings.max_parallelism = n as usize;
    }
    if cli.no_host_check {
        settings.check_host_interfaces = false;
    }

    let mut registry = Registry::with_builtins();
    if cli.backend == Backend::Mock {
        MockBackend::new().register_well_known(&mut registry)?;
    }
    Engine::new(settings, registry)
}

fn finish(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
