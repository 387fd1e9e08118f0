use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use garden::cli::{self, Command, GetTarget, GlobalOpts};

/// Orchestrate builds, deployments, tasks and tests across a project of
/// interdependent modules
#[derive(Parser)]
#[command(name = "garden")]
#[command(about = "garden - a polyglot development orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true, value_name = "PATH")]
    root: Option<PathBuf>,

    /// Environment to operate against
    #[arg(long = "env", global = true, value_name = "NAME")]
    environment: Option<String>,

    /// Re-run even when cached results exist
    #[arg(long, global = true)]
    force: bool,

    /// Force rebuilds of all involved modules
    #[arg(long = "force-build", global = true)]
    force_build: bool,

    /// Watch sources and re-run on change (requires the watcher component)
    #[arg(long, global = true)]
    watch: bool,

    /// Log output style
    #[arg(long = "logger-type", global = true, default_value = "basic", value_parser = ["basic", "json"])]
    logger_type: String,

    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build modules (all by default)
    Build {
        /// Module names to build
        modules: Vec<String>,
    },
    /// Deploy services (all by default)
    Deploy {
        /// Service names to deploy
        services: Vec<String>,
    },
    /// Run tests (all by default)
    Test {
        /// Restrict to these modules
        modules: Vec<String>,

        /// Only run tests whose name matches this glob
        #[arg(short, long, value_name = "GLOB")]
        name: Option<String>,
    },
    /// Run a task or a module command
    Run {
        #[command(subcommand)]
        target: RunCommands,
    },
    /// Build and publish modules
    Publish {
        /// Module names to publish
        modules: Vec<String>,
    },
    /// Delete deployed services (all by default)
    Delete {
        /// Service names to delete
        services: Vec<String>,
    },
    /// Query project state
    Get {
        #[command(subcommand)]
        target: GetCommands,
    },
    /// Initialize the environment (runs provider preparation)
    Init,
    /// Run a plugin-provided command
    Plugins {
        /// Plugin name
        plugin: String,
        /// Command name
        command: String,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Run a one-shot task
    Task {
        /// Task name
        task: String,
    },
    /// Run a module's command
    Module {
        /// Module name
        module: String,
        /// Command and arguments to run
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum GetCommands {
    /// List configured modules
    Modules,
    /// Show provider statuses for the environment
    Status,
    /// Read a secret through a provider
    Secret {
        /// Provider name
        provider: String,
        /// Secret key
        key: String,
    },
}

fn init_tracing(verbose: u8, logger_type: &str) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("garden={}", default_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logger_type == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, &cli.logger_type);

    let global = GlobalOpts {
        root: cli.root,
        environment: cli.environment,
        force: cli.force,
        force_build: cli.force_build,
        watch: cli.watch,
    };

    let command = match cli.command {
        Commands::Build { modules } => Command::Build { modules },
        Commands::Deploy { services } => Command::Deploy { services },
        Commands::Test { modules, name } => Command::Test { modules, name },
        Commands::Run { target } => match target {
            RunCommands::Task { task } => Command::RunTask { task },
            RunCommands::Module { module, command } => Command::RunModule { module, command },
        },
        Commands::Publish { modules } => Command::Publish { modules },
        Commands::Delete { services } => Command::Delete { services },
        Commands::Get { target } => Command::Get {
            what: match target {
                GetCommands::Modules => GetTarget::Modules,
                GetCommands::Status => GetTarget::Status,
                GetCommands::Secret { provider, key } => GetTarget::Secret { provider, key },
            },
        },
        Commands::Init => Command::Init,
        Commands::Plugins { plugin, command } => Command::Plugins { plugin, command },
    };

    // Plugins are registered by the embedding distribution; the bare binary
    // ships with none and relies on the project to configure what it loads.
    let exit_code = cli::run(global, command, Vec::new()).await;
    std::process::exit(exit_code);
}
