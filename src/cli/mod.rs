//! CLI command handlers
//!
//! Thin glue between the clap surface in `main.rs` and the [`Garden`]
//! aggregate: open the project, run the requested operation, print a human
//! summary and map the outcome to an exit code (0 success, 1 handled
//! failure, 2 internal error).

use colored::Colorize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

use crate::error::{GardenError, GardenResult};
use crate::garden::{Garden, GardenOpts};
use crate::plugin::PluginSpec;
use crate::tasks::{GraphResult, NodeStatus};

/// Global flags shared by every subcommand
pub struct GlobalOpts {
    pub root: Option<PathBuf>,
    pub environment: Option<String>,
    pub force: bool,
    pub force_build: bool,
    pub watch: bool,
}

pub enum Command {
    Build { modules: Vec<String> },
    Deploy { services: Vec<String> },
    Test { modules: Vec<String>, name: Option<String> },
    RunTask { task: String },
    RunModule { module: String, command: Vec<String> },
    Publish { modules: Vec<String> },
    Delete { services: Vec<String> },
    Get { what: GetTarget },
    Init,
    Plugins { plugin: String, command: String },
}

pub enum GetTarget {
    Modules,
    Status,
    Secret { provider: String, key: String },
}

/// Run a command against a project; returns the process exit code
pub async fn run(global: GlobalOpts, command: Command, plugins: Vec<PluginSpec>) -> i32 {
    match execute(global, command, plugins).await {
        Ok(code) => code,
        Err(err) => {
            error!(kind = %err.kind(), "command failed");
            eprintln!("{}", err.detail().red());
            err.exit_code()
        }
    }
}

async fn execute(
    global: GlobalOpts,
    command: Command,
    plugins: Vec<PluginSpec>,
) -> GardenResult<i32> {
    if global.watch {
        return Err(GardenError::config(
            "watch mode is provided by the file watcher component, which is not part of this binary",
        )
        .with_hint("re-run without --watch"));
    }

    let root = match global.root {
        Some(root) => root,
        None => std::env::current_dir()
            .map_err(|e| GardenError::io(PathBuf::from("."), e))?,
    };

    let opts = GardenOpts {
        environment: global.environment,
        plugins,
        force_init: matches!(command, Command::Init),
        ..Default::default()
    };
    let garden = Arc::new(Garden::open(root, opts).await?);
    install_interrupt_handler(&garden);

    let code = match command {
        Command::Build { modules } => {
            let result = garden.build(selection(&modules), global.force).await?;
            report(&result, "build")
        }
        Command::Deploy { services } => {
            let result = garden
                .deploy(selection(&services), global.force, global.force_build)
                .await?;
            report(&result, "deploy")
        }
        Command::Test { modules, name } => {
            let result = garden
                .test(
                    selection(&modules),
                    name.as_deref(),
                    global.force,
                    global.force_build,
                )
                .await?;
            report(&result, "test")
        }
        Command::RunTask { task } => {
            let result = garden.run_task(&task, global.force).await?;
            report(&result, "run task")
        }
        Command::RunModule { module, command } => {
            let result = garden
                .run_module(&module, command, global.force_build)
                .await?;
            report(&result, "run module")
        }
        Command::Publish { modules } => {
            let result = garden.publish(selection(&modules), global.force_build).await?;
            report(&result, "publish")
        }
        Command::Delete { services } => {
            let result = garden.delete_services(selection(&services)).await?;
            report(&result, "delete")
        }
        Command::Get { what } => {
            let value = match what {
                GetTarget::Modules => {
                    let modules: Vec<Value> = garden
                        .graph()
                        .modules()
                        .map(|m| {
                            serde_json::json!({
                                "name": m.name(),
                                "type": m.config.type_name,
                                "version": m.version_string(),
                                "path": m.path().display().to_string(),
                                "services": m.config.service_configs.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
                                "tests": m.config.test_configs.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
                            })
                        })
                        .collect();
                    Value::Array(modules)
                }
                GetTarget::Status => garden.environment_status(),
                GetTarget::Secret { provider, key } => garden.get_secret(&provider, &key).await?,
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
            0
        }
        Command::Init => {
            // Opening with force_init already prepared every provider
            println!(
                "{}",
                format!(
                    "Environment '{}' is ready.",
                    garden.environment_name
                )
                .green()
            );
            0
        }
        Command::Plugins { plugin, command } => {
            run_plugin_command(&garden, &plugin, &command).await?
        }
    };
    Ok(code)
}

async fn run_plugin_command(garden: &Garden, plugin: &str, command: &str) -> GardenResult<i32> {
    let result = garden.run_provider_command(plugin, command).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn selection(names: &[String]) -> Option<&[String]> {
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

/// Print a per-node summary and derive the exit code
fn report(result: &GraphResult, verb: &str) -> i32 {
    for node in result.results.values() {
        let line = match node.status {
            NodeStatus::Complete => {
                let cached = if node.cached { " (cached)" } else { "" };
                format!("{} {}{}", "✔".green(), node.key, cached)
            }
            NodeStatus::Failed => format!(
                "{} {}: {}",
                "✖".red(),
                node.key,
                node.error.as_deref().unwrap_or("failed")
            ),
            NodeStatus::Skipped => format!(
                "{} {} (skipped: {} failed)",
                "-".yellow(),
                node.key,
                node.dependency_failed.as_deref().unwrap_or("a dependency")
            ),
            NodeStatus::Cancelled => format!("{} {} (cancelled)", "-".yellow(), node.key),
        };
        println!("{}", line);
    }

    if result.succeeded() {
        println!("{}", format!("{} succeeded", verb).green().bold());
        0
    } else {
        eprintln!("{}", format!("{} failed", verb).red().bold());
        1
    }
}

/// First Ctrl-C cancels cooperatively; the runtime's default handler takes
/// over if the user insists.
fn install_interrupt_handler(garden: &Arc<Garden>) {
    let garden = garden.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, waiting for in-flight work (Ctrl-C again to abort)");
            garden.cancel();
        }
    });
}
