#![allow(dead_code)]

//! Shared fixtures for integration tests
//!
//! Provides a throwaway project directory builder and a `script` module type
//! whose handlers run real commands, so end-to-end flows exercise the full
//! load → graph → schedule → handler path.

use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use garden::plugin::{
    handler, ActionParams, ModuleAction, ModuleTypeDefinition, PluginSpec, ProviderAction,
};
use garden::process::{run_process, ProcessCommand};

/// Records handler invocations in order, for ordering assertions
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub struct FixtureProject {
    pub dir: TempDir,
}

impl FixtureProject {
    pub fn new(project_yaml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("garden.yml"), project_yaml).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn add_module(&self, name: &str, yaml: &str) -> &Self {
        let module_dir = self.dir.path().join(name);
        fs::create_dir_all(&module_dir).unwrap();
        fs::write(module_dir.join("garden.yml"), yaml).unwrap();
        // One source file so versions are content-sensitive
        fs::write(module_dir.join("source.txt"), format!("source of {}", name)).unwrap();
        self
    }
}

/// A plugin creating the `script` module type: builds, tests and tasks run
/// their `command` through the shell; services report ready with whatever
/// outputs their spec declares.
pub fn script_plugin(log: EventLog) -> PluginSpec {
    let build_log = log.clone();
    let test_log = log.clone();
    let task_log = log.clone();
    let deploy_log = log;

    PluginSpec::new("script-plugin")
        .handler(
            ProviderAction::GetEnvironmentStatus,
            handler(|_| async { Ok(json!({"ready": true, "outputs": {}})) }),
        )
        .create_module_type(
            ModuleTypeDefinition::new("script")
                .docs("Runs shell commands for builds, tests and tasks")
                .handler(
                    ModuleAction::Configure,
                    handler(|params: ActionParams| {
                        async move {
                            let services = params
                                .spec
                                .get("services")
                                .and_then(Value::as_array)
                                .cloned()
                                .unwrap_or_default()
                                .into_iter()
                                .map(|entry| {
                                    json!({
                                        "name": entry["name"],
                                        "dependencies": entry.get("dependencies").cloned().unwrap_or(json!([])),
                                        "spec": entry,
                                    })
                                })
                                .collect::<Vec<_>>();
                            Ok(json!({ "serviceConfigs": services }))
                        }
                    }),
                )
                .handler(
                    ModuleAction::Build,
                    handler(move |params: ActionParams| {
                        let log = build_log.clone();
                        async move {
                            let module = params.module.as_ref().expect("module missing");
                            log.lock().unwrap().push(format!("build.{}", module.name()));
                            if let Some(command) = command_of(&params.spec) {
                                let out = run_command(&command, module.path(), &params).await?;
                                return Ok(json!({ "buildLog": out }));
                            }
                            Ok(json!({}))
                        }
                    }),
                )
                .handler(
                    ModuleAction::TestModule,
                    handler(move |params: ActionParams| {
                        let log = test_log.clone();
                        async move {
                            let module = params.module.as_ref().expect("module missing");
                            let test_name = params.entity_name.clone().unwrap_or_default();
                            log.lock()
                                .unwrap()
                                .push(format!("test.{}.{}", module.name(), test_name));
                            let command = command_of(&params.spec)
                                .ok_or_else(|| anyhow::anyhow!("test has no command"))?;
                            let output = run_command(&command, module.path(), &params).await?;
                            Ok(json!({ "success": true, "log": output.trim() }))
                        }
                    }),
                )
                .handler(
                    ModuleAction::RunTask,
                    handler(move |params: ActionParams| {
                        let log = task_log.clone();
                        async move {
                            let module = params.module.as_ref().expect("module missing");
                            let task_name = params.entity_name.clone().unwrap_or_default();
                            log.lock().unwrap().push(format!("task.{}", task_name));
                            let command = command_of(&params.spec)
                                .ok_or_else(|| anyhow::anyhow!("task has no command"))?;
                            let output = run_command(&command, module.path(), &params).await?;
                            Ok(json!({
                                "success": true,
                                "log": output.trim(),
                                "outputs": { "log": output.trim() },
                            }))
                        }
                    }),
                )
                .handler(
                    ModuleAction::DeployService,
                    handler(move |params: ActionParams| {
                        let log = deploy_log.clone();
                        async move {
                            let service = params.entity_name.clone().unwrap_or_default();
                            log.lock().unwrap().push(format!("deploy.{}", service));
                            let outputs = params
                                .spec
                                .get("outputs")
                                .cloned()
                                .unwrap_or(json!({}));
                            Ok(json!({ "state": "ready", "outputs": outputs }))
                        }
                    }),
                ),
        )
}

fn command_of(spec: &Value) -> Option<Vec<String>> {
    spec.get("command")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .filter(|parts: &Vec<String>| !parts.is_empty())
}

async fn run_command(
    command: &[String],
    cwd: &Path,
    params: &ActionParams,
) -> anyhow::Result<String> {
    let mut process = ProcessCommand::new(command[0].as_str()).current_dir(cwd);
    for arg in &command[1..] {
        process = process.arg(arg);
    }
    if let Some(runtime) = &params.runtime_context {
        process = process.envs(
            runtime
                .env_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    let output = run_process(&process, None, &params.cancel).await?;
    if !output.success() {
        anyhow::bail!(
            "command '{}' exited with {:?}: {}",
            command.join(" "),
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(output.stdout)
}
