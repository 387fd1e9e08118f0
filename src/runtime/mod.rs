//! Runtime context assembly
//!
//! Before a handler runs against a service, task or test, the outputs of its
//! already-executed dependencies are collected into a [`RuntimeContext`]: a
//! set of environment variables for spawned processes plus the structured
//! `runtime.*` template layer handlers resolve against. The context is built
//! once per invocation and never mutated afterwards.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::graph::DependencyKind;

/// Outputs contributed by one completed dependency
#[derive(Debug, Clone)]
pub struct RuntimeDependency {
    pub kind: DependencyKind,
    pub name: String,
    pub outputs: Map<String, Value>,
    /// For service dependencies, the status reported by the deploy
    pub service_status: Option<Value>,
}

/// The environment handed to a handler invocation
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeContext {
    pub env_vars: BTreeMap<String, String>,
    /// Dependency names grouped by kind
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub service_statuses: BTreeMap<String, Value>,
    pub task_outputs: BTreeMap<String, Map<String, Value>>,
    pub service_outputs: BTreeMap<String, Map<String, Value>>,
}

impl RuntimeContext {
    /// The `runtime` template layer:
    /// `runtime.services.<name>.outputs.*` and `runtime.tasks.<name>.outputs.*`
    pub fn template_layer(&self) -> Value {
        let services: Map<String, Value> = self
            .service_outputs
            .iter()
            .map(|(name, outputs)| (name.clone(), json!({ "outputs": outputs })))
            .collect();
        let tasks: Map<String, Value> = self
            .task_outputs
            .iter()
            .map(|(name, outputs)| (name.clone(), json!({ "outputs": outputs })))
            .collect();
        json!({ "services": services, "tasks": tasks })
    }
}

/// Assemble a runtime context.
///
/// Environment variable precedence, lowest to highest: dependency outputs,
/// the module's `env`, the entity's own `env`.
pub fn build_runtime_context(
    module_env: &BTreeMap<String, String>,
    entity_env: &BTreeMap<String, String>,
    dependencies: &[RuntimeDependency],
) -> RuntimeContext {
    let mut context = RuntimeContext::default();

    for dep in dependencies {
        context
            .dependencies
            .entry(dep.kind.to_string())
            .or_default()
            .push(dep.name.clone());

        let prefix = match dep.kind {
            DependencyKind::Service => "SERVICE",
            DependencyKind::Task => "TASK",
            DependencyKind::Build => "MODULE",
            DependencyKind::Test => "TEST",
        };
        for (key, value) in &dep.outputs {
            context.env_vars.insert(
                env_var_name(&[prefix, &dep.name, "OUTPUT", key]),
                coerce_to_string(value),
            );
        }

        match dep.kind {
            DependencyKind::Service => {
                context
                    .service_outputs
                    .insert(dep.name.clone(), dep.outputs.clone());
                if let Some(status) = &dep.service_status {
                    context
                        .service_statuses
                        .insert(dep.name.clone(), status.clone());
                }
            }
            DependencyKind::Task => {
                context
                    .task_outputs
                    .insert(dep.name.clone(), dep.outputs.clone());
            }
            _ => {}
        }
    }

    for (key, value) in module_env {
        context.env_vars.insert(key.clone(), value.clone());
    }
    for (key, value) in entity_env {
        context.env_vars.insert(key.clone(), value.clone());
    }

    context
}

/// `GARDEN_` + parts, uppercased, with every non-alphanumeric squashed to `_`
fn env_var_name(parts: &[&str]) -> String {
    let mut name = String::from("GARDEN");
    for part in parts {
        name.push('_');
        for ch in part.chars() {
            if ch.is_ascii_alphanumeric() {
                name.push(ch.to_ascii_uppercase());
            } else {
                name.push('_');
            }
        }
    }
    name
}

/// Scalars render as their string form; structured values as compact JSON
fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(kind: DependencyKind, name: &str, outputs: Value) -> RuntimeDependency {
        RuntimeDependency {
            kind,
            name: name.to_string(),
            outputs: outputs.as_object().cloned().unwrap_or_default(),
            service_status: None,
        }
    }

    #[test]
    fn outputs_become_env_vars_with_string_coercion() {
        let ctx = build_runtime_context(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &[dep(
                DependencyKind::Service,
                "db-main",
                json!({"host": "10.0.0.1", "port": 5432}),
            )],
        );
        assert_eq!(
            ctx.env_vars.get("GARDEN_SERVICE_DB_MAIN_OUTPUT_HOST"),
            Some(&"10.0.0.1".to_string())
        );
        assert_eq!(
            ctx.env_vars.get("GARDEN_SERVICE_DB_MAIN_OUTPUT_PORT"),
            Some(&"5432".to_string())
        );
    }

    #[test]
    fn entity_env_overrides_module_env() {
        let module_env: BTreeMap<_, _> =
            [("LOG_LEVEL".to_string(), "info".to_string())].into();
        let entity_env: BTreeMap<_, _> =
            [("LOG_LEVEL".to_string(), "debug".to_string())].into();
        let ctx = build_runtime_context(&module_env, &entity_env, &[]);
        assert_eq!(ctx.env_vars.get("LOG_LEVEL"), Some(&"debug".to_string()));
    }

    #[test]
    fn template_layer_exposes_structured_outputs() {
        let ctx = build_runtime_context(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &[
                dep(DependencyKind::Service, "web", json!({"url": "http://web"})),
                dep(DependencyKind::Task, "migrate", json!({"rows": 42})),
            ],
        );
        let layer = ctx.template_layer();
        assert_eq!(layer["services"]["web"]["outputs"]["url"], json!("http://web"));
        assert_eq!(layer["tasks"]["migrate"]["outputs"]["rows"], json!(42));
    }

    #[test]
    fn dependencies_grouped_by_kind() {
        let ctx = build_runtime_context(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &[
                dep(DependencyKind::Service, "web", json!({})),
                dep(DependencyKind::Task, "seed", json!({})),
            ],
        );
        assert_eq!(ctx.dependencies["service"], vec!["web".to_string()]);
        assert_eq!(ctx.dependencies["task"], vec!["seed".to_string()]);
    }
}
