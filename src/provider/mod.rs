//! Provider resolution
//!
//! Every plugin listed under the project's `providers` becomes a provider
//! for the active environment. Providers form their own DAG: declared plugin
//! dependencies (matched against base chains) plus implicit edges from
//! `${providers.*}` template references. Resolution walks that DAG in
//! topological waves, each wave bounded by the configured concurrency, and
//! takes every provider through configure → status → prepare until ready.

use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::discovery::RawModule;
use crate::config::document::ProviderConfigDoc;
use crate::error::{GardenError, GardenResult};
use crate::plugin::{
    ActionRouter, EnvironmentStatus, PluginRegistry, ProviderAction,
};
use crate::process::CancelToken;
use crate::schema::validate_all;
use crate::template::{collect_references, resolve_config, TemplateContext, TemplatePass};

/// How many times the resolver re-checks environment status after
/// `prepareEnvironment` before giving up
const PREPARE_STATUS_ATTEMPTS: usize = 3;

/// A fully resolved provider. Never mutated after resolution.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub config: Value,
    pub dependencies: Vec<Arc<Provider>>,
    pub module_configs: Vec<RawModule>,
    pub status: EnvironmentStatus,
}

impl Provider {
    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies.iter().map(|d| d.name.clone()).collect()
    }
}

pub struct ProviderResolver<'a> {
    pub registry: &'a PluginRegistry,
    pub router: &'a ActionRouter,
    /// Project, environment and variables layers
    pub base_context: &'a TemplateContext,
    pub project_root: PathBuf,
    pub environment_name: String,
    pub force_init: bool,
    pub concurrency: usize,
    pub cancel: CancelToken,
}

impl ProviderResolver<'_> {
    pub async fn resolve(
        &self,
        configured: &[ProviderConfigDoc],
    ) -> GardenResult<BTreeMap<String, Arc<Provider>>> {
        // Environment restrictions drop providers before anything else sees them
        let active: Vec<&ProviderConfigDoc> = configured
            .iter()
            .filter(|doc| match &doc.environments {
                None => true,
                Some(envs) => envs.iter().any(|e| *e == self.environment_name),
            })
            .collect();

        for doc in &active {
            self.registry.get(&doc.name)?;
        }

        let edges = self.dependency_edges(&active)?;
        check_cycles(&edges)?;

        let mut resolved: BTreeMap<String, Arc<Provider>> = BTreeMap::new();
        let mut pending: BTreeSet<String> = active.iter().map(|d| d.name.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));

        while !pending.is_empty() {
            let wave: Vec<String> = pending
                .iter()
                .filter(|name| {
                    edges
                        .get(*name)
                        .map(|deps| deps.iter().all(|d| resolved.contains_key(d)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            if wave.is_empty() {
                return Err(GardenError::internal(
                    "provider resolution stalled with unresolved dependencies",
                ));
            }

            let futures = wave.iter().map(|name| {
                let doc = active.iter().find(|d| d.name == *name).unwrap();
                let dependency_names = edges.get(name).cloned().unwrap_or_default();
                let snapshot = resolved.clone();
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.map_err(|_| {
                        GardenError::internal("provider resolution semaphore closed")
                    })?;
                    self.resolve_one(doc, &dependency_names, &snapshot).await
                }
            });

            for provider in join_all(futures).await {
                let provider = provider?;
                pending.remove(&provider.name);
                resolved.insert(provider.name.clone(), Arc::new(provider));
            }
        }

        Ok(resolved)
    }

    /// Declared plugin dependencies (matched against configured providers'
    /// base chains) plus implicit `${providers.X...}` references.
    fn dependency_edges(
        &self,
        active: &[&ProviderConfigDoc],
    ) -> GardenResult<BTreeMap<String, Vec<String>>> {
        let configured_names: Vec<String> = active.iter().map(|d| d.name.clone()).collect();
        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for doc in active {
            let plugin = self.registry.get(&doc.name)?;
            let mut deps: Vec<String> = Vec::new();

            for declared in &plugin.dependencies {
                // A dependency on plugin X is satisfied by any configured
                // provider whose base chain contains X
                let matches: Vec<&String> = configured_names
                    .iter()
                    .filter(|candidate| {
                        self.registry
                            .get(candidate)
                            .map(|p| p.base_chain_contains(declared))
                            .unwrap_or(false)
                    })
                    .collect();
                if matches.is_empty() {
                    return Err(GardenError::config(format!(
                        "provider '{}' depends on plugin '{}', but no configured provider supplies it",
                        doc.name, declared
                    ))
                    .with_hint(format!("add '{}' (or a plugin based on it) to the project's providers", declared)));
                }
                for candidate in matches {
                    if *candidate != doc.name && !deps.contains(candidate) {
                        deps.push(candidate.clone());
                    }
                }
            }

            for path in collect_references(&Value::Object(doc.config.clone())) {
                if path.len() >= 2 && path[0] == "providers" {
                    let target = path[1].clone();
                    if target == doc.name {
                        continue;
                    }
                    if !configured_names.contains(&target) {
                        return Err(GardenError::config(format!(
                            "provider '{}' references '${{providers.{}...}}', but '{}' is not a configured provider",
                            doc.name, target, target
                        )));
                    }
                    if !deps.contains(&target) {
                        deps.push(target);
                    }
                }
            }

            edges.insert(doc.name.clone(), deps);
        }
        Ok(edges)
    }

    async fn resolve_one(
        &self,
        doc: &ProviderConfigDoc,
        dependency_names: &[String],
        resolved: &BTreeMap<String, Arc<Provider>>,
    ) -> GardenResult<Provider> {
        debug!(provider = %doc.name, "resolving provider");
        let plugin = self.registry.get(&doc.name)?;

        // Static pass against project variables and resolved provider outputs
        let mut context = self.base_context.clone();
        let mut providers_layer = Map::new();
        for (name, provider) in resolved {
            providers_layer.insert(
                name.clone(),
                json!({
                    "outputs": provider.status.outputs,
                    "config": provider.config,
                }),
            );
        }
        context.set_layer("providers", Value::Object(providers_layer));

        let mut raw = Map::new();
        raw.insert("name".to_string(), Value::String(doc.name.clone()));
        raw.extend(doc.config.clone());
        let resolution = resolve_config(&Value::Object(raw), &context, TemplatePass::Static)?;
        let mut config = validate_all(
            &resolution.value,
            &plugin.config_schemas,
            &format!("provider '{}'", doc.name),
        )?;

        let mut module_configs = Vec::new();
        if plugin.handler(ProviderAction::ConfigureProvider).is_some() {
            let output = self
                .router
                .call_provider(
                    &doc.name,
                    config.clone(),
                    ProviderAction::ConfigureProvider,
                    Value::Null,
                    self.cancel.clone(),
                )
                .await?;
            if let Some(updated) = output.get("config") {
                config = validate_all(
                    updated,
                    &plugin.config_schemas,
                    &format!("provider '{}' (after configureProvider)", doc.name),
                )?;
            }
            if let Some(Value::Array(configs)) = output.get("moduleConfigs") {
                for value in configs {
                    module_configs.push(RawModule {
                        value: value.clone(),
                        config_path: self.project_root.join("garden.yml"),
                        dir: self.project_root.clone(),
                    });
                }
            }
        }

        let status = self.ensure_ready(doc, plugin_has(plugin, ProviderAction::PrepareEnvironment), &config).await?;

        let dependencies = dependency_names
            .iter()
            .map(|name| {
                resolved.get(name).cloned().ok_or_else(|| {
                    GardenError::internal(format!(
                        "provider '{}' scheduled before its dependency '{}'",
                        doc.name, name
                    ))
                })
            })
            .collect::<GardenResult<Vec<_>>>()?;

        info!(provider = %doc.name, ready = status.ready, "provider resolved");
        Ok(Provider {
            name: doc.name.clone(),
            config,
            dependencies,
            module_configs,
            status,
        })
    }

    /// `getEnvironmentStatus`, then `prepareEnvironment` when not ready (or
    /// when the caller forces init), then a bounded re-check loop.
    async fn ensure_ready(
        &self,
        doc: &ProviderConfigDoc,
        has_prepare: bool,
        config: &Value,
    ) -> GardenResult<EnvironmentStatus> {
        let mut status = self.environment_status(doc, config).await?;
        if status.ready && !self.force_init {
            return Ok(status);
        }
        if !has_prepare {
            if status.ready {
                return Ok(status);
            }
            return Err(GardenError::NotReady {
                provider: doc.name.clone(),
                message: "environment is not ready and the plugin has no prepareEnvironment handler"
                    .to_string(),
            });
        }

        let output = self
            .router
            .call_provider(
                &doc.name,
                config.clone(),
                ProviderAction::PrepareEnvironment,
                json!({ "force": self.force_init, "status": status }),
                self.cancel.clone(),
            )
            .await?;
        if let Ok(prepared) = serde_json::from_value::<EnvironmentStatus>(output) {
            status = prepared;
        }

        let mut attempts = 0;
        while !status.ready && attempts < PREPARE_STATUS_ATTEMPTS {
            attempts += 1;
            status = self.environment_status(doc, config).await?;
        }
        if !status.ready {
            return Err(GardenError::NotReady {
                provider: doc.name.clone(),
                message: format!(
                    "environment still not ready after prepareEnvironment and {} status checks",
                    PREPARE_STATUS_ATTEMPTS
                ),
            });
        }
        Ok(status)
    }

    async fn environment_status(
        &self,
        doc: &ProviderConfigDoc,
        config: &Value,
    ) -> GardenResult<EnvironmentStatus> {
        let plugin = self.registry.get(&doc.name)?;
        if plugin.handler(ProviderAction::GetEnvironmentStatus).is_none() {
            return Ok(EnvironmentStatus {
                ready: true,
                outputs: Map::new(),
            });
        }
        let output = self
            .router
            .call_provider(
                &doc.name,
                config.clone(),
                ProviderAction::GetEnvironmentStatus,
                Value::Null,
                self.cancel.clone(),
            )
            .await?;
        serde_json::from_value(output).map_err(|e| {
            GardenError::plugin_named(
                doc.name.clone(),
                format!("getEnvironmentStatus returned an invalid result: {}", e),
            )
        })
    }
}

fn plugin_has(plugin: &crate::plugin::ResolvedPlugin, action: ProviderAction) -> bool {
    plugin.handler(action).is_some()
}

/// DFS cycle check over provider edges; the error names the full chain
fn check_cycles(edges: &BTreeMap<String, Vec<String>>) -> GardenResult<()> {
    let mut done: BTreeSet<&str> = BTreeSet::new();
    for start in edges.keys() {
        if done.contains(start.as_str()) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        path.push(start.as_str());

        while let Some((node, index)) = stack.last().cloned() {
            let next = edges.get(node).and_then(|deps| deps.get(index));
            match next {
                None => {
                    done.insert(node);
                    stack.pop();
                    path.pop();
                }
                Some(dep) => {
                    stack.last_mut().unwrap().1 += 1;
                    if let Some(at) = path.iter().position(|n| *n == dep.as_str()) {
                        let mut chain: Vec<String> =
                            path[at..].iter().map(|s| s.to_string()).collect();
                        chain.push(dep.clone());
                        return Err(GardenError::cycle("circular provider references", &chain));
                    }
                    if !done.contains(dep.as_str()) {
                        path.push(dep.as_str());
                        stack.push((dep.as_str(), 0));
                    }
                }
            }
        }
    }
    Ok(())
}
