//! The Garden aggregate
//!
//! One value owning everything a process needs to operate on a project:
//! config store, resolved plugins, providers, modules, the config graph and
//! the result cache. There are no process-wide singletons; tests instantiate
//! independent aggregates against temp directories.

use glob::Pattern;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::discovery::{discover_configs, RawModule};
use crate::config::module::{Module, ServiceConfig, TaskConfig, TestConfig};
use crate::config::resolver::ModuleResolver;
use crate::error::{GardenError, GardenResult};
use crate::graph::{ConfigGraph, DependencyKind};
use crate::plugin::{
    ActionContext, ActionRouter, ModuleAction, PluginRegistry, PluginSpec, ProviderAction,
    RunResult, ServiceStatus,
};
use crate::process::{CancelSignal, CancelToken};
use crate::provider::{Provider, ProviderResolver};
use crate::runtime::{build_runtime_context, RuntimeContext, RuntimeDependency};
use crate::staging::stage_build;
use crate::store::ConfigStore;
use crate::tasks::{
    node_key, DependencyResults, GraphResult, NodeKind, ResultCache, TaskGraph, TaskNode,
};
use crate::template::TemplateContext;
use crate::vcs::{VcsHandler, WorkspaceVcs};
use crate::version::{
    compute_entity_version, read_build_version, write_build_version, BUILD_VERSION_FILENAME,
};

pub const CACHE_DIR_NAME: &str = ".garden";

/// Options for opening a project
#[derive(Default)]
pub struct GardenOpts {
    /// `--env`; falls back to the project's default environment
    pub environment: Option<String>,
    /// The plugins registered for this process
    pub plugins: Vec<PluginSpec>,
    /// Run provider `prepareEnvironment` even when already ready
    pub force_init: bool,
    /// Concurrency cap for provider resolution and the task graph;
    /// defaults to twice the available cores
    pub concurrency: Option<usize>,
    /// Overrides `<root>/.garden`
    pub cache_dir: Option<PathBuf>,
    pub vcs: Option<Arc<dyn VcsHandler>>,
}

pub struct Garden {
    pub project_root: PathBuf,
    pub project_name: String,
    pub environment_name: String,
    cache_dir: PathBuf,
    registry: Arc<PluginRegistry>,
    router: ActionRouter,
    store: Mutex<ConfigStore>,
    providers: BTreeMap<String, Arc<Provider>>,
    graph: ConfigGraph,
    /// Project/environment/variables/providers/modules template layers
    base_context: TemplateContext,
    result_cache: Arc<Mutex<ResultCache>>,
    cancel: CancelSignal,
    concurrency: usize,
}

impl std::fmt::Debug for Garden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Garden")
            .field("project_root", &self.project_root)
            .field("project_name", &self.project_name)
            .field("environment_name", &self.environment_name)
            .finish_non_exhaustive()
    }
}

impl Garden {
    /// Load a project: discover configs, resolve plugins, providers and
    /// modules, and build the config graph. Any configuration, template,
    /// plugin or dependency error fails here, before any work begins.
    pub async fn open(project_root: impl Into<PathBuf>, opts: GardenOpts) -> GardenResult<Self> {
        let project_root = project_root.into();
        let cache_dir = opts
            .cache_dir
            .unwrap_or_else(|| project_root.join(CACHE_DIR_NAME));
        let vcs: Arc<dyn VcsHandler> = opts.vcs.unwrap_or_else(|| Arc::new(WorkspaceVcs));
        let concurrency = opts.concurrency.unwrap_or_else(default_concurrency);

        let discovered = discover_configs(&project_root).await?;
        let project = discovered.project;

        let environment_name = project
            .pick_environment(opts.environment.as_deref())
            .unwrap_or_else(|| "default".to_string());
        if !project.environments.is_empty() && project.environment(&environment_name).is_none() {
            return Err(GardenError::config(format!(
                "project '{}' has no environment named '{}'",
                project.name, environment_name
            ))
            .with_hint(format!(
                "configured environments: {}",
                project
                    .environments
                    .iter()
                    .map(|e| e.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        // Environment variables overlay project variables
        let mut variables = project.variables.clone();
        if let Some(environment) = project.environment(&environment_name) {
            for (key, value) in &environment.variables {
                variables.insert(key.clone(), value.clone());
            }
        }

        let registry = Arc::new(PluginRegistry::resolve(opts.plugins)?);
        let ctx = ActionContext {
            project_name: project.name.clone(),
            environment_name: environment_name.clone(),
            project_root: project_root.clone(),
            cache_dir: cache_dir.clone(),
        };
        let router = ActionRouter::new(registry.clone(), ctx);
        let store = ConfigStore::load(cache_dir.join(crate::store::CONFIG_STORE_FILENAME))?;
        let cancel = CancelSignal::new();

        let mut base_context = TemplateContext::new();
        base_context.set_layer("project", json!({ "name": project.name }));
        base_context.set_layer("environment", json!({ "name": environment_name }));
        base_context.set_layer("variables", Value::Object(variables.clone()));

        info!(
            project = %project.name,
            environment = %environment_name,
            "resolving providers"
        );
        let resolver = ProviderResolver {
            registry: &registry,
            router: &router,
            base_context: &base_context,
            project_root: project_root.clone(),
            environment_name: environment_name.clone(),
            force_init: opts.force_init,
            concurrency,
            cancel: cancel.token(),
        };
        let providers = resolver.resolve(&project.providers).await?;

        let mut providers_layer = Map::new();
        for (name, provider) in &providers {
            providers_layer.insert(
                name.clone(),
                json!({ "outputs": provider.status.outputs, "config": provider.config }),
            );
        }
        base_context.set_layer("providers", Value::Object(providers_layer));

        // Providers may contribute module configs of their own
        let mut raw_modules: Vec<RawModule> = discovered.modules;
        for provider in providers.values() {
            raw_modules.extend(provider.module_configs.iter().cloned());
        }

        let module_resolver = ModuleResolver {
            router: &router,
            registry: &registry,
            vcs: vcs.as_ref(),
            store: &store,
            base_context: &base_context,
            ignore_patterns: &discovered.ignore_patterns,
            sources_dir: cache_dir.join("sources"),
        };
        let modules = module_resolver.resolve(raw_modules).await?;

        let mut modules_layer = Map::new();
        for module in &modules {
            modules_layer.insert(
                module.name().to_string(),
                json!({
                    "version": module.version.version_string,
                    "path": module.path().display().to_string(),
                    "outputs": module.config.outputs,
                }),
            );
        }
        base_context.set_layer("modules", Value::Object(modules_layer));

        let graph = ConfigGraph::build(modules)?;

        Ok(Self {
            project_root,
            project_name: project.name,
            environment_name,
            cache_dir,
            registry,
            router,
            store: Mutex::new(store),
            providers,
            graph,
            base_context,
            result_cache: Arc::new(Mutex::new(ResultCache::new())),
            cancel,
            concurrency,
        })
    }

    pub fn graph(&self) -> &ConfigGraph {
        &self.graph
    }

    pub fn providers(&self) -> &BTreeMap<String, Arc<Provider>> {
        &self.providers
    }

    /// A token handlers can poll for cooperative shutdown
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.token()
    }

    /// Raise the process-wide cancellation flag
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Evict a module's results from the result cache (file watcher or
    /// explicit invalidation after config changes)
    pub fn invalidate_module(&self, name: &str) {
        self.result_cache.lock().unwrap().invalidate(name);
    }

    fn task_graph(&self) -> TaskGraph {
        TaskGraph::new(
            self.concurrency,
            self.result_cache.clone(),
            self.cancel.token(),
        )
    }

    // ------------------------------------------------------------------
    // Command surface
    // ------------------------------------------------------------------

    /// Build the named modules (all when `None`), including their build
    /// dependencies.
    pub async fn build(&self, names: Option<&[String]>, force: bool) -> GardenResult<GraphResult> {
        let selected = self.select_modules(names)?;
        let mut nodes = Vec::new();
        for module in &selected {
            self.add_build_nodes(module, force, &mut nodes)?;
        }
        self.task_graph().process(nodes).await
    }

    /// Deploy the named services (all when `None`)
    pub async fn deploy(
        &self,
        names: Option<&[String]>,
        force: bool,
        force_build: bool,
    ) -> GardenResult<GraphResult> {
        let services = self.select_services(names)?;
        let mut nodes = Vec::new();
        for (module, service) in &services {
            self.add_deploy_nodes(module, service, force, force_build, &mut nodes)?;
        }
        self.task_graph().process(nodes).await
    }

    /// Run tests, optionally filtered by module names and a test-name glob
    pub async fn test(
        &self,
        module_names: Option<&[String]>,
        name_filter: Option<&str>,
        force: bool,
        force_build: bool,
    ) -> GardenResult<GraphResult> {
        let pattern = match name_filter {
            Some(filter) => Some(Pattern::new(filter).map_err(|e| {
                GardenError::config(format!("invalid test name filter '{}': {}", filter, e))
            })?),
            None => None,
        };

        let selected = self.select_modules(module_names)?;
        let mut nodes = Vec::new();
        for module in &selected {
            for test in &module.config.test_configs {
                if let Some(pattern) = &pattern {
                    if !pattern.matches(&test.name) {
                        continue;
                    }
                }
                self.add_test_nodes(module, test, force, force_build, &mut nodes)?;
            }
        }
        self.task_graph().process(nodes).await
    }

    /// Run a single task
    pub async fn run_task(&self, name: &str, force: bool) -> GardenResult<GraphResult> {
        let module = self.graph.task_owner(name)?;
        let task = module
            .task(name)
            .ok_or_else(|| GardenError::internal(format!("task '{}' missing from owner", name)))?
            .clone();
        let mut nodes = Vec::new();
        self.add_task_nodes(&module, &task, force, false, &mut nodes)?;
        self.task_graph().process(nodes).await
    }

    /// Build a module, then invoke its `runModule` handler with a command
    pub async fn run_module(
        &self,
        name: &str,
        command: Vec<String>,
        force_build: bool,
    ) -> GardenResult<GraphResult> {
        let module = self.graph.module(name)?;
        let mut nodes = Vec::new();
        self.add_build_nodes(&module, force_build, &mut nodes)?;

        let node = self.entity_node(
            NodeKind::Task,
            &format!("{}.run", module.name()),
            &module,
            "module",
            module.name(),
            module.config.spec.clone(),
            vec![node_key(NodeKind::Build, module.name())],
            vec![],
            compute_entity_version(&module.version, "run", &[]),
            true,
            None,
            ModuleAction::RunModule,
            json!({ "command": command }),
        );
        nodes.push(node);
        self.task_graph().process(nodes).await
    }

    /// Build and publish the named modules (all publishable when `None`)
    pub async fn publish(
        &self,
        names: Option<&[String]>,
        force_build: bool,
    ) -> GardenResult<GraphResult> {
        let selected = self.select_modules(names)?;
        let mut nodes = Vec::new();
        for module in &selected {
            if !module.config.allow_publish {
                debug!(module = module.name(), "skipping: allowPublish is false");
                continue;
            }
            self.add_build_nodes(module, force_build, &mut nodes)?;
            let module_arc = module.clone();
            let router = self.router_handle();
            let base_context = self.base_context.clone();
            let cancel = self.cancel.token();
            let spec = module.config.spec.clone();
            let name = module.name().to_string();
            nodes.push(TaskNode {
                kind: NodeKind::Publish,
                name: name.clone(),
                version: module.version.version_string.clone(),
                dependencies: vec![node_key(NodeKind::Build, &name)],
                force: true,
                timeout: None,
                process: Arc::new(move |_, _| {
                    let router = router.clone();
                    let module = module_arc.clone();
                    let base_context = base_context.clone();
                    let cancel = cancel.clone();
                    let spec = spec.clone();
                    let name = name.clone();
                    Box::pin(async move {
                        let out = router
                            .call_module_action(
                                module,
                                ModuleAction::Publish,
                                "module",
                                &name,
                                &spec,
                                &base_context,
                                None,
                                Value::Null,
                                cancel,
                            )
                            .await?;
                        Ok(out)
                    })
                }),
            });
        }
        self.task_graph().process(nodes).await
    }

    /// Delete deployed services, dependents first
    pub async fn delete_services(&self, names: Option<&[String]>) -> GardenResult<GraphResult> {
        let services = self.select_services(names)?;
        let mut nodes = Vec::new();
        for (module, service) in &services {
            // Reverse edges: deleting X waits for everything that depends on X
            let dependents: Vec<String> = services
                .iter()
                .filter(|(_, other)| other.dependencies.contains(&service.name))
                .map(|(_, other)| node_key(NodeKind::Delete, &other.name))
                .collect();

            let node = self.entity_node(
                NodeKind::Delete,
                &service.name,
                module,
                "service",
                &service.name,
                service.spec.clone(),
                dependents,
                vec![],
                compute_entity_version(&module.version, &service.name, &[]),
                true,
                None,
                ModuleAction::DeleteService,
                Value::Null,
            );
            nodes.push(node);
        }
        self.task_graph().process(nodes).await
    }

    /// Provider statuses, for `garden get status`
    pub fn environment_status(&self) -> Value {
        let providers: Map<String, Value> = self
            .providers
            .iter()
            .map(|(name, provider)| {
                (
                    name.clone(),
                    json!({
                        "ready": provider.status.ready,
                        "outputs": provider.status.outputs,
                        "dependencies": provider.dependency_names(),
                    }),
                )
            })
            .collect();
        json!({
            "project": self.project_name,
            "environment": self.environment_name,
            "providers": providers,
        })
    }

    /// Tear down provider environments, in reverse dependency order.
    /// Providers without a `cleanupEnvironment` handler are skipped.
    pub async fn cleanup_environment(&self) -> GardenResult<()> {
        // Reverse topological order: a provider is cleaned only once nothing
        // still configured depends on it
        let mut remaining: BTreeMap<String, Arc<Provider>> = self.providers.clone();
        let mut order: Vec<Arc<Provider>> = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .keys()
                .filter(|name| {
                    !remaining
                        .values()
                        .any(|p| p.dependency_names().contains(*name))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(GardenError::internal(
                    "provider cleanup ordering stalled on a dependency loop",
                ));
            }
            for name in ready {
                order.push(remaining.remove(&name).unwrap());
            }
        }

        for provider in order {
            let plugin = self.registry.get(&provider.name)?;
            if plugin.handler(ProviderAction::CleanupEnvironment).is_none() {
                continue;
            }
            self.router
                .call_provider(
                    &provider.name,
                    provider.config.clone(),
                    ProviderAction::CleanupEnvironment,
                    Value::Null,
                    self.cancel.token(),
                )
                .await?;
            info!(provider = %provider.name, "environment cleaned up");
        }
        Ok(())
    }

    /// Fetch a secret through the provider, consulting the local cache first
    pub async fn get_secret(&self, provider_name: &str, key: &str) -> GardenResult<Value> {
        if let Some(cached) = self
            .store
            .lock()
            .unwrap()
            .cached_secret(provider_name, key)
            .cloned()
        {
            return Ok(cached);
        }
        let provider = self.provider(provider_name)?;
        let out = self
            .router
            .call_provider(
                provider_name,
                provider.config.clone(),
                ProviderAction::GetSecret,
                json!({ "key": key }),
                self.cancel.token(),
            )
            .await?;
        let value = out.get("value").cloned().unwrap_or(Value::Null);
        if !value.is_null() {
            self.store
                .lock()
                .unwrap()
                .cache_secret(provider_name, key, value.clone())?;
        }
        Ok(value)
    }

    pub async fn set_secret(&self, provider_name: &str, key: &str, value: &str) -> GardenResult<()> {
        let provider = self.provider(provider_name)?;
        self.router
            .call_provider(
                provider_name,
                provider.config.clone(),
                ProviderAction::SetSecret,
                json!({ "key": key, "value": value }),
                self.cancel.token(),
            )
            .await?;
        self.store
            .lock()
            .unwrap()
            .cache_secret(provider_name, key, json!(value))?;
        Ok(())
    }

    /// Invoke a plugin-declared command (`garden plugins <plugin> <command>`)
    pub async fn run_provider_command(
        &self,
        provider_name: &str,
        command: &str,
    ) -> GardenResult<Value> {
        let provider = self.provider(provider_name)?;
        let plugin = self.registry.get(provider_name)?;
        let slot = plugin.commands.get(command).ok_or_else(|| {
            GardenError::plugin_named(
                provider_name.to_string(),
                format!("plugin '{}' has no command '{}'", provider_name, command),
            )
            .with_hint(format!(
                "available commands: {}",
                plugin
                    .commands
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        let mut params = crate::plugin::ActionParams::new(self.router.context().clone());
        params.provider_name = Some(provider_name.to_string());
        params.provider_config = Some(provider.config.clone());
        params.cancel = self.cancel.token();
        slot.handler
            .call(params)
            .await
            .map_err(GardenError::from)
    }

    fn provider(&self, name: &str) -> GardenResult<Arc<Provider>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            GardenError::config(format!(
                "provider '{}' is not configured for environment '{}'",
                name, self.environment_name
            ))
        })
    }

    // ------------------------------------------------------------------
    // Node factories
    // ------------------------------------------------------------------

    fn select_modules(&self, names: Option<&[String]>) -> GardenResult<Vec<Arc<Module>>> {
        match names {
            None => Ok(self.graph.modules().cloned().collect()),
            Some(names) => names.iter().map(|n| self.graph.module(n)).collect(),
        }
    }

    fn select_services(
        &self,
        names: Option<&[String]>,
    ) -> GardenResult<Vec<(Arc<Module>, ServiceConfig)>> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.graph.service_names(),
        };
        names
            .iter()
            .map(|name| {
                let module = self.graph.service_owner(name)?;
                let service = module
                    .service(name)
                    .ok_or_else(|| {
                        GardenError::internal(format!("service '{}' missing from owner", name))
                    })?
                    .clone();
                Ok((module, service))
            })
            .collect()
    }

    /// Build node for a module plus, recursively, its build dependencies
    fn add_build_nodes(
        &self,
        module: &Arc<Module>,
        force: bool,
        nodes: &mut Vec<TaskNode>,
    ) -> GardenResult<()> {
        let key = node_key(NodeKind::Build, module.name());
        if nodes.iter().any(|n| n.key() == key) {
            return Ok(());
        }

        let mut dependencies = Vec::new();
        let mut dependency_modules = Vec::new();
        for dep_name in module.build_dependency_names() {
            let dep = self.graph.module(&dep_name)?;
            self.add_build_nodes(&dep, force, nodes)?;
            dependencies.push(node_key(NodeKind::Build, &dep_name));
            dependency_modules.push(dep);
        }

        let router = self.router_handle();
        let base_context = self.base_context.clone();
        let module_arc = module.clone();
        let cache_dir = self.cache_dir.clone();
        nodes.push(TaskNode {
            kind: NodeKind::Build,
            name: module.name().to_string(),
            version: module.version.version_string.clone(),
            dependencies,
            force,
            timeout: None,
            process: Arc::new(move |_, cancel| {
                let router = router.clone();
                let base_context = base_context.clone();
                let module = module_arc.clone();
                let cache_dir = cache_dir.clone();
                let dependency_modules = dependency_modules.clone();
                Box::pin(async move {
                    build_module(router, base_context, module, cache_dir, dependency_modules, force, cancel)
                        .await
                })
            }),
        });
        Ok(())
    }

    /// Deploy node for a service, plus builds and runtime dependencies
    fn add_deploy_nodes(
        &self,
        module: &Arc<Module>,
        service: &ServiceConfig,
        force: bool,
        force_build: bool,
        nodes: &mut Vec<TaskNode>,
    ) -> GardenResult<()> {
        let key = node_key(NodeKind::Deploy, &service.name);
        if nodes.iter().any(|n| n.key() == key) {
            return Ok(());
        }

        self.add_build_nodes(module, force_build, nodes)?;
        let mut dependencies = vec![node_key(NodeKind::Build, module.name())];
        dependencies.extend(self.add_runtime_dep_nodes(
            &service.dependencies,
            force,
            force_build,
            nodes,
        )?);
        dependencies.push(self.add_provider_node(&module.config.type_name, nodes)?);

        let node = self.entity_node(
            NodeKind::Deploy,
            &service.name,
            module,
            "service",
            &service.name,
            service.spec.clone(),
            dependencies,
            service.dependencies.clone(),
            compute_entity_version(&module.version, &service.name, &service.dependencies),
            force,
            None,
            ModuleAction::DeployService,
            json!({ "force": force }),
        );
        nodes.push(node);
        Ok(())
    }

    fn add_task_nodes(
        &self,
        module: &Arc<Module>,
        task: &TaskConfig,
        force: bool,
        force_build: bool,
        nodes: &mut Vec<TaskNode>,
    ) -> GardenResult<()> {
        let key = node_key(NodeKind::Task, &task.name);
        if nodes.iter().any(|n| n.key() == key) {
            return Ok(());
        }

        self.add_build_nodes(module, force_build, nodes)?;
        let mut dependencies = vec![node_key(NodeKind::Build, module.name())];
        dependencies.extend(self.add_runtime_dep_nodes(
            &task.dependencies,
            force,
            force_build,
            nodes,
        )?);
        dependencies.push(self.add_provider_node(&module.config.type_name, nodes)?);

        let node = self.entity_node(
            NodeKind::Task,
            &task.name,
            module,
            "task",
            &task.name,
            task.spec.clone(),
            dependencies,
            task.dependencies.clone(),
            compute_entity_version(&module.version, &task.name, &task.dependencies),
            force,
            task.timeout.map(Duration::from_secs),
            ModuleAction::RunTask,
            Value::Null,
        );
        nodes.push(node);
        Ok(())
    }

    fn add_test_nodes(
        &self,
        module: &Arc<Module>,
        test: &TestConfig,
        force: bool,
        force_build: bool,
        nodes: &mut Vec<TaskNode>,
    ) -> GardenResult<()> {
        let node_name = format!("{}.{}", module.name(), test.name);
        let key = node_key(NodeKind::Test, &node_name);
        if nodes.iter().any(|n| n.key() == key) {
            return Ok(());
        }

        self.add_build_nodes(module, force_build, nodes)?;
        let mut dependencies = vec![node_key(NodeKind::Build, module.name())];
        dependencies.extend(self.add_runtime_dep_nodes(
            &test.dependencies,
            force,
            force_build,
            nodes,
        )?);
        dependencies.push(self.add_provider_node(&module.config.type_name, nodes)?);

        let version = compute_entity_version(&module.version, &test.name, &test.dependencies);
        let mut node = self.entity_node(
            NodeKind::Test,
            &node_name,
            module,
            "test",
            &test.name,
            test.spec.clone(),
            dependencies,
            test.dependencies.clone(),
            version.clone(),
            force,
            test.timeout.map(Duration::from_secs),
            ModuleAction::TestModule,
            Value::Null,
        );

        // A plugin may cache test results by version (getTestResult); consult
        // it before running. Failures there are recoverable.
        if !force {
            let inner = node.process.clone();
            let router = self.router_handle();
            let base_context = self.base_context.clone();
            let module_arc = module.clone();
            let test_name = test.name.clone();
            node.process = Arc::new(move |deps, cancel: CancelToken| {
                let inner = inner.clone();
                let router = router.clone();
                let base_context = base_context.clone();
                let module = module_arc.clone();
                let test_name = test_name.clone();
                let version = version.clone();
                Box::pin(async move {
                    if router
                        .module_handler(
                            &module.config.type_name,
                            ModuleAction::GetTestResult,
                            None,
                        )
                        .is_ok()
                    {
                        let cached = router
                            .call_module_action(
                                module.clone(),
                                ModuleAction::GetTestResult,
                                "test",
                                &test_name,
                                &Value::Null,
                                &base_context,
                                None,
                                json!({ "version": version }),
                                cancel.clone(),
                            )
                            .await;
                        match cached {
                            Ok(result)
                                if result.get("success").and_then(Value::as_bool)
                                    == Some(true) =>
                            {
                                debug!(test = %test_name, "using cached test result");
                                return Ok(result);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!(test = %test_name, error = %e, "getTestResult failed; running the test");
                            }
                        }
                    }
                    inner(deps, cancel).await
                })
            });
        }
        nodes.push(node);
        Ok(())
    }

    /// Nodes for a service/task/test's runtime dependencies; returns their keys
    fn add_runtime_dep_nodes(
        &self,
        dependency_names: &[String],
        force: bool,
        force_build: bool,
        nodes: &mut Vec<TaskNode>,
    ) -> GardenResult<Vec<String>> {
        let mut keys = Vec::new();
        for name in dependency_names {
            match self.graph.service_owner(name) {
                Ok(owner) => {
                    let service = owner
                        .service(name)
                        .ok_or_else(|| {
                            GardenError::internal(format!("service '{}' missing from owner", name))
                        })?
                        .clone();
                    self.add_deploy_nodes(&owner, &service, force, force_build, nodes)?;
                    keys.push(node_key(NodeKind::Deploy, name));
                }
                Err(_) => {
                    let owner = self.graph.task_owner(name)?;
                    let task = owner
                        .task(name)
                        .ok_or_else(|| {
                            GardenError::internal(format!("task '{}' missing from owner", name))
                        })?
                        .clone();
                    self.add_task_nodes(&owner, &task, force, force_build, nodes)?;
                    keys.push(node_key(NodeKind::Task, name));
                }
            }
        }
        Ok(keys)
    }

    /// A resolve-provider barrier node for the plugin creating a module type.
    /// Providers are fully resolved at load; the node simply republishes the
    /// provider's status so actions order after provider init in the graph.
    fn add_provider_node(
        &self,
        module_type: &str,
        nodes: &mut Vec<TaskNode>,
    ) -> GardenResult<String> {
        let (creator, _) = self.registry.module_type(module_type)?;

        // The creating plugin may be configured directly or through a
        // descendant; fall back to the plugin name itself when unconfigured
        let provider = self
            .providers
            .values()
            .find(|p| {
                self.registry
                    .get(&p.name)
                    .map(|plugin| plugin.base_chain_contains(&creator.name))
                    .unwrap_or(false)
            })
            .cloned();

        let name = provider
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| creator.name.clone());
        let key = node_key(NodeKind::ResolveProvider, &name);
        if nodes.iter().any(|n| n.key() == key) {
            return Ok(key);
        }

        let status = provider
            .as_ref()
            .map(|p| serde_json::to_value(&p.status).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        let version = content_version(&status);
        nodes.push(TaskNode {
            kind: NodeKind::ResolveProvider,
            name,
            version,
            dependencies: vec![],
            force: false,
            timeout: None,
            process: Arc::new(move |_, _| {
                let status = status.clone();
                Box::pin(async move { Ok(status) })
            }),
        });
        Ok(key)
    }

    /// Generic node whose process routes a module action with runtime context
    #[allow(clippy::too_many_arguments)]
    fn entity_node(
        &self,
        kind: NodeKind,
        node_name: &str,
        module: &Arc<Module>,
        entity_kind: &'static str,
        entity_name: &str,
        spec: Value,
        dependencies: Vec<String>,
        runtime_dep_names: Vec<String>,
        version: String,
        force: bool,
        timeout: Option<Duration>,
        action: ModuleAction,
        args: Value,
    ) -> TaskNode {
        let router = self.router_handle();
        let base_context = self.base_context.clone();
        let module_arc = module.clone();
        let entity_name = entity_name.to_string();
        let entity_env = match entity_kind {
            "service" => module.service(&entity_name).map(|s| s.env.clone()),
            "task" => module.task(&entity_name).map(|t| t.env.clone()),
            "test" => module.test(&entity_name).map(|t| t.env.clone()),
            _ => None,
        }
        .unwrap_or_default();

        TaskNode {
            kind,
            name: node_name.to_string(),
            version,
            dependencies,
            force,
            timeout,
            process: Arc::new(move |deps: DependencyResults, cancel: CancelToken| {
                let router = router.clone();
                let base_context = base_context.clone();
                let module = module_arc.clone();
                let entity_name = entity_name.clone();
                let entity_env = entity_env.clone();
                let runtime_dep_names = runtime_dep_names.clone();
                let spec = spec.clone();
                let args = args.clone();
                Box::pin(async move {
                    let runtime = runtime_context_from(
                        &module.config.env,
                        &entity_env,
                        &runtime_dep_names,
                        &deps,
                    );
                    let out = router
                        .call_module_action(
                            module,
                            action,
                            entity_kind,
                            &entity_name,
                            &spec,
                            &base_context,
                            Some(runtime),
                            args,
                            cancel,
                        )
                        .await?;
                    Ok(out)
                })
            }),
        }
    }

    fn router_handle(&self) -> Arc<ActionRouter> {
        Arc::new(ActionRouter::new(
            self.registry.clone(),
            self.router.context().clone(),
        ))
    }

}

/// Twice the cores, the usual sweet spot for I/O-heavy handler work
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

/// Stable short version for non-module nodes, derived from content
fn content_version(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    format!("v-{}", &hex[..10])
}

/// Whether a module is already built. A plugin-defined `getBuildStatus`
/// handler takes precedence; its failures are recoverable and read as "not
/// built". The default is the recorded build-version file (a stale or
/// unparsable file also reads as "not built").
async fn build_status(
    router: &ActionRouter,
    base_context: &TemplateContext,
    module: &Arc<Module>,
    version_file: &std::path::Path,
    cancel: &CancelToken,
) -> bool {
    if router
        .module_handler(&module.config.type_name, ModuleAction::GetBuildStatus, None)
        .is_ok()
    {
        let outcome = router
            .call_module_action(
                module.clone(),
                ModuleAction::GetBuildStatus,
                "module",
                module.name(),
                &module.config.spec,
                base_context,
                None,
                json!({ "version": module.version.version_string }),
                cancel.clone(),
            )
            .await;
        return match outcome {
            Ok(value) => serde_json::from_value::<crate::plugin::BuildStatus>(value)
                .map(|status| status.ready)
                .unwrap_or(false),
            Err(e) => {
                debug!(module = module.name(), error = %e, "getBuildStatus failed; treating as not built");
                false
            }
        };
    }

    match read_build_version(version_file).await {
        Ok(recorded) => recorded.map(|r| r == module.version).unwrap_or(false),
        Err(e) => {
            debug!(module = module.name(), error = %e, "could not read build-version file");
            false
        }
    }
}

/// Assemble the runtime context for an entity from its dependency results
fn runtime_context_from(
    module_env: &BTreeMap<String, String>,
    entity_env: &BTreeMap<String, String>,
    runtime_dep_names: &[String],
    deps: &DependencyResults,
) -> RuntimeContext {
    let mut runtime_deps = Vec::new();
    for name in runtime_dep_names {
        if let Some(result) = deps.get(&node_key(NodeKind::Deploy, name)) {
            let status: ServiceStatus = result
                .output
                .clone()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            runtime_deps.push(RuntimeDependency {
                kind: DependencyKind::Service,
                name: name.clone(),
                outputs: status.outputs.clone(),
                service_status: result.output.clone(),
            });
        } else if let Some(result) = deps.get(&node_key(NodeKind::Task, name)) {
            let run: RunResult = result
                .output
                .clone()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            runtime_deps.push(RuntimeDependency {
                kind: DependencyKind::Task,
                name: name.clone(),
                outputs: run.outputs.clone(),
                service_status: None,
            });
        }
    }
    build_runtime_context(module_env, entity_env, &runtime_deps)
}

/// The build node process: consult the on-disk build-version file, skip the
/// handler when already built, otherwise stage sources, run `build` and
/// record the version.
async fn build_module(
    router: Arc<ActionRouter>,
    base_context: TemplateContext,
    module: Arc<Module>,
    cache_dir: PathBuf,
    dependency_modules: Vec<Arc<Module>>,
    force: bool,
    cancel: CancelToken,
) -> anyhow::Result<Value> {
    let version_file = cache_dir
        .join("build-metadata")
        .join(module.name())
        .join(BUILD_VERSION_FILENAME);
    let built = !force
        && build_status(&router, &base_context, &module, &version_file, &cancel).await;
    if built {
        debug!(module = module.name(), "build is up to date");
        return Ok(json!({ "fresh": false }));
    }

    let build_path = stage_build(&cache_dir, &module, &dependency_modules).await?;

    let name = module.name().to_string();
    let spec = module.config.spec.clone();
    let version = module.version.clone();
    let mut out = router
        .call_module_action(
            module,
            ModuleAction::Build,
            "module",
            &name,
            &spec,
            &base_context,
            None,
            json!({ "buildPath": build_path.display().to_string() }),
            cancel,
        )
        .await?;

    write_build_version(&version_file, &version).await?;
    if let Some(map) = out.as_object_mut() {
        map.insert("fresh".to_string(), json!(true));
    } else {
        out = json!({ "fresh": true, "result": out });
    }
    Ok(out)
}
