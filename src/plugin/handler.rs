//! Handler types and the action vocabulary
//!
//! Handlers are plain async function values stored in maps keyed by action
//! name. Params and results cross the plugin boundary as JSON values with
//! typed views for the results the core itself consumes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::process::CancelToken;
use crate::runtime::RuntimeContext;

/// Provider-level actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderAction {
    ConfigureProvider,
    GetEnvironmentStatus,
    PrepareEnvironment,
    CleanupEnvironment,
    GetSecret,
    SetSecret,
    DeleteSecret,
    GetDebugInfo,
}

impl fmt::Display for ProviderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConfigureProvider => "configureProvider",
            Self::GetEnvironmentStatus => "getEnvironmentStatus",
            Self::PrepareEnvironment => "prepareEnvironment",
            Self::CleanupEnvironment => "cleanupEnvironment",
            Self::GetSecret => "getSecret",
            Self::SetSecret => "setSecret",
            Self::DeleteSecret => "deleteSecret",
            Self::GetDebugInfo => "getDebugInfo",
        };
        f.write_str(name)
    }
}

/// Module-level actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModuleAction {
    DescribeType,
    Configure,
    GetBuildStatus,
    Build,
    Publish,
    RunModule,
    TestModule,
    GetTestResult,
    GetServiceStatus,
    DeployService,
    DeleteService,
    ExecInService,
    GetServiceLogs,
    HotReloadService,
    RunService,
    GetPortForward,
    StopPortForward,
    RunTask,
    GetTaskResult,
}

impl fmt::Display for ModuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DescribeType => "describeType",
            Self::Configure => "configure",
            Self::GetBuildStatus => "getBuildStatus",
            Self::Build => "build",
            Self::Publish => "publish",
            Self::RunModule => "runModule",
            Self::TestModule => "testModule",
            Self::GetTestResult => "getTestResult",
            Self::GetServiceStatus => "getServiceStatus",
            Self::DeployService => "deployService",
            Self::DeleteService => "deleteService",
            Self::ExecInService => "execInService",
            Self::GetServiceLogs => "getServiceLogs",
            Self::HotReloadService => "hotReloadService",
            Self::RunService => "runService",
            Self::GetPortForward => "getPortForward",
            Self::StopPortForward => "stopPortForward",
            Self::RunTask => "runTask",
            Self::GetTaskResult => "getTaskResult",
        };
        f.write_str(name)
    }
}

/// Project-level facts every handler receives
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub project_name: String,
    pub environment_name: String,
    pub project_root: std::path::PathBuf,
    pub cache_dir: std::path::PathBuf,
}

/// Parameters for one handler invocation.
///
/// Fields are populated per action kind: provider actions carry the provider
/// name and config; module actions carry the module snapshot and, for
/// service/task/test actions, the entity name and its runtime-resolved spec.
#[derive(Clone)]
pub struct ActionParams {
    pub ctx: ActionContext,
    pub provider_name: Option<String>,
    pub provider_config: Option<Value>,
    pub module: Option<Arc<crate::config::module::Module>>,
    pub entity_name: Option<String>,
    /// The spec the handler operates on, after the runtime template pass
    pub spec: Value,
    pub runtime_context: Option<RuntimeContext>,
    /// Action-specific extras (e.g. secret key, command args, force flags)
    pub args: Value,
    /// The handler this one overrode, if any; invoke to delegate
    pub base: Option<Arc<ResolvedHandler>>,
    pub cancel: CancelToken,
}

impl ActionParams {
    pub fn new(ctx: ActionContext) -> Self {
        Self {
            ctx,
            provider_name: None,
            provider_config: None,
            module: None,
            entity_name: None,
            spec: Value::Null,
            runtime_context: None,
            args: Value::Null,
            base: None,
            cancel: CancelToken::never(),
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(ActionParams) -> HandlerFuture + Send + Sync>;

/// A handler slot after base-chain flattening. `base` points at the slot this
/// one overrode, forming a walk back to the root base plugin.
pub struct ResolvedHandler {
    pub plugin_name: String,
    pub func: HandlerFn,
    pub base: Option<Arc<ResolvedHandler>>,
}

impl ResolvedHandler {
    /// Invoke with the `base` link injected into params
    pub fn call(&self, mut params: ActionParams) -> HandlerFuture {
        params.base = self.base.clone();
        (self.func)(params)
    }

    /// Length of the super chain including this slot
    pub fn chain_len(&self) -> usize {
        1 + self.base.as_ref().map(|b| b.chain_len()).unwrap_or(0)
    }
}

impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("plugin_name", &self.plugin_name)
            .field("chain_len", &self.chain_len())
            .finish()
    }
}

/// Convenience for building a [`HandlerFn`] from an async closure
pub fn handler<F, Fut>(func: F) -> HandlerFn
where
    F: Fn(ActionParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(func(params)))
}

// Typed result views. Handlers return plain JSON; the core deserializes the
// results it needs to act on.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    pub ready: bool,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildStatus {
    pub ready: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildResult {
    /// True when the handler actually performed a build (vs. cache hit)
    pub fresh: bool,
    pub build_log: String,
    pub outputs: Map<String, Value>,
}

/// Result of running a task, test or module command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunResult {
    pub success: bool,
    pub log: String,
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceStatus {
    pub state: String,
    pub outputs: Map<String, Value>,
}

impl ServiceStatus {
    pub fn ready(&self) -> bool {
        self.state == "ready"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_names_render_like_the_wire_format() {
        assert_eq!(ProviderAction::ConfigureProvider.to_string(), "configureProvider");
        assert_eq!(ModuleAction::DeployService.to_string(), "deployService");
    }

    #[tokio::test]
    async fn resolved_handler_injects_base_link() {
        let root = Arc::new(ResolvedHandler {
            plugin_name: "base-a".to_string(),
            func: handler(|_| async { Ok(json!({"from": "base"})) }),
            base: None,
        });
        let leaf = ResolvedHandler {
            plugin_name: "test-a".to_string(),
            func: handler(|params: ActionParams| async move {
                let below = params.base.expect("base link missing");
                let mut inner = below.call(ActionParams::new(params.ctx.clone())).await?;
                inner["wrapped"] = json!(true);
                Ok(inner)
            }),
            base: Some(root),
        };
        let out = leaf.call(ActionParams::new(ActionContext::default())).await.unwrap();
        assert_eq!(out, json!({"from": "base", "wrapped": true}));
    }

    #[test]
    fn environment_status_defaults_outputs() {
        let status: EnvironmentStatus = serde_json::from_value(json!({"ready": true})).unwrap();
        assert!(status.ready);
        assert!(status.outputs.is_empty());
    }
}
