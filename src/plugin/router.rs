//! Action routing
//!
//! Maps a typed action plus a target (provider, module, or one of a module's
//! entities) to the right plugin handler, then wraps the invocation with the
//! runtime template pass so handlers only ever see fully resolved params.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::handler::{
    ActionContext, ActionParams, HandlerFn, ModuleAction, ProviderAction, ResolvedHandler,
};
use super::registry::PluginRegistry;
use crate::config::module::Module;
use crate::error::{GardenError, GardenResult};
use crate::process::CancelToken;
use crate::runtime::RuntimeContext;
use crate::template::{resolve_config, TemplateContext, TemplatePass};

pub struct ActionRouter {
    registry: Arc<PluginRegistry>,
    ctx: ActionContext,
}

impl ActionRouter {
    pub fn new(registry: Arc<PluginRegistry>, ctx: ActionContext) -> Self {
        Self { registry, ctx }
    }

    pub fn context(&self) -> &ActionContext {
        &self.ctx
    }

    /// Select the handler for a provider-typed action: the provider's plugin,
    /// base chain already flattened in.
    pub fn provider_handler(
        &self,
        plugin_name: &str,
        action: ProviderAction,
        default: Option<HandlerFn>,
    ) -> GardenResult<Arc<ResolvedHandler>> {
        let plugin = self.registry.get(plugin_name)?;
        if let Some(slot) = plugin.handler(action) {
            return Ok(slot);
        }
        match default {
            Some(func) => Ok(Arc::new(ResolvedHandler {
                plugin_name: plugin_name.to_string(),
                func,
                base: None,
            })),
            None => Err(no_handler(&action.to_string(), plugin_name)),
        }
    }

    /// Select the handler for a module-typed action.
    ///
    /// Order: the creating plugin's handler for the type, then extending
    /// plugins in dependency-topological order with the last match winning
    /// (extensions declared anywhere in a base chain are inherited, so the
    /// creator's own chain participates here too).
    pub fn module_handler(
        &self,
        module_type: &str,
        action: ModuleAction,
        default: Option<HandlerFn>,
    ) -> GardenResult<Arc<ResolvedHandler>> {
        let (creator, created) = self.registry.module_type(module_type)?;
        if let Some(slot) = created.handlers.get(&action) {
            return Ok(slot.clone());
        }
        let extensions = self.registry.extensions_of(module_type);
        for extension in extensions.iter().rev() {
            if let Some(slot) = extension.handlers.get(&action) {
                return Ok(slot.clone());
            }
        }
        match default {
            Some(func) => Ok(Arc::new(ResolvedHandler {
                plugin_name: creator.name.clone(),
                func,
                base: None,
            })),
            None => Err(no_handler(
                &action.to_string(),
                &format!("module type '{}'", module_type),
            )),
        }
    }

    /// Invoke a provider action
    pub async fn call_provider(
        &self,
        plugin_name: &str,
        provider_config: Value,
        action: ProviderAction,
        args: Value,
        cancel: CancelToken,
    ) -> GardenResult<Value> {
        let slot = self.provider_handler(plugin_name, action, None)?;
        debug!(provider = plugin_name, action = %action, handler = %slot.plugin_name, "dispatching provider action");
        let mut params = ActionParams::new(self.ctx.clone());
        params.provider_name = Some(plugin_name.to_string());
        params.provider_config = Some(provider_config);
        params.args = args;
        params.cancel = cancel;
        slot.call(params).await.map_err(|e| wrap_handler_error(e, &format!("provider '{}'", plugin_name)))
    }

    /// Invoke a module action against the module itself or one of its
    /// entities, performing the runtime template pass on `spec` first.
    #[allow(clippy::too_many_arguments)]
    pub async fn call_module_action(
        &self,
        module: Arc<Module>,
        action: ModuleAction,
        entity_kind: &str,
        entity_name: &str,
        spec: &Value,
        base_context: &TemplateContext,
        runtime_context: Option<RuntimeContext>,
        args: Value,
        cancel: CancelToken,
    ) -> GardenResult<Value> {
        let slot = self.module_handler(&module.config.type_name, action, None)?;
        debug!(
            module = module.name(),
            action = %action,
            handler = %slot.plugin_name,
            "dispatching module action"
        );

        let resolved_spec = self.runtime_template_pass(
            spec,
            base_context,
            runtime_context.as_ref(),
            entity_kind,
            entity_name,
        )?;

        let mut params = ActionParams::new(self.ctx.clone());
        params.module = Some(module);
        params.entity_name = Some(entity_name.to_string());
        params.spec = resolved_spec;
        params.runtime_context = runtime_context;
        params.args = args;
        params.cancel = cancel;
        slot.call(params)
            .await
            .map_err(|e| wrap_handler_error(e, &format!("{} '{}'", entity_kind, entity_name)))
    }

    /// Resolve `${runtime.*}` references in a handler param tree. Every
    /// expression must resolve; failures are aggregated into one error.
    pub fn runtime_template_pass(
        &self,
        spec: &Value,
        base_context: &TemplateContext,
        runtime_context: Option<&RuntimeContext>,
        entity_kind: &str,
        entity_name: &str,
    ) -> GardenResult<Value> {
        let mut context = base_context.clone();
        if let Some(runtime) = runtime_context {
            context.set_layer("runtime", runtime.template_layer());
        }
        let resolution = resolve_config(spec, &context, TemplatePass::Runtime)?;
        if !resolution.unresolved.is_empty() {
            return Err(GardenError::Template {
                message: format!(
                    "Unable to resolve one or more runtime template values for {} '{}': {}",
                    entity_kind,
                    entity_name,
                    resolution.unresolved.join(", ")
                ),
                expression: Some(resolution.unresolved.join(", ")),
                trail: Vec::new(),
                hint: Some(
                    "make sure the referenced services and tasks are declared as dependencies"
                        .to_string(),
                ),
            });
        }
        Ok(resolution.value)
    }
}

fn no_handler(action: &str, target: &str) -> GardenError {
    GardenError::plugin(format!("no handler for action '{}' on {}", action, target))
        .with_hint("the plugin (or one of its bases) must implement this action")
}

fn wrap_handler_error(err: anyhow::Error, target: &str) -> GardenError {
    match err.downcast::<GardenError>() {
        Ok(garden) => garden,
        Err(other) => GardenError::Runtime {
            message: format!("handler for {} failed: {}", target, other),
            node_key: None,
            source: Some(other.into()),
        },
    }
}
