//! Plugins: handler bundles and module type definitions
//!
//! A plugin declares provider-level handlers, module types it creates or
//! extends, and optional commands. Plugins may inherit from a `base` plugin;
//! the registry flattens the whole chain into one handler table per plugin,
//! leaf wins, with `base` links so an overriding handler can delegate to the
//! one it replaced.

pub mod handler;
pub mod registry;
pub mod router;
pub mod spec;

pub use handler::{
    handler, ActionContext, ActionParams, BuildResult, BuildStatus, EnvironmentStatus, HandlerFn,
    HandlerFuture, ModuleAction, ProviderAction, ResolvedHandler, RunResult, ServiceStatus,
};
pub use registry::{
    PluginRegistry, ResolvedCommand, ResolvedExtension, ResolvedModuleType, ResolvedPlugin,
};
pub use router::ActionRouter;
pub use spec::{ModuleTypeDefinition, ModuleTypeExtension, PluginCommand, PluginSpec};
