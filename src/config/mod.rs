//! Project and module configuration
//!
//! Everything between raw `garden.yml` files on disk and fully resolved
//! [`module::Module`]s: document parsing, config file discovery with ignore
//! rules, the static template pass, schema validation, the plugin `configure`
//! step and version assignment.

pub mod discovery;
pub mod document;
pub mod module;
pub mod resolver;

pub use discovery::{discover_configs, DiscoveredConfigs, RawModule};
pub use document::{
    EntityDocument, EnvironmentConfig, ModuleDocument, ProjectDocument, ProviderConfigDoc,
};
pub use module::{Module, ModuleConfig};
pub use resolver::ModuleResolver;
