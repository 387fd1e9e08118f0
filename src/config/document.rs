//! Raw `garden.yml` document shapes
//!
//! These deserialize straight from YAML (after the static template pass runs
//! over the parsed value). Defaults mirror the documented file format.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_API_VERSION: &str = "garden.io/v0";
pub const PROJECT_KIND: &str = "Project";
pub const MODULE_KIND: &str = "Module";

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_dot_ignore_files() -> Vec<String> {
    vec![".gardenignore".to_string()]
}

/// The single `kind: Project` document at the project root
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectDocument {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub default_environment: Option<String>,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfigDoc>,
    #[serde(default = "default_dot_ignore_files")]
    pub dot_ignore_files: Vec<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub modules: Option<ModuleScanConfig>,
}

impl ProjectDocument {
    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// The environment to use: `--env` if given, else `defaultEnvironment`,
    /// else the first declared environment.
    pub fn pick_environment(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(String::from)
            .or_else(|| self.default_environment.clone())
            .or_else(|| self.environments.first().map(|e| e.name.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// One entry in the project's `providers` list. Everything except `name` and
/// `environments` is the provider's own config.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigDoc {
    pub name: String,
    /// Restricts the provider to these environments; absent = all
    #[serde(default)]
    pub environments: Option<Vec<String>>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

/// Project-level include/exclude globs for module config scanning
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleScanConfig {
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A `kind: Module` document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDocument {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub kind: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default = "default_true")]
    pub allow_publish: bool,
    /// Exec-style modules that run against the module directory itself
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub build: BuildDocument,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub tasks: Vec<EntityDocument>,
    #[serde(default)]
    pub tests: Vec<EntityDocument>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDocument {
    #[serde(default)]
    pub dependencies: Vec<BuildDependencyDoc>,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Build dependencies may be written as a bare name or as `{name, copy}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BuildDependencyDoc {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        copy: Vec<CopySpecDoc>,
    },
}

impl BuildDependencyDoc {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(n) => n,
            Self::Full { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySpecDoc {
    pub source: String,
    #[serde(default)]
    pub target: Option<String>,
}

/// A task or test declared inline on a module. Keys beyond the common ones
/// form the entity's type-specific spec.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDocument {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub spec: Map<String, Value>,
}
