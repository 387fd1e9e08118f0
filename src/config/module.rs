//! Resolved module configuration

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::version::ModuleVersion;

#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub api_version: String,
    pub type_name: String,
    pub name: String,
    /// Module root directory (after remote-source relocation)
    pub path: PathBuf,
    /// The garden.yml the module came from
    pub config_path: PathBuf,
    pub description: Option<String>,
    pub include: Option<Vec<String>>,
    pub exclude: Vec<String>,
    pub repository_url: Option<String>,
    pub allow_publish: bool,
    pub local: bool,
    pub build: BuildConfig,
    pub env: BTreeMap<String, String>,
    pub spec: Value,
    pub service_configs: Vec<ServiceConfig>,
    pub task_configs: Vec<TaskConfig>,
    pub test_configs: Vec<TestConfig>,
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    pub dependencies: Vec<BuildDependency>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildDependency {
    pub name: String,
    pub copy: Vec<CopySpec>,
}

#[derive(Debug, Clone)]
pub struct CopySpec {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub dependencies: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub spec: Value,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub name: String,
    pub dependencies: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Seconds
    pub timeout: Option<u64>,
    pub spec: Value,
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    pub name: String,
    pub dependencies: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Seconds
    pub timeout: Option<u64>,
    pub spec: Value,
}

/// A module with its version assigned
#[derive(Debug, Clone)]
pub struct Module {
    pub config: ModuleConfig,
    pub version: ModuleVersion,
}

impl Module {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn version_string(&self) -> &str {
        &self.version.version_string
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.config.service_configs.iter().find(|s| s.name == name)
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.config.task_configs.iter().find(|t| t.name == name)
    }

    pub fn test(&self, name: &str) -> Option<&TestConfig> {
        self.config.test_configs.iter().find(|t| t.name == name)
    }

    /// Names of declared build dependencies
    pub fn build_dependency_names(&self) -> Vec<String> {
        self.config
            .build
            .dependencies
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }
}
