//! User-local config store
//!
//! A small typed key-value file (`config-store.json` under the cache
//! directory) holding state that survives process invocations: linked
//! project/module sources and the local secrets cache. Values are plain JSON;
//! writes go through write-temp + rename.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{GardenError, GardenResult};

pub const CONFIG_STORE_FILENAME: &str = "config-store.json";

/// A locally linked source overriding a remote checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedSource {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreData {
    linked_project_sources: Vec<LinkedSource>,
    linked_module_sources: Vec<LinkedSource>,
    /// Provider name -> key -> value
    secrets: Map<String, Value>,
    /// Anything else, keyed by dotted path
    extra: Map<String, Value>,
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    data: StoreData,
}

impl ConfigStore {
    /// Load the store, or start empty when the file does not exist yet
    pub fn load(path: impl Into<PathBuf>) -> GardenResult<Self> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                GardenError::config_at(
                    format!("config store is corrupt: {}", e),
                    path.display().to_string(),
                )
                .with_hint("delete the file to reset local state")
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(GardenError::io(path.clone(), e)),
        };
        Ok(Self { path, data })
    }

    pub fn linked_module_sources(&self) -> &[LinkedSource] {
        &self.data.linked_module_sources
    }

    pub fn linked_project_sources(&self) -> &[LinkedSource] {
        &self.data.linked_project_sources
    }

    pub fn linked_module_path(&self, name: &str) -> Option<&Path> {
        self.data
            .linked_module_sources
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.path.as_path())
    }

    pub fn link_module_source(&mut self, source: LinkedSource) -> GardenResult<()> {
        self.data.linked_module_sources.retain(|s| s.name != source.name);
        self.data.linked_module_sources.push(source);
        self.persist()
    }

    pub fn unlink_module_source(&mut self, name: &str) -> GardenResult<()> {
        self.data.linked_module_sources.retain(|s| s.name != name);
        self.persist()
    }

    pub fn cached_secret(&self, provider: &str, key: &str) -> Option<&Value> {
        self.data.secrets.get(provider)?.as_object()?.get(key)
    }

    pub fn cache_secret(&mut self, provider: &str, key: &str, value: Value) -> GardenResult<()> {
        let entry = self
            .data
            .secrets
            .entry(provider.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        // The file may have been hand-edited; a non-object entry is corrupt
        // store state, not an internal invariant
        let Some(map) = entry.as_object_mut() else {
            return Err(GardenError::config_at(
                format!("secrets entry for provider '{}' is not an object", provider),
                self.path.display().to_string(),
            )
            .with_hint("delete the file to reset local state"));
        };
        map.insert(key.to_string(), value);
        self.persist()
    }

    /// Generic set by key; last write wins
    pub fn set(&mut self, key: &str, value: Value) -> GardenResult<()> {
        self.data.extra.insert(key.to_string(), value);
        self.persist()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.extra.get(key)
    }

    pub fn delete(&mut self, key: &str) -> GardenResult<()> {
        self.data.extra.remove(key);
        self.persist()
    }

    fn persist(&self) -> GardenResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| GardenError::io(parent.to_path_buf(), e))?;
        }
        let json = serde_json::to_string_pretty(&self.data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| GardenError::io(tmp.clone(), e))?;
        fs::rename(&tmp, &self.path).map_err(|e| GardenError::io(self.path.clone(), e))?;
        Ok(())
    }
}
