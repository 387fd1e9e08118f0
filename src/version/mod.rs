//! Content-addressed module versions
//!
//! A module's version folds the content hashes of its in-scope source files
//! together with the versions of its build dependencies into one short,
//! deterministic identifier. Identical inputs produce byte-identical version
//! strings across runs and hosts; any change to a file, to the file set, or
//! to a dependency version produces a new one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{GardenError, GardenResult};

/// Prefix + digest length of rendered version strings, e.g. `v-1f2e3d4c5b`
const VERSION_PREFIX: &str = "v-";
const VERSION_DIGEST_LEN: usize = 10;

/// A computed module version.
///
/// Field order matters: the build-version file format is JSON with sorted
/// keys, which serde reproduces from the declaration order here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleVersion {
    pub dependency_versions: BTreeMap<String, String>,
    /// Relative paths of the files that went into the hash, sorted
    pub files: Vec<String>,
    pub version_string: String,
}

impl ModuleVersion {
    /// Version of a module with no sources and no dependencies
    pub fn empty() -> Self {
        Self {
            dependency_versions: BTreeMap::new(),
            files: Vec::new(),
            version_string: format!("{}{}", VERSION_PREFIX, "0".repeat(VERSION_DIGEST_LEN)),
        }
    }
}

/// Hash the given files (absolute paths under `root`) plus dependency
/// versions into a [`ModuleVersion`].
pub async fn compute_module_version(
    root: &Path,
    files: &[PathBuf],
    dependency_versions: &BTreeMap<String, String>,
) -> GardenResult<ModuleVersion> {
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let relative = file
            .strip_prefix(root)
            .map_err(|_| {
                GardenError::internal(format!(
                    "version hash input {} is outside module root {}",
                    file.display(),
                    root.display()
                ))
            })?
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = fs::read(file)
            .await
            .map_err(|e| GardenError::io(file.clone(), e))?;
        entries.push((relative, content_hash(&bytes)));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for (relative, hash) in &entries {
        hasher.update(relative.as_bytes());
        hasher.update([0]);
        hasher.update(hash.as_bytes());
        hasher.update([b'\n']);
    }
    // BTreeMap iteration is already sorted by name
    for (name, version) in dependency_versions {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(version.as_bytes());
        hasher.update([b'\n']);
    }

    Ok(ModuleVersion {
        dependency_versions: dependency_versions.clone(),
        files: entries.into_iter().map(|(relative, _)| relative).collect(),
        version_string: render_version(&hasher.finalize()),
    })
}

/// Versions for tests and tasks extend the owning module's version with the
/// entity's own name and declared dependency names.
pub fn compute_entity_version(
    module_version: &ModuleVersion,
    entity_name: &str,
    dependency_names: &[String],
) -> String {
    let mut sorted = dependency_names.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(module_version.version_string.as_bytes());
    hasher.update([0]);
    hasher.update(entity_name.as_bytes());
    for name in &sorted {
        hasher.update([0]);
        hasher.update(name.as_bytes());
    }
    render_version(&hasher.finalize())
}

fn render_version(digest: &[u8]) -> String {
    let hex = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    format!("{}{}", VERSION_PREFIX, &hex[..VERSION_DIGEST_LEN])
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Name of the per-module metadata file under `.garden/build-metadata/`
pub const BUILD_VERSION_FILENAME: &str = "garden-build-version";

/// Read a build-version file. A missing file yields `None`; an unparsable
/// file is treated the same (the build is simply considered stale) and only
/// logged at debug level.
pub async fn read_build_version(path: &Path) -> GardenResult<Option<ModuleVersion>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GardenError::io(path.to_path_buf(), e)),
    };
    match serde_json::from_str(&content) {
        Ok(version) => Ok(Some(version)),
        Err(e) => {
            debug!(
                path = %path.display(),
                error = %e,
                "ignoring unparsable build-version file"
            );
            Ok(None)
        }
    }
}

/// Write a build-version file atomically (write-temp + rename)
pub async fn write_build_version(path: &Path, version: &ModuleVersion) -> GardenResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| GardenError::io(parent.to_path_buf(), e))?;
    }
    let json = serde_json::to_string_pretty(version)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json.as_bytes())
        .await
        .map_err(|e| GardenError::io(tmp.clone(), e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| GardenError::io(path.to_path_buf(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::TempDir;

    async fn version_of(dir: &TempDir, files: &[&str]) -> ModuleVersion {
        let paths: Vec<PathBuf> = files.iter().map(|f| dir.path().join(f)).collect();
        compute_module_version(dir.path(), &paths, &BTreeMap::new())
            .await
            .unwrap()
    }

    fn write(dir: &TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        std_fs::create_dir_all(path.parent().unwrap()).unwrap();
        std_fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn identical_inputs_give_identical_versions() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "hello");
        write(&dir, "sub/b.txt", "world");
        let v1 = version_of(&dir, &["a.txt", "sub/b.txt"]).await;
        let v2 = version_of(&dir, &["a.txt", "sub/b.txt"]).await;
        assert_eq!(v1.version_string, v2.version_string);
        assert_eq!(v1.files, vec!["a.txt", "sub/b.txt"]);
    }

    #[tokio::test]
    async fn file_order_does_not_matter() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "hello");
        write(&dir, "b.txt", "world");
        let v1 = version_of(&dir, &["a.txt", "b.txt"]).await;
        let v2 = version_of(&dir, &["b.txt", "a.txt"]).await;
        assert_eq!(v1.version_string, v2.version_string);
    }

    #[tokio::test]
    async fn content_change_changes_version() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "hello");
        let v1 = version_of(&dir, &["a.txt"]).await;
        write(&dir, "a.txt", "hello!");
        let v2 = version_of(&dir, &["a.txt"]).await;
        assert_ne!(v1.version_string, v2.version_string);
    }

    #[tokio::test]
    async fn file_set_change_changes_version() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "hello");
        write(&dir, "b.txt", "world");
        let v1 = version_of(&dir, &["a.txt"]).await;
        let v2 = version_of(&dir, &["a.txt", "b.txt"]).await;
        assert_ne!(v1.version_string, v2.version_string);
    }

    #[tokio::test]
    async fn dependency_version_change_changes_version() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "hello");
        let paths = vec![dir.path().join("a.txt")];
        let mut deps = BTreeMap::new();
        deps.insert("base".to_string(), "v-1111111111".to_string());
        let v1 = compute_module_version(dir.path(), &paths, &deps)
            .await
            .unwrap();
        deps.insert("base".to_string(), "v-2222222222".to_string());
        let v2 = compute_module_version(dir.path(), &paths, &deps)
            .await
            .unwrap();
        assert_ne!(v1.version_string, v2.version_string);
    }

    #[test]
    fn entity_version_depends_on_name_and_deps() {
        let module = ModuleVersion::empty();
        let unit = compute_entity_version(&module, "unit", &[]);
        let integ = compute_entity_version(&module, "integ", &[]);
        assert_ne!(unit, integ);

        let with_dep = compute_entity_version(&module, "unit", &["db".to_string()]);
        assert_ne!(unit, with_dep);

        // dependency name order is irrelevant
        let ab = compute_entity_version(&module, "unit", &["a".to_string(), "b".to_string()]);
        let ba = compute_entity_version(&module, "unit", &["b".to_string(), "a".to_string()]);
        assert_eq!(ab, ba);
    }

    #[tokio::test]
    async fn build_version_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BUILD_VERSION_FILENAME);
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), "v-1234567890".to_string());
        let version = ModuleVersion {
            dependency_versions: deps,
            files: vec!["src/main.go".to_string()],
            version_string: "v-abcdef0123".to_string(),
        };
        write_build_version(&path, &version).await.unwrap();
        let read = read_build_version(&path).await.unwrap().unwrap();
        assert_eq!(read, version);
    }

    #[tokio::test]
    async fn missing_build_version_file_is_none() {
        let dir = TempDir::new().unwrap();
        let read = read_build_version(&dir.path().join("nope")).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn stale_build_version_file_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BUILD_VERSION_FILENAME);
        std_fs::write(&path, "{not json").unwrap();
        let read = read_build_version(&path).await.unwrap();
        assert!(read.is_none());
    }
}
