//! Build staging
//!
//! Non-local modules are built from a staged copy of their sources under
//! `<cache>/build/<module>/`, never from the working tree. The staged file
//! set is exactly the version-relevant set (what the hasher saw), plus any
//! artifacts pulled in from build dependencies via their `copy` directives.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::config::module::Module;
use crate::error::{GardenError, GardenResult};

pub fn build_dir(cache_dir: &Path, module_name: &str) -> PathBuf {
    cache_dir.join("build").join(module_name)
}

/// Stage a module's sources for building; returns the directory the build
/// should run in. Local modules build in place and are not staged.
pub async fn stage_build(
    cache_dir: &Path,
    module: &Module,
    dependency_modules: &[std::sync::Arc<Module>],
) -> GardenResult<PathBuf> {
    if module.config.local {
        return Ok(module.config.path.clone());
    }

    let stage = build_dir(cache_dir, module.name());
    if stage.exists() {
        fs::remove_dir_all(&stage)
            .await
            .map_err(|e| GardenError::io(stage.clone(), e))?;
    }
    fs::create_dir_all(&stage)
        .await
        .map_err(|e| GardenError::io(stage.clone(), e))?;

    for relative in &module.version.files {
        let from = module.config.path.join(relative);
        let to = stage.join(relative);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| GardenError::io(parent.to_path_buf(), e))?;
        }
        fs::copy(&from, &to)
            .await
            .map_err(|e| GardenError::io(from.clone(), e))?;
    }

    for dep in &module.config.build.dependencies {
        if dep.copy.is_empty() {
            continue;
        }
        let dep_module = dependency_modules
            .iter()
            .find(|m| m.name() == dep.name)
            .ok_or_else(|| {
                GardenError::internal(format!(
                    "staging '{}': dependency module '{}' was not provided",
                    module.name(),
                    dep.name
                ))
            })?;
        // Artifacts come from where the dependency was built
        let dep_root = if dep_module.config.local {
            dep_module.config.path.clone()
        } else {
            build_dir(cache_dir, &dep_module.config.name)
        };
        for copy in &dep.copy {
            let from = dep_root.join(&copy.source);
            let to = stage.join(&copy.target);
            copy_tree(&from, &to).await.map_err(|e| {
                GardenError::config(format!(
                    "module '{}': copying '{}' from build dependency '{}' failed: {}",
                    module.name(),
                    copy.source,
                    dep.name,
                    e
                ))
            })?;
        }
    }

    debug!(module = module.name(), stage = %stage.display(), "staged build sources");
    Ok(stage)
}

/// Recursively copy a file or directory
async fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    let from = from.to_path_buf();
    let to = to.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree_blocking(&from, &to))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
}

fn copy_tree_blocking(from: &Path, to: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(from)?;
    if metadata.is_file() {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
        return Ok(());
    }
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        copy_tree_blocking(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}
