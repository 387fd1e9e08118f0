//! Config file discovery
//!
//! Scans the project tree for `garden.yml` / `garden.yaml` files, honoring
//! the ignore hierarchy (always-on VCS/cache dirs, the project's dotignore
//! files, and the project-level `modules.include` / `modules.exclude` globs).

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use super::document::{ProjectDocument, MODULE_KIND, PROJECT_KIND};
use crate::error::{GardenError, GardenResult};
use crate::vcs::FileFilter;

pub const CONFIG_FILENAME_YML: &str = "garden.yml";
pub const CONFIG_FILENAME_YAML: &str = "garden.yaml";

/// Directories never scanned, independent of user configuration
const ALWAYS_IGNORED: &[&str] = &[".git", ".garden", ".hg", ".svn"];

/// A module document found during the scan, prior to resolution
#[derive(Debug, Clone)]
pub struct RawModule {
    pub value: Value,
    pub config_path: PathBuf,
    pub dir: PathBuf,
}

#[derive(Debug)]
pub struct DiscoveredConfigs {
    pub project: ProjectDocument,
    pub project_config_path: PathBuf,
    /// Patterns from the project's dotignore files plus the built-ins
    pub ignore_patterns: Vec<String>,
    pub modules: Vec<RawModule>,
}

/// Load the project document and scan for module documents below `root`
pub async fn discover_configs(root: &Path) -> GardenResult<DiscoveredConfigs> {
    let project_config_path = config_file_in(root)?.ok_or_else(|| {
        GardenError::config(format!(
            "no project configuration found at {}",
            root.display()
        ))
        .with_hint("create a garden.yml with `kind: Project` at the project root")
    })?;

    let root_documents = load_documents(&project_config_path).await?;
    let mut project: Option<ProjectDocument> = None;
    let mut modules: Vec<RawModule> = Vec::new();

    for value in &root_documents {
        match document_kind(value, &project_config_path)? {
            k if k == PROJECT_KIND => {
                if project.is_some() {
                    return Err(GardenError::config_at(
                        "multiple Project documents found; a project has exactly one",
                        project_config_path.display().to_string(),
                    ));
                }
                project = Some(
                    ProjectDocument::deserialize(value.clone()).map_err(|e| {
                        GardenError::config_at(
                            format!("invalid Project document: {}", e),
                            project_config_path.display().to_string(),
                        )
                    })?,
                );
            }
            k if k == MODULE_KIND => modules.push(RawModule {
                value: value.clone(),
                config_path: project_config_path.clone(),
                dir: root.to_path_buf(),
            }),
            other => {
                return Err(GardenError::config_at(
                    format!("unknown document kind '{}'", other),
                    project_config_path.display().to_string(),
                ))
            }
        }
    }

    let project = project.ok_or_else(|| {
        GardenError::config_at(
            "the root garden.yml must contain a `kind: Project` document",
            project_config_path.display().to_string(),
        )
    })?;

    let mut ignore_patterns: Vec<String> =
        ALWAYS_IGNORED.iter().map(|s| s.to_string()).collect();
    for name in &project.dot_ignore_files {
        ignore_patterns.extend(read_ignore_file(&root.join(name)).await?);
    }

    let scan = project.modules.clone().unwrap_or_default();
    let filter = FileFilter {
        include: scan.include,
        exclude: scan.exclude,
        ignore: ignore_patterns.clone(),
    };

    for config_path in scan_for_config_files(root, &filter)? {
        if config_path == project_config_path {
            continue;
        }
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        for value in load_documents(&config_path).await? {
            match document_kind(&value, &config_path)? {
                k if k == PROJECT_KIND => {
                    return Err(GardenError::config_at(
                        "Project documents are only allowed at the project root",
                        config_path.display().to_string(),
                    ))
                }
                k if k == MODULE_KIND => modules.push(RawModule {
                    value,
                    config_path: config_path.clone(),
                    dir: dir.clone(),
                }),
                other => {
                    return Err(GardenError::config_at(
                        format!("unknown document kind '{}'", other),
                        config_path.display().to_string(),
                    ))
                }
            }
        }
    }

    debug!(
        modules = modules.len(),
        "discovered module configuration documents"
    );

    Ok(DiscoveredConfigs {
        project,
        project_config_path,
        ignore_patterns,
        modules,
    })
}

/// The config file in a directory; errors when both extensions are present
pub fn config_file_in(dir: &Path) -> GardenResult<Option<PathBuf>> {
    let yml = dir.join(CONFIG_FILENAME_YML);
    let yaml = dir.join(CONFIG_FILENAME_YAML);
    match (yml.is_file(), yaml.is_file()) {
        (true, true) => Err(GardenError::config_at(
            "found both garden.yml and garden.yaml; use one or the other",
            dir.display().to_string(),
        )),
        (true, false) => Ok(Some(yml)),
        (false, true) => Ok(Some(yaml)),
        (false, false) => Ok(None),
    }
}

fn scan_for_config_files(root: &Path, filter: &FileFilter) -> GardenResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let relative = match entry.path().strip_prefix(root) {
                Ok(r) => r,
                Err(_) => return true,
            };
            if relative.as_os_str().is_empty() {
                return true;
            }
            !(entry.file_type().is_dir() && filter.prunes_directory(relative))
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Some(config) = config_file_in(entry.path())? {
            let relative = config.strip_prefix(root).unwrap_or(&config);
            if filter.matches(relative) {
                found.push(config);
            }
        }
    }
    found.sort();
    Ok(found)
}

async fn read_ignore_file(path: &Path) -> GardenResult<Vec<String>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GardenError::io(path.to_path_buf(), e)),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Parse a (possibly multi-document) YAML file into JSON values
async fn load_documents(path: &Path) -> GardenResult<Vec<Value>> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| GardenError::io(path.to_path_buf(), e))?;
    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(&content) {
        let yaml = serde_yaml::Value::deserialize(deserializer).map_err(|e| {
            GardenError::config_at(
                format!("invalid YAML: {}", e),
                path.display().to_string(),
            )
        })?;
        if yaml.is_null() {
            continue;
        }
        documents.push(serde_json::to_value(yaml)?);
    }
    Ok(documents)
}

fn document_kind(value: &Value, path: &Path) -> GardenResult<String> {
    value
        .get("kind")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            GardenError::config_at(
                "document is missing the `kind` field",
                path.display().to_string(),
            )
            .with_hint("set `kind: Project` or `kind: Module`")
        })
}
