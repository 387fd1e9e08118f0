//! Source tracking abstraction
//!
//! The core never talks to a concrete version control system. It asks a
//! [`VcsHandler`] for the set of tracked files under a module root and for
//! local checkouts of remote sources; the bundled [`WorkspaceVcs`] walks the
//! filesystem directly, which is the behavior for plain local projects.
//! Concrete adapters (git and friends) implement the same trait outside the
//! core.

use async_trait::async_trait;
use glob::Pattern;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

use crate::error::{GardenError, GardenResult};

/// Include/exclude/ignore rules applied to paths relative to a scan root
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    /// `None` means everything; `Some([])` means *no sources at all*
    pub include: Option<Vec<String>>,
    pub exclude: Vec<String>,
    /// Patterns collected from dotignore files; matched against every path
    /// component as well as the full relative path
    pub ignore: Vec<String>,
}

impl FileFilter {
    pub fn matches(&self, relative: &Path) -> bool {
        if self.is_ignored(relative) {
            return false;
        }
        if self
            .exclude
            .iter()
            .any(|pattern| pattern_matches(pattern, relative))
        {
            return false;
        }
        match &self.include {
            None => true,
            Some(patterns) => patterns
                .iter()
                .any(|pattern| pattern_matches(pattern, relative)),
        }
    }

    /// Whether a directory can be pruned from the walk entirely
    pub fn prunes_directory(&self, relative: &Path) -> bool {
        self.is_ignored(relative)
    }

    fn is_ignored(&self, relative: &Path) -> bool {
        for pattern in &self.ignore {
            if pattern_matches(pattern, relative) {
                return true;
            }
            for component in relative.components() {
                if let Some(name) = component.as_os_str().to_str() {
                    if Pattern::new(pattern).map(|p| p.matches(name)).unwrap_or(false) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

fn pattern_matches(pattern: &str, relative: &Path) -> bool {
    match Pattern::new(pattern) {
        Ok(compiled) => {
            if compiled.matches_path(relative) {
                return true;
            }
            // A bare directory pattern covers everything beneath it
            relative.starts_with(pattern)
        }
        Err(_) => false,
    }
}

/// A remote source to make available locally
#[derive(Debug, Clone)]
pub struct RemoteSourceSpec {
    pub name: String,
    pub url: String,
    pub kind: RemoteSourceKind,
    /// `<cache>/sources/` directory
    pub sources_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSourceKind {
    Project,
    Module,
}

impl RemoteSourceSpec {
    /// Deterministic checkout path: `sources/<kind>/<name>--<urlhash>/`
    pub fn checkout_path(&self) -> PathBuf {
        let kind = match self.kind {
            RemoteSourceKind::Project => "project",
            RemoteSourceKind::Module => "module",
        };
        self.sources_dir
            .join(kind)
            .join(format!("{}--{}", self.name, hash_url(&self.url)))
    }
}

/// Short stable identifier for a source URL
pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..10].to_string()
}

#[async_trait]
pub trait VcsHandler: Send + Sync {
    /// Enumerate tracked files under `root`, filtered. Paths are absolute.
    async fn tracked_files(&self, root: &Path, filter: &FileFilter) -> GardenResult<Vec<PathBuf>>;

    /// Make a remote source available locally, returning its checkout path
    async fn ensure_remote_source(&self, spec: &RemoteSourceSpec) -> GardenResult<PathBuf>;
}

/// Plain filesystem walk: every regular file is considered tracked
pub struct WorkspaceVcs;

#[async_trait]
impl VcsHandler for WorkspaceVcs {
    async fn tracked_files(&self, root: &Path, filter: &FileFilter) -> GardenResult<Vec<PathBuf>> {
        let root = root.to_path_buf();
        let filter = filter.clone();
        // walkdir is synchronous; hop to a blocking thread for large trees
        let files = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let walker = WalkDir::new(&root).follow_links(false).into_iter();
            let iter = walker.filter_entry(|entry| {
                let relative = match entry.path().strip_prefix(&root) {
                    Ok(r) => r,
                    Err(_) => return true,
                };
                if relative.as_os_str().is_empty() {
                    return true;
                }
                !(entry.file_type().is_dir() && filter.prunes_directory(relative))
            });
            for entry in iter {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&root) {
                    Ok(r) => r.to_path_buf(),
                    Err(_) => continue,
                };
                if filter.matches(&relative) {
                    found.push(entry.into_path());
                }
            }
            found.sort();
            found
        })
        .await
        .map_err(|e| GardenError::internal(format!("file walk task panicked: {}", e)))?;

        trace!(count = files.len(), "enumerated tracked files");
        Ok(files)
    }

    async fn ensure_remote_source(&self, spec: &RemoteSourceSpec) -> GardenResult<PathBuf> {
        let path = spec.checkout_path();
        if path.is_dir() {
            return Ok(path);
        }
        Err(GardenError::config(format!(
            "remote source '{}' ({}) is not available at {}",
            spec.name,
            spec.url,
            path.display()
        ))
        .with_hint(
            "fetch the source with a VCS adapter, or link a local checkout with the config store",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, relative: &str) {
        let path = dir.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[tokio::test]
    async fn walk_honors_include_and_exclude() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "src/main.rs");
        touch(&dir, "src/util.rs");
        touch(&dir, "docs/readme.md");
        touch(&dir, "target/out.bin");

        let filter = FileFilter {
            include: Some(vec!["src/**/*".to_string()]),
            exclude: vec!["src/util.rs".to_string()],
            ignore: vec!["target".to_string()],
        };
        let files = WorkspaceVcs
            .tracked_files(dir.path(), &filter)
            .await
            .unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["src/main.rs"]);
    }

    #[tokio::test]
    async fn empty_include_means_no_sources() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");
        let filter = FileFilter {
            include: Some(vec![]),
            ..Default::default()
        };
        let files = WorkspaceVcs
            .tracked_files(dir.path(), &filter)
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn ignore_pattern_prunes_whole_directory() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "node_modules/dep/index.js");
        touch(&dir, "app.js");
        let filter = FileFilter {
            ignore: vec!["node_modules".to_string()],
            ..Default::default()
        };
        let files = WorkspaceVcs
            .tracked_files(dir.path(), &filter)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("app.js"));
    }

    #[test]
    fn checkout_path_is_stable_per_url() {
        let spec = RemoteSourceSpec {
            name: "shared".to_string(),
            url: "https://example.com/repo.git#main".to_string(),
            kind: RemoteSourceKind::Module,
            sources_dir: PathBuf::from("/cache/sources"),
        };
        let a = spec.checkout_path();
        let b = spec.checkout_path();
        assert_eq!(a, b);
        assert!(a.starts_with("/cache/sources/module"));
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("shared--"));
    }

    #[tokio::test]
    async fn missing_remote_source_is_actionable() {
        let dir = TempDir::new().unwrap();
        let spec = RemoteSourceSpec {
            name: "shared".to_string(),
            url: "https://example.com/repo.git".to_string(),
            kind: RemoteSourceKind::Module,
            sources_dir: dir.path().to_path_buf(),
        };
        let err = WorkspaceVcs.ensure_remote_source(&spec).await.unwrap_err();
        assert!(err.detail().contains("link a local checkout"));
    }
}
