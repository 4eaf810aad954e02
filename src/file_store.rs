use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};

/// A file in the project, by workspace-relative `/`-separated path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
}

/// Filesystem access as seen by the engine. Paths are workspace-relative.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<String>>;

    /// Write `content`, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn list_project_files(&self, root: &str) -> Result<Vec<ProjectFile>>;

    /// Returns the path of the created directory.
    async fn create_directory(&self, parent: &str, name: &str) -> Result<String>;
}

/// Normalize a model- or user-supplied path: backslashes become `/`, leading
/// `./` segments are dropped.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

/// Files on disk under a workspace root. Paths that would escape the root
/// are refused.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = normalize_path(path);
        let requested = Path::new(&normalized);

        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map_err(|_| outside_workspace(path))?
                .to_path_buf()
        } else {
            requested.to_path_buf()
        };

        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(outside_workspace(path));
                }
            }
        }
        Ok(resolved)
    }
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn outside_workspace(path: &str) -> EngineError {
    EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        format!("path is outside workspace: {path}"),
    ))
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let abs = self.resolve(path)?;
        match tokio::fs::read_to_string(&abs).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let abs = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&abs, content.as_bytes()).await?;
        debug!(path, bytes = content.len(), "wrote file");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let abs = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&abs).await?)
    }

    async fn list_project_files(&self, root: &str) -> Result<Vec<ProjectFile>> {
        let start = self.resolve(root)?;

        let paths = tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            for entry in WalkBuilder::new(&start).hidden(true).git_ignore(true).build().flatten() {
                if entry.file_type().is_some_and(|t| t.is_file()) {
                    paths.push(entry.into_path());
                }
            }
            paths
        })
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;

        let mut files: Vec<ProjectFile> = paths
            .iter()
            .map(|p| ProjectFile {
                path: relative_to(&self.root, p),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn create_directory(&self, parent: &str, name: &str) -> Result<String> {
        let parent = normalize_path(parent);
        let joined = if parent.is_empty() || parent == "." {
            name.to_string()
        } else {
            format!("{}/{}", parent.trim_end_matches('/'), name)
        };
        let abs = self.resolve(&joined)?;
        tokio::fs::create_dir_all(&abs).await?;
        Ok(relative_to(&self.root, &abs))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<String, String>>,
    directories: Mutex<BTreeSet<String>>,
    fail_writes: AtomicBool,
    fail_listing: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let store = Self::new();
        if let Ok(mut map) = store.files.lock() {
            for (path, content) in files {
                map.insert(normalize_path(&path.into()), content.into());
            }
        }
        store
    }

    /// Make every subsequent write fail, to exercise conflict handling.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.files.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

fn poisoned() -> EngineError {
    EngineError::Io(std::io::Error::other("file store lock poisoned"))
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stream did not contain valid UTF-8",
            )));
        }
        let files = self.files.lock().map_err(|_| poisoned())?;
        Ok(files.get(&normalize_path(path)).cloned())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "write refused",
            )));
        }
        let mut files = self.files.lock().map_err(|_| poisoned())?;
        files.insert(normalize_path(path), content.to_string());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        let files = self.files.lock().map_err(|_| poisoned())?;
        let dirs = self.directories.lock().map_err(|_| poisoned())?;
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn list_project_files(&self, root: &str) -> Result<Vec<ProjectFile>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(EngineError::Io(std::io::Error::other("listing refused")));
        }
        let root = normalize_path(root);
        let prefix = match root.as_str() {
            "" | "." => String::new(),
            other => format!("{}/", other.trim_end_matches('/')),
        };
        let files = self.files.lock().map_err(|_| poisoned())?;
        Ok(files
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .map(|path| ProjectFile { path: path.clone() })
            .collect())
    }

    async fn create_directory(&self, parent: &str, name: &str) -> Result<String> {
        let parent = normalize_path(parent);
        let path = if parent.is_empty() || parent == "." {
            name.to_string()
        } else {
            format!("{}/{}", parent.trim_end_matches('/'), name)
        };
        let mut dirs = self.directories.lock().map_err(|_| poisoned())?;
        dirs.insert(path.clone());
        Ok(path)
    }
}
