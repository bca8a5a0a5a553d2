//! Capability interfaces the runtime consumes from its host.
//!
//! The core never implements these against a real machine; the host injects
//! adapters and keeps their lifetimes. An in-memory filesystem double lives
//! here for agent tests (snapshot/rollback behaviour needs a writable
//! filesystem to exercise).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, CapabilityError>;

// ---------------------------------------------------------------------------
// FileSystem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[async_trait::async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<String>;
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait WritableFileSystem: FileSystem {
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;
    /// Replace the first occurrence of `old` with `new` in the file.
    async fn edit_file(&self, path: &str, old: &str, new: &str) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn mkdir(&self, path: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Shell
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: u32,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[async_trait::async_trait]
pub trait Shell: Send + Sync {
    async fn run(&self, command: &str) -> Result<ShellOutput>;
    async fn running_processes(&self) -> Result<Vec<ProcessInfo>>;
    async fn kill(&self, id: u32) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TestRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunOutcome {
    pub success: bool,
    pub output: String,
}

#[async_trait::async_trait]
pub trait TestRunner: Send + Sync {
    async fn detect_framework(&self) -> Result<String>;
    async fn run(&self, pattern: Option<&str>) -> Result<TestRunOutcome>;
    async fn coverage(&self) -> Result<TestRunOutcome>;
}

// ---------------------------------------------------------------------------
// CodeAnalyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// 0–100 quality score.
    pub score: u8,
    pub issues: Vec<String>,
    pub lines_analyzed: usize,
}

#[async_trait::async_trait]
pub trait CodeAnalyzer: Send + Sync {
    async fn analyze(&self, file: &str, content: &str) -> Result<Analysis>;
}

// ---------------------------------------------------------------------------
// WebSearch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait::async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
    async fn fetch(&self, url: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// ScreenshotService / IntegrationConnectorsState
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait ScreenshotService: Send + Sync {
    /// Capture the named target (a URL or window id) and return the image
    /// path the host stored it at.
    async fn capture(&self, target: &str) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub name: String,
    pub connected: bool,
}

#[async_trait::async_trait]
pub trait IntegrationConnectorsState: Send + Sync {
    async fn list_connectors(&self) -> Result<Vec<ConnectorInfo>>;
    async fn is_connected(&self, name: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// MemoryFileSystem -- test double
// ---------------------------------------------------------------------------

/// In-memory `WritableFileSystem`. Paths are plain string keys; directories
/// exist implicitly once a file under them does.
#[derive(Default, Clone)]
pub struct MemoryFileSystem {
    files: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_files(entries: &[(&str, &str)]) -> Self {
        let fs = Self::new();
        {
            let mut files = fs.files.write().await;
            for (path, content) in entries {
                files.insert((*path).to_string(), (*content).to_string());
            }
        }
        fs
    }

    pub async fn file_count(&self) -> usize {
        self.files.read().await.len()
    }
}

#[async_trait::async_trait]
impl FileSystem for MemoryFileSystem {
    async fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| CapabilityError::NotFound(path.to_string()))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let prefix = if path.is_empty() || path == "." {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let files = self.files.read().await;
        let mut entries: Vec<DirEntry> = Vec::new();
        let mut seen_dirs: Vec<String> = Vec::new();
        for (file, content) in files.iter() {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => entries.push(DirEntry {
                    name: rest.to_string(),
                    is_directory: false,
                    size: Some(content.len() as u64),
                }),
                Some((dir, _)) => {
                    if !seen_dirs.iter().any(|d| d == dir) {
                        seen_dirs.push(dir.to_string());
                        entries.push(DirEntry {
                            name: dir.to_string(),
                            is_directory: true,
                            size: None,
                        });
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.read().await.contains_key(path))
    }
}

#[async_trait::async_trait]
impl WritableFileSystem for MemoryFileSystem {
    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .write()
            .await
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn edit_file(&self, path: &str, old: &str, new: &str) -> Result<()> {
        let mut files = self.files.write().await;
        let content = files
            .get(path)
            .ok_or_else(|| CapabilityError::NotFound(path.to_string()))?;
        match content.find(old) {
            Some(_) => {
                let updated = content.replacen(old, new, 1);
                files.insert(path.to_string(), updated);
                Ok(())
            }
            None => Err(CapabilityError::Io(format!(
                "pattern not found in {path}"
            ))),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .await
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| CapabilityError::NotFound(path.to_string()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write().await;
        let content = files
            .remove(from)
            .ok_or_else(|| CapabilityError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), content);
        Ok(())
    }

    async fn mkdir(&self, _path: &str) -> Result<()> {
        // Directories are implicit.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
