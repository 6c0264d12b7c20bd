//! Persisted fact-graph cache.
//!
//! Entries are keyed by content hash and carry the schema version and the
//! extractor model that produced them. The store treats an entry with a
//! different version or model as a miss.

use super::KnowledgeEdge;
use crate::error::CacheError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Current cache entry schema version.
pub const CACHE_VERSION: u32 = 1;

/// One cached extraction result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: u32,
    pub source_model: String,
    pub edges: Vec<KnowledgeEdge>,
    /// Image description, for visual entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl CacheEntry {
    pub fn new(source_model: impl Into<String>, edges: Vec<KnowledgeEdge>) -> Self {
        Self {
            version: CACHE_VERSION,
            source_model: source_model.into(),
            edges,
            description: None,
            summary: None,
        }
    }

    pub fn with_description(mut self, description: String, summary: String) -> Self {
        self.description = Some(description);
        self.summary = Some(summary);
        self
    }

    /// Usable for a lookup made with `model`.
    pub fn is_compatible(&self, model: &str) -> bool {
        self.version == CACHE_VERSION && self.source_model == model
    }
}

/// Keyed storage for extraction results.
#[async_trait]
pub trait EdgeCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace. Last writer wins.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;
}

/// Process-local cache, also the test double for the file cache.
#[derive(Debug, Default)]
pub struct InMemoryEdgeCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryEdgeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EdgeCache for InMemoryEdgeCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }
}

/// Current file layout version.
const FILE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

/// Cache stored as one JSON document on disk.
///
/// Writes go to a sibling temp file and are renamed into place.
pub struct JsonFileEdgeCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileEdgeCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<CacheFile, CacheError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheFile::default()),
            Err(e) => return Err(e.into()),
        };
        let file: CacheFile = serde_json::from_str(&content)?;
        if file.version != FILE_VERSION {
            return Err(CacheError::VersionMismatch {
                expected: FILE_VERSION,
                found: file.version,
            });
        }
        Ok(file)
    }
}

#[async_trait]
impl EdgeCache for JsonFileEdgeCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.load().await {
            Ok(mut file) => Ok(file.entries.remove(key)),
            Err(CacheError::VersionMismatch { expected, found }) => {
                warn!(path = %self.path.display(), expected, found, "ignoring cache file with old layout");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;

        let mut file = match self.load().await {
            Ok(file) => file,
            Err(CacheError::VersionMismatch { .. }) => CacheFile::default(),
            Err(e) => return Err(e),
        };
        file.version = FILE_VERSION;
        file.entries.insert(key.to_string(), entry);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&file)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
