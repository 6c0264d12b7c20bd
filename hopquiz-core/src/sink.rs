//! Dataset output.
//!
//! One [`DatasetRecord`] per accepted question, appended to a
//! [`DatasetSink`].

use crate::error::SinkError;
use crate::judge::{DifficultyMetrics, DifficultyTier};
use crate::parse::AnswerKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// One accepted question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub question: String,
    pub answer: AnswerKey,
    #[serde(default)]
    pub reasoning: Option<String>,
    pub difficulty_metrics: DifficultyMetrics,
    pub review_decision: Option<bool>,
    pub review_raw: String,
    pub tier: DifficultyTier,
    pub num_hops: usize,
}

/// Append-only store of accepted questions.
#[async_trait]
pub trait DatasetSink: Send + Sync {
    async fn append(&self, record: &DatasetRecord) -> Result<(), SinkError>;
}

/// Records kept in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DatasetRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DatasetRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl DatasetSink for MemorySink {
    async fn append(&self, record: &DatasetRecord) -> Result<(), SinkError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Records stored as one pretty-printed JSON array.
///
/// Each append rewrites the file through a temp file and a rename. Existing
/// entries are kept as they are, even when they do not parse as records.
pub struct JsonArraySink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonArraySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Value>, SinkError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Array(items) => Ok(items),
            _ => Err(SinkError::InvalidFormat(self.path.display().to_string())),
        }
    }

    /// Every record in the file that parses.
    pub async fn read_all(&self) -> Result<Vec<DatasetRecord>, SinkError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }
}

#[async_trait]
impl DatasetSink for JsonArraySink {
    async fn append(&self, record: &DatasetRecord) -> Result<(), SinkError> {
        let _guard = self.lock.lock().await;

        let mut items = self.load().await?;
        items.push(serde_json::to_value(record)?);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&items)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
