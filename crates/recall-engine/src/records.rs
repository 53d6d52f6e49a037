use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recall_core::{RecallError, RecallResult, Scope};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// The durable unit of every collection.
///
/// Vector and text indexes are derived from records and can always be
/// rebuilt from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record id, shared with the index nodes built from it.
    pub id: Uuid,
    /// Owner, session or global partition.
    pub scope: Scope,
    /// Text that is indexed for keyword search.
    pub text: String,
    /// Collection-specific attributes.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// `None` when the embedding provider was unavailable at write time.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    /// First write.
    pub created_at: DateTime<Utc>,
    /// Last replacement.
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// A new record stamped with the current time.
    pub fn new(id: Uuid, scope: Scope, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            scope,
            text: text.into(),
            metadata: BTreeMap::new(),
            vector: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the vector. Chainable builder method.
    pub fn with_vector(mut self, vector: Option<Vec<f32>>) -> Self {
        self.vector = vector;
        self
    }

    /// Sets the metadata map. Chainable builder method.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// String metadata value.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Boolean metadata value, `false` when absent.
    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

/// Trait for durable record storage backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record, replacing any record with the same id.
    async fn put(&self, record: Record) -> RecallResult<()>;

    /// Fetch a record by id.
    async fn get(&self, id: Uuid) -> RecallResult<Option<Record>>;

    /// Delete a record by id.
    async fn delete(&self, id: Uuid) -> RecallResult<bool>;

    /// Delete several records at once; returns how many existed.
    async fn delete_many(&self, ids: &[Uuid]) -> RecallResult<usize> {
        let mut removed = 0;
        for id in ids {
            if self.delete(*id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// List records (optionally filtered by scope), oldest first.
    async fn list(&self, scope: Option<Scope>) -> RecallResult<Vec<Record>>;

    /// Count records.
    async fn count(&self) -> RecallResult<usize>;

    /// Reclaim space held by superseded versions. No-op for memory stores.
    async fn compact(&self) -> RecallResult<()> {
        Ok(())
    }
}

/// In-memory record store.
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, Record>>,
}

impl InMemoryRecordStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put(&self, record: Record) -> RecallResult<()> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RecallResult<Option<Record>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> RecallResult<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn delete_many(&self, ids: &[Uuid]) -> RecallResult<usize> {
        let mut records = self.records.write().await;
        Ok(ids.iter().filter(|id| records.remove(id).is_some()).count())
    }

    async fn list(&self, scope: Option<Scope>) -> RecallResult<Vec<Record>> {
        let records = self.records.read().await;
        let mut out: Vec<Record> = records
            .values()
            .filter(|r| scope.map_or(true, |s| r.scope == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn count(&self) -> RecallResult<usize> {
        Ok(self.records.read().await.len())
    }
}

/// File-backed record store that persists records as JSONL on disk.
///
/// Loads every record into memory on open. A put appends one line; on load
/// the last line for an id wins, so updates never rewrite the file. Deletes
/// and `compact` rewrite the file from memory.
pub struct FileRecordStore {
    path: PathBuf,
    inner: InMemoryRecordStore,
    /// Serializes file writes so appends never interleave with a rewrite.
    file_lock: Mutex<()>,
}

impl FileRecordStore {
    /// Open the store at `path`, loading existing records.
    pub async fn open(path: impl Into<PathBuf>) -> RecallResult<Self> {
        let path = path.into();
        let inner = InMemoryRecordStore::new();
        if path.exists() {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RecallError::Storage(format!("Failed to read record store: {e}")))?;
            let mut lines = 0usize;
            for line in data.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = serde_json::from_str(line).map_err(|e| {
                    RecallError::Storage(format!("Invalid JSONL record in {}: {}", path.display(), e))
                })?;
                inner.put(record).await?;
                lines += 1;
            }
            debug!(path = %path.display(), lines, live = inner.count().await?, "record store loaded");
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RecallError::Storage(format!("Failed to create dir: {e}")))?;
        }
        Ok(Self {
            path,
            inner,
            file_lock: Mutex::new(()),
        })
    }

    /// Location of the JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_to_file(&self, record: &Record) -> RecallResult<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| RecallError::Storage(format!("Failed to serialize record: {e}")))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RecallError::Storage(format!("Failed to open record store: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RecallError::Storage(format!("Failed to write record: {e}")))?;
        Ok(())
    }

    /// Rewrite the entire file from in-memory records.
    async fn rewrite_file(&self) -> RecallResult<()> {
        let records = self.inner.list(None).await?;
        let mut data = String::new();
        for record in &records {
            let line = serde_json::to_string(record)
                .map_err(|e| RecallError::Storage(format!("Failed to serialize record: {e}")))?;
            data.push_str(&line);
            data.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, data.as_bytes())
            .await
            .map_err(|e| RecallError::Storage(format!("Failed to write record store: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| RecallError::Storage(format!("Failed to replace record store: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn put(&self, record: Record) -> RecallResult<()> {
        let _guard = self.file_lock.lock().await;
        self.append_to_file(&record).await?;
        self.inner.put(record).await
    }

    async fn get(&self, id: Uuid) -> RecallResult<Option<Record>> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: Uuid) -> RecallResult<bool> {
        let _guard = self.file_lock.lock().await;
        let deleted = self.inner.delete(id).await?;
        if deleted {
            self.rewrite_file().await?;
        }
        Ok(deleted)
    }

    async fn delete_many(&self, ids: &[Uuid]) -> RecallResult<usize> {
        let _guard = self.file_lock.lock().await;
        let removed = self.inner.delete_many(ids).await?;
        if removed > 0 {
            self.rewrite_file().await?;
        }
        Ok(removed)
    }

    async fn list(&self, scope: Option<Scope>) -> RecallResult<Vec<Record>> {
        self.inner.list(scope).await
    }

    async fn count(&self) -> RecallResult<usize> {
        self.inner.count().await
    }

    async fn compact(&self) -> RecallResult<()> {
        let _guard = self.file_lock.lock().await;
        self.rewrite_file().await
    }
}
