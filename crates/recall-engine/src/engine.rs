use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use recall_core::{ChunkMetadata, EngineConfig, OwnerId, RecallResult, SessionId};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::{CacheStats, CachedResponse, SemanticCache};
use crate::embedding::{EmbeddingProvider, LocalEmbedding};
use crate::knowledge::{KnowledgeBase, KnowledgeChunk, KnowledgeResults};
use crate::memory::{MemoryFact, MemoryRecall, RecalledFact, SessionMemoryStore};
use crate::records::{FileRecordStore, InMemoryRecordStore, RecordStore};
use crate::vector_index::IndexStats;

/// Durable record stores backing the three collections.
pub struct EngineStorage {
    /// Knowledge chunks.
    pub knowledge: Arc<dyn RecordStore>,
    /// Cached responses.
    pub cache: Arc<dyn RecordStore>,
    /// Session facts.
    pub memory: Arc<dyn RecordStore>,
}

impl EngineStorage {
    /// Volatile stores, for tests and ephemeral deployments.
    pub fn in_memory() -> Self {
        Self {
            knowledge: Arc::new(InMemoryRecordStore::new()),
            cache: Arc::new(InMemoryRecordStore::new()),
            memory: Arc::new(InMemoryRecordStore::new()),
        }
    }

    /// One JSONL file per collection under `dir`.
    pub async fn file(dir: &Path) -> RecallResult<Self> {
        Ok(Self {
            knowledge: Arc::new(FileRecordStore::open(dir.join("knowledge.jsonl")).await?),
            cache: Arc::new(FileRecordStore::open(dir.join("cache.jsonl")).await?),
            memory: Arc::new(FileRecordStore::open(dir.join("memory.jsonl")).await?),
        })
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Cache entries past their TTL.
    pub cache_evicted: usize,
    /// Tombstones dropped from the knowledge index.
    pub knowledge_compacted: usize,
    /// Tombstones dropped from the cache index.
    pub cache_compacted: usize,
    /// Tombstones dropped from the memory index.
    pub memory_compacted: usize,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Stored knowledge chunks.
    pub knowledge_chunks: usize,
    /// Knowledge vector index counters.
    pub knowledge_index: IndexStats,
    /// Cache counters.
    pub cache: CacheStats,
    /// Sessions holding at least one fact.
    pub memory_sessions: usize,
    /// Memory vector index counters.
    pub memory_index: IndexStats,
}

/// Entry point for the surrounding application: knowledge retrieval, the
/// semantic cache and session memory behind one handle.
///
/// Each collection is an owned object with its own indexes; nothing here is
/// process-global, so several engines can coexist (e.g. in tests).
pub struct RetrievalEngine {
    config: EngineConfig,
    knowledge: KnowledgeBase,
    cache: SemanticCache,
    memory: SessionMemoryStore,
}

impl RetrievalEngine {
    /// Opens every collection, rebuilding indexes from `storage`.
    pub async fn open(
        config: EngineConfig,
        storage: EngineStorage,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> RecallResult<Self> {
        config.validate()?;
        let knowledge = KnowledgeBase::open(&config, storage.knowledge, Arc::clone(&embedder)).await?;
        let cache = SemanticCache::open(&config, storage.cache).await?;
        let memory = SessionMemoryStore::open(&config, storage.memory, embedder).await?;
        info!(dimension = config.dimension, cache_scope = ?config.cache.scope, "retrieval engine opened");
        Ok(Self {
            config,
            knowledge,
            cache,
            memory,
        })
    }

    /// In-memory engine with the local hashing embedder.
    pub async fn in_memory(config: EngineConfig) -> RecallResult<Self> {
        let embedder = Arc::new(LocalEmbedding::new(config.dimension));
        Self::open(config, EngineStorage::in_memory(), embedder).await
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- knowledge -------------------------------------------------------

    /// Ingests a chunk for `owner`. Metadata is validated here; unknown keys
    /// are kept as-is.
    pub async fn add_knowledge(
        &self,
        owner: OwnerId,
        text: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> RecallResult<Uuid> {
        let metadata = ChunkMetadata::from_map(metadata)?;
        self.knowledge.add(owner, text, metadata).await
    }

    /// Hybrid query with a caller-supplied vector. `None` ranks by keyword
    /// alone and tags the result as degraded.
    pub async fn query_knowledge(
        &self,
        owner: OwnerId,
        query_text: &str,
        query_vector: Option<&[f32]>,
        top_k: usize,
    ) -> RecallResult<KnowledgeResults> {
        self.knowledge.query(owner, query_text, query_vector, top_k).await
    }

    /// Hybrid query; the engine embeds the query text itself.
    pub async fn query_knowledge_text(
        &self,
        owner: OwnerId,
        query_text: &str,
        top_k: usize,
    ) -> RecallResult<KnowledgeResults> {
        self.knowledge.query_text(owner, query_text, top_k).await
    }

    /// Fetches one chunk; `OwnerMismatch` if it belongs to someone else.
    pub async fn get_chunk(&self, owner: OwnerId, id: Uuid) -> RecallResult<KnowledgeChunk> {
        self.knowledge.get_chunk(owner, id).await
    }

    /// Deletes one chunk, enforcing ownership.
    pub async fn delete_chunk(&self, owner: OwnerId, id: Uuid) -> RecallResult<()> {
        self.knowledge.delete_chunk(owner, id).await
    }

    /// Cascading removal when an owner account goes away.
    pub async fn delete_owner(&self, owner: OwnerId) -> RecallResult<usize> {
        self.knowledge.delete_owner(owner).await
    }

    // --- cache -----------------------------------------------------------

    /// Nearest cached response above the similarity threshold, if any.
    ///
    /// `None` makes the caller the one producing the response: until it calls
    /// [`cache_record`](Self::cache_record) for the same query (or the fill
    /// timeout passes), concurrent lookups for that query wait for it.
    pub async fn cache_lookup(&self, query_text: &str, query_vector: &[f32]) -> RecallResult<Option<String>> {
        let hit = self.cache.lookup_and_claim(None, query_text, query_vector).await?;
        Ok(hit.map(|hit| hit.response))
    }

    /// Stores a response produced upstream after a miss and releases callers
    /// waiting on it.
    pub async fn cache_record(&self, query_text: &str, query_vector: &[f32], response: &str) -> RecallResult<()> {
        self.cache.record(query_text, query_vector, response).await.map(|_| ())
    }

    /// Cached response, or `fill` run once across concurrent callers.
    pub async fn cache_get_or_fill<F, Fut>(
        &self,
        owner: Option<OwnerId>,
        query_text: &str,
        query_vector: &[f32],
        fill: F,
    ) -> RecallResult<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecallResult<String>>,
    {
        self.cache.get_or_fill(owner, query_text, query_vector, fill).await
    }

    /// Direct access to the cache for ticket-based lookups.
    pub fn cache(&self) -> &SemanticCache {
        &self.cache
    }

    // --- memory ----------------------------------------------------------

    /// Stores the fact for `(session, topic)`, replacing any previous one.
    pub async fn memory_upsert(
        &self,
        session: SessionId,
        topic: &str,
        content: &str,
        source_message: &str,
    ) -> RecallResult<MemoryFact> {
        self.memory.upsert(session, topic, content, source_message).await
    }

    /// Every fact of a session, by topic.
    pub fn memory_list(&self, session: SessionId) -> Vec<MemoryFact> {
        self.memory.list(session)
    }

    /// The current fact for one topic.
    pub fn memory_get(&self, session: SessionId, topic: &str) -> RecallResult<MemoryFact> {
        self.memory.get(session, topic)
    }

    /// Facts of one session nearest to `query_vector`, best first.
    pub async fn memory_recall(
        &self,
        session: SessionId,
        query_vector: &[f32],
        top_k: usize,
    ) -> RecallResult<Vec<RecalledFact>> {
        self.memory.recall(session, query_vector, top_k).await
    }

    /// Recall by text; falls back to keyword overlap if embedding fails.
    pub async fn memory_recall_text(
        &self,
        session: SessionId,
        query_text: &str,
        top_k: usize,
    ) -> RecallResult<MemoryRecall> {
        self.memory.recall_text(session, query_text, top_k).await
    }

    /// Drops every fact of a session. Returns how many were removed.
    pub async fn memory_delete_session(&self, session: SessionId) -> RecallResult<usize> {
        self.memory.delete_session(session).await
    }

    // --- lifecycle -------------------------------------------------------

    /// Re-embeds chunks and facts written while the provider was down.
    /// Returns `(chunks, facts)` repaired.
    pub async fn backfill(&self) -> RecallResult<(usize, usize)> {
        let chunks = self.knowledge.backfill_embeddings().await?;
        let facts = self.memory.backfill_stale().await?;
        Ok((chunks, facts))
    }

    /// Rebuilds every index from durable records.
    pub async fn rebuild(&self) -> RecallResult<()> {
        self.knowledge.rebuild().await?;
        self.cache.rebuild().await?;
        self.memory.rebuild().await?;
        Ok(())
    }

    /// Compacts every record store.
    pub async fn flush(&self) -> RecallResult<()> {
        self.knowledge.flush().await?;
        self.cache.flush().await?;
        self.memory.flush().await
    }

    /// One maintenance pass: expire cache entries, then compact any vector
    /// index whose tombstone share is over the configured ratio.
    pub async fn maintain(&self) -> RecallResult<MaintenanceReport> {
        let ratio = self.config.index.compaction_tombstone_ratio;
        Ok(MaintenanceReport {
            cache_evicted: self.cache.evict_expired().await?,
            knowledge_compacted: self.knowledge.compact_if_needed(ratio)?,
            cache_compacted: self.cache.compact_if_needed(ratio)?,
            memory_compacted: self.memory.compact_if_needed(ratio)?,
        })
    }

    /// Runs [`maintain`](Self::maintain) every `maintenance_interval_secs`
    /// until the engine is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_maintenance_every(Duration::from_secs(self.config.maintenance_interval_secs))
    }

    /// [`spawn_maintenance`](Self::spawn_maintenance) with an explicit period.
    pub fn spawn_maintenance_every(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.maintain().await {
                    Ok(report) if report != MaintenanceReport::default() => {
                        info!(?report, "maintenance pass");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "maintenance pass failed"),
                }
            }
        })
    }

    /// Counters across all three collections.
    pub async fn stats(&self) -> RecallResult<EngineStats> {
        Ok(EngineStats {
            knowledge_chunks: self.knowledge.len().await?,
            knowledge_index: self.knowledge.index_stats(),
            cache: self.cache.stats(),
            memory_sessions: self.memory.session_count(),
            memory_index: self.memory.index_stats(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.dimension = 0;
        assert!(RetrievalEngine::in_memory(config).await.is_err());
    }

    #[tokio::test]
    async fn test_maintenance_expires_and_compacts() {
        let mut config = EngineConfig::default();
        config.dimension = 3;
        config.cache.ttl_secs = 0;
        let engine = RetrievalEngine::in_memory(config).await.unwrap();
        engine.cache_record("q", &[1.0, 0.0, 0.0], "a").await.unwrap();

        let report = engine.maintain().await.unwrap();
        assert_eq!(report.cache_evicted, 1);
        assert_eq!(report.cache_compacted, 1);
        assert_eq!(engine.stats().await.unwrap().cache.entries, 0);
    }

    #[tokio::test]
    async fn test_spawned_maintenance_stops_with_engine() {
        let engine = Arc::new(RetrievalEngine::in_memory(EngineConfig::default()).await.unwrap());
        let handle = engine.spawn_maintenance_every(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        drop(engine);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_follows_configured_interval() {
        let mut config = EngineConfig::default();
        config.dimension = 3;
        config.cache.ttl_secs = 0;
        config.maintenance_interval_secs = 1;
        let engine = Arc::new(RetrievalEngine::in_memory(config).await.unwrap());
        let handle = engine.spawn_maintenance();

        engine.cache_record("q", &[1.0, 0.0, 0.0], "a").await.unwrap();
        assert_eq!(engine.stats().await.unwrap().cache.entries, 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(engine.stats().await.unwrap().cache.entries, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        let chunk = {
            let storage = EngineStorage::file(dir.path()).await.unwrap();
            let engine = RetrievalEngine::open(EngineConfig::default(), storage, Arc::new(LocalEmbedding::default()))
                .await
                .unwrap();
            engine.memory_upsert(session, "salary", "Expects $120k", "m").await.unwrap();
            engine.add_knowledge(OwnerId(1), "parental leave is 16 weeks", HashMap::new()).await.unwrap()
        };

        let storage = EngineStorage::file(dir.path()).await.unwrap();
        let engine = RetrievalEngine::open(EngineConfig::default(), storage, Arc::new(LocalEmbedding::default()))
            .await
            .unwrap();
        assert_eq!(engine.get_chunk(OwnerId(1), chunk).await.unwrap().text, "parental leave is 16 weeks");
        assert_eq!(engine.memory_list(session).len(), 1);
    }
}
