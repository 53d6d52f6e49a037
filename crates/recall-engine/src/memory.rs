//! Per-session fact memory.
//!
//! At most one fact exists per `(session, topic)`. Writing a topic again
//! replaces the fact in place: same id, new content and embedding.
//!
//! Sessions are independent shards. Writers in one session serialize on that
//! session's write lock only, and readers never wait on a writer's I/O: the
//! new fact is prepared and persisted first, then swapped into the shard.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_core::{EngineConfig, MemoryConfig, RecallError, RecallResult, Scope, SessionId, Topic};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::embedding::{EmbedRequest, EmbeddingProvider};
use crate::ranker::RankingMode;
use crate::records::{Record, RecordStore};
use crate::text_index::tokenize;
use crate::vector_index::{CandidateFilter, IndexStats, Neighbor, VectorIndex, VectorIndexConfig};

const TOPIC_KEY: &str = "topic";
const SOURCE_KEY: &str = "source_message";
const STALE_KEY: &str = "embedding_stale";

/// One fact established in a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryFact {
    /// Stable across replacements of the same topic.
    pub id: Uuid,
    /// Session the fact belongs to.
    pub session_id: SessionId,
    /// Normalized topic key.
    pub topic: Topic,
    /// The fact itself.
    pub content: String,
    /// The message the fact was extracted from.
    pub source_message: String,
    /// Embedding of `content`, if one was ever computed.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// The embedding does not reflect `content` (provider was unavailable on
    /// the last write). Cleared by [`SessionMemoryStore::backfill_stale`].
    pub embedding_stale: bool,
    /// When the topic was first written.
    pub created_at: DateTime<Utc>,
    /// When the fact was last replaced.
    pub updated_at: DateTime<Utc>,
}

impl MemoryFact {
    fn to_record(&self) -> Record {
        let mut metadata = BTreeMap::new();
        metadata.insert(TOPIC_KEY.to_string(), serde_json::Value::String(self.topic.to_string()));
        metadata.insert(SOURCE_KEY.to_string(), serde_json::Value::String(self.source_message.clone()));
        metadata.insert(STALE_KEY.to_string(), serde_json::Value::Bool(self.embedding_stale));
        Record {
            id: self.id,
            scope: Scope::Session(self.session_id),
            text: self.content.clone(),
            metadata,
            vector: self.embedding.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn from_record(record: Record, max_topic_len: usize) -> RecallResult<Self> {
        let Scope::Session(session_id) = record.scope else {
            return Err(RecallError::Storage(format!(
                "memory record {} has non-session scope {}",
                record.id, record.scope
            )));
        };
        let topic = Topic::parse(record.meta_str(TOPIC_KEY).unwrap_or_default(), max_topic_len)?;
        Ok(Self {
            id: record.id,
            session_id,
            topic,
            source_message: record.meta_str(SOURCE_KEY).unwrap_or_default().to_string(),
            embedding_stale: record.meta_flag(STALE_KEY),
            content: record.text,
            embedding: record.vector,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// A recalled fact with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecalledFact {
    /// The matching fact.
    pub fact: MemoryFact,
    /// Cosine similarity, or shared-term count in keyword-only mode.
    pub score: f32,
}

/// Result of [`SessionMemoryStore::recall_text`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecall {
    /// `KeywordOnly` when the query could not be embedded.
    pub mode: RankingMode,
    /// Best first.
    pub facts: Vec<RecalledFact>,
}

#[derive(Default)]
struct SessionShard {
    facts: parking_lot::RwLock<BTreeMap<Topic, MemoryFact>>,
    /// Serializes writers within this session.
    write_lock: tokio::sync::Mutex<()>,
}

/// Session memory collection.
pub struct SessionMemoryStore {
    config: MemoryConfig,
    dimension: usize,
    embed_timeout: Duration,
    records: Arc<dyn RecordStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: VectorIndex,
    sessions: parking_lot::RwLock<HashMap<SessionId, Arc<SessionShard>>>,
    lifecycle: tokio::sync::RwLock<()>,
}

impl SessionMemoryStore {
    /// Opens the store and rebuilds shards and the vector index from records.
    pub async fn open(
        config: &EngineConfig,
        records: Arc<dyn RecordStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> RecallResult<Self> {
        RecallError::check_dimension(config.dimension, embedder.dimension())?;
        let store = Self {
            config: config.memory.clone(),
            dimension: config.dimension,
            embed_timeout: config.embedding_timeout(),
            records,
            embedder,
            vectors: VectorIndex::new(
                VectorIndexConfig::from_engine(config).with_ef_search(config.memory.ef_search),
            ),
            sessions: parking_lot::RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::RwLock::new(()),
        };
        store.rebuild().await?;
        Ok(store)
    }

    /// Discards shards and the vector index and reloads them from records.
    pub async fn rebuild(&self) -> RecallResult<usize> {
        let _guard = self.lifecycle.write().await;
        let records = self.records.list(None).await?;

        let mut latest: HashMap<(SessionId, Topic), MemoryFact> = HashMap::new();
        let mut superseded = Vec::new();
        for record in records {
            let fact = match MemoryFact::from_record(record, self.config.max_topic_len) {
                Ok(fact) => fact,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable memory record");
                    continue;
                }
            };
            let key = (fact.session_id, fact.topic.clone());
            match latest.get(&key) {
                Some(existing) if existing.updated_at >= fact.updated_at => superseded.push(fact.id),
                Some(existing) => {
                    superseded.push(existing.id);
                    latest.insert(key, fact);
                }
                None => {
                    latest.insert(key, fact);
                }
            }
        }
        if !superseded.is_empty() {
            warn!(count = superseded.len(), "dropping duplicate facts for the same topic");
            self.records.delete_many(&superseded).await?;
        }

        self.vectors.clear();
        let mut sessions: HashMap<SessionId, Arc<SessionShard>> = HashMap::new();
        let count = latest.len();
        for ((session, topic), fact) in latest {
            if let Some(v) = fact.embedding.as_ref().filter(|v| v.len() == self.dimension) {
                self.vectors.insert(fact.id, Scope::Session(session), v)?;
            }
            let shard = sessions.entry(session).or_default();
            shard.facts.write().insert(topic, fact);
        }
        *self.sessions.write() = sessions;
        info!(facts = count, "session memory loaded");
        Ok(count)
    }

    /// Compacts the record store.
    pub async fn flush(&self) -> RecallResult<()> {
        self.records.compact().await
    }

    /// Inserts or replaces the fact for `(session, topic)`.
    ///
    /// The embedding is recomputed from `content`. If that fails the fact is
    /// still written: a replaced fact keeps its previous embedding, a new one
    /// has none, and both are flagged `embedding_stale`.
    pub async fn upsert(
        &self,
        session: SessionId,
        topic: &str,
        content: &str,
        source_message: &str,
    ) -> RecallResult<MemoryFact> {
        let topic = Topic::parse(topic, self.config.max_topic_len)?;
        if content.trim().is_empty() {
            return Err(RecallError::InvalidInput("fact content is empty".into()));
        }

        let embedding = match EmbedRequest::new(content, self.embed_timeout)
            .send(self.embedder.as_ref())
            .await
        {
            Ok(v) => Some(v),
            Err(e) if e.is_degradable() => {
                warn!(session = %session, topic = %topic, error = %e, "embedding unavailable; fact flagged stale");
                None
            }
            Err(e) => return Err(e),
        };

        let _lifecycle = self.lifecycle.read().await;
        let shard = self.shard(session);
        let _writer = shard.write_lock.lock().await;

        let previous = shard.facts.read().get(&topic).cloned();
        let now = Utc::now();
        let stale = embedding.is_none();
        let fact = match previous {
            Some(prev) => MemoryFact {
                content: content.to_string(),
                source_message: source_message.to_string(),
                embedding: embedding.clone().or(prev.embedding.clone()),
                embedding_stale: stale,
                updated_at: now,
                ..prev
            },
            None => MemoryFact {
                id: Uuid::new_v4(),
                session_id: session,
                topic: topic.clone(),
                content: content.to_string(),
                source_message: source_message.to_string(),
                embedding: embedding.clone(),
                embedding_stale: stale,
                created_at: now,
                updated_at: now,
            },
        };

        self.records.put(fact.to_record()).await?;
        if let Some(v) = &embedding {
            self.vectors.upsert(fact.id, Scope::Session(session), v)?;
        }
        shard.facts.write().insert(topic, fact.clone());
        debug!(session = %session, topic = %fact.topic, id = %fact.id, stale, "memory fact upserted");
        Ok(fact)
    }

    /// All facts of a session, ordered by topic.
    pub fn list(&self, session: SessionId) -> Vec<MemoryFact> {
        self.sessions
            .read()
            .get(&session)
            .map(|shard| shard.facts.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// The fact for `(session, topic)`.
    pub fn get(&self, session: SessionId, topic: &str) -> RecallResult<MemoryFact> {
        let topic = Topic::parse(topic, self.config.max_topic_len)?;
        self.sessions
            .read()
            .get(&session)
            .and_then(|shard| shard.facts.read().get(&topic).cloned())
            .ok_or_else(|| RecallError::NotFound(format!("fact '{topic}' in session {session}")))
    }

    /// Vector recall restricted to one session.
    pub async fn recall(&self, session: SessionId, query_vector: &[f32], top_k: usize) -> RecallResult<Vec<RecalledFact>> {
        RecallError::check_dimension(self.dimension, query_vector.len())?;
        let neighbors = self.search(session, query_vector, top_k).await?;

        let Some(shard) = self.sessions.read().get(&session).cloned() else {
            return Ok(Vec::new());
        };
        let facts = shard.facts.read();
        let by_id: HashMap<Uuid, &MemoryFact> = facts.values().map(|f| (f.id, f)).collect();
        let mut out = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match by_id.get(&neighbor.id) {
                Some(fact) if fact.session_id == session => out.push(RecalledFact {
                    fact: (*fact).clone(),
                    score: neighbor.score,
                }),
                Some(fact) => {
                    error!(requested = %session, actual = %fact.session_id, "memory index crossed sessions");
                }
                // Replaced or deleted since the search.
                None => {}
            }
        }
        Ok(out)
    }

    /// Embeds `query_text` and recalls; falls back to keyword overlap when
    /// the provider is unavailable.
    pub async fn recall_text(&self, session: SessionId, query_text: &str, top_k: usize) -> RecallResult<MemoryRecall> {
        match EmbedRequest::new(query_text, self.embed_timeout)
            .send(self.embedder.as_ref())
            .await
        {
            Ok(vector) => Ok(MemoryRecall {
                mode: RankingMode::Hybrid,
                facts: self.recall(session, &vector, top_k).await?,
            }),
            Err(e) if e.is_degradable() => {
                warn!(session = %session, error = %e, "embedding unavailable; keyword recall");
                Ok(MemoryRecall {
                    mode: RankingMode::KeywordOnly,
                    facts: self.keyword_recall(session, query_text, top_k),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Removes every fact of a session. Returns how many were deleted.
    pub async fn delete_session(&self, session: SessionId) -> RecallResult<usize> {
        let _lifecycle = self.lifecycle.read().await;
        let Some(shard) = self.sessions.write().remove(&session) else {
            return Ok(0);
        };
        let _writer = shard.write_lock.lock().await;
        let ids: Vec<Uuid> = shard.facts.read().values().map(|f| f.id).collect();
        for id in &ids {
            self.vectors.remove(*id);
        }
        self.records.delete_many(&ids).await?;
        info!(session = %session, removed = ids.len(), "session memory deleted");
        Ok(ids.len())
    }

    /// Re-embeds facts flagged `embedding_stale`. Stops at the first provider
    /// failure; returns how many facts were repaired.
    pub async fn backfill_stale(&self) -> RecallResult<usize> {
        let shards: Vec<(SessionId, Arc<SessionShard>)> =
            self.sessions.read().iter().map(|(s, shard)| (*s, Arc::clone(shard))).collect();

        let mut repaired = 0;
        for (session, shard) in shards {
            let stale: Vec<MemoryFact> = shard
                .facts
                .read()
                .values()
                .filter(|f| f.embedding_stale)
                .cloned()
                .collect();
            for fact in stale {
                let vector = match EmbedRequest::new(&fact.content, self.embed_timeout)
                    .send(self.embedder.as_ref())
                    .await
                {
                    Ok(v) => v,
                    Err(e) if e.is_degradable() => {
                        warn!(error = %e, repaired, "memory backfill interrupted");
                        return Ok(repaired);
                    }
                    Err(e) => return Err(e),
                };

                let _writer = shard.write_lock.lock().await;
                let current = shard.facts.read().get(&fact.topic).cloned();
                // Rewritten since we read it; the newer write owns the embedding.
                let Some(current) = current.filter(|c| c.updated_at == fact.updated_at) else {
                    continue;
                };
                let fixed = MemoryFact {
                    embedding: Some(vector.clone()),
                    embedding_stale: false,
                    ..current
                };
                self.records.put(fixed.to_record()).await?;
                self.vectors.upsert(fixed.id, Scope::Session(session), &vector)?;
                shard.facts.write().insert(fixed.topic.clone(), fixed);
                repaired += 1;
            }
        }
        if repaired > 0 {
            info!(repaired, "stale memory embeddings backfilled");
        }
        Ok(repaired)
    }

    /// Number of sessions with at least one fact.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Vector index counters.
    pub fn index_stats(&self) -> IndexStats {
        self.vectors.stats()
    }

    /// Compacts the vector index if its tombstone share exceeds `ratio`.
    pub fn compact_if_needed(&self, ratio: f32) -> RecallResult<usize> {
        if self.vectors.stats().tombstone_ratio() > ratio {
            self.vectors.compact()
        } else {
            Ok(0)
        }
    }

    fn shard(&self, session: SessionId) -> Arc<SessionShard> {
        if let Some(shard) = self.sessions.read().get(&session) {
            return Arc::clone(shard);
        }
        Arc::clone(self.sessions.write().entry(session).or_default())
    }

    async fn search(&self, session: SessionId, query_vector: &[f32], top_k: usize) -> RecallResult<Vec<Neighbor>> {
        let filter = CandidateFilter::Scope(Scope::Session(session));
        let ef = self.config.ef_search;
        match self.vectors.search(query_vector, top_k, ef, Some(&filter)) {
            Err(RecallError::IndexCorrupted(reason)) => {
                error!(reason = %reason, "memory vector index corrupted; rebuilding from records");
                self.rebuild().await?;
                self.vectors.search(query_vector, top_k, ef, Some(&filter))
            }
            other => other,
        }
    }

    fn keyword_recall(&self, session: SessionId, query_text: &str, top_k: usize) -> Vec<RecalledFact> {
        let query: BTreeSet<String> = tokenize(query_text).into_iter().collect();
        if query.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<RecalledFact> = self
            .list(session)
            .into_iter()
            .filter_map(|fact| {
                let terms: BTreeSet<String> = tokenize(&fact.content)
                    .into_iter()
                    .chain(tokenize(fact.topic.as_str()))
                    .collect();
                let shared = terms.intersection(&query).count();
                (shared > 0).then(|| RecalledFact {
                    fact,
                    score: shared as f32,
                })
            })
            .collect();
        // `list` is topic-ordered and the sort is stable.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        scored
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::embedding::LocalEmbedding;
    use crate::records::InMemoryRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Local embedder that can be switched off.
    struct Switchable {
        inner: LocalEmbedding,
        down: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for Switchable {
        async fn embed(&self, text: &str) -> RecallResult<Vec<f32>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(RecallError::EmbeddingUnavailable("rate limited".into()));
            }
            self.inner.embed(text).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    fn switchable() -> Arc<Switchable> {
        Arc::new(Switchable {
            inner: LocalEmbedding::default(),
            down: AtomicBool::new(false),
        })
    }

    async fn open(embedder: Arc<dyn EmbeddingProvider>, records: Arc<dyn RecordStore>) -> SessionMemoryStore {
        SessionMemoryStore::open(&EngineConfig::default(), records, embedder).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let store = open(Arc::new(LocalEmbedding::default()), Arc::new(InMemoryRecordStore::new())).await;
        let s1 = Uuid::new_v4();
        let first = store.upsert(s1, "salary", "Expects $120k", "...120k...").await.unwrap();
        let second = store.upsert(s1, "Salary ", "Expects $130k", "...130k...").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        let facts = store.list(s1);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "Expects $130k");
        assert_eq!(store.index_stats().live, 1);
    }

    #[tokio::test]
    async fn test_list_orders_by_topic() {
        let store = open(Arc::new(LocalEmbedding::default()), Arc::new(InMemoryRecordStore::new())).await;
        let s = Uuid::new_v4();
        for (topic, content) in [("salary", "120k"), ("location", "Berlin"), ("notice", "two weeks")] {
            store.upsert(s, topic, content, content).await.unwrap();
        }
        let topics: Vec<String> = store.list(s).iter().map(|f| f.topic.to_string()).collect();
        assert_eq!(topics, ["location", "notice", "salary"]);
    }

    #[tokio::test]
    async fn test_recall_stays_in_session() {
        let store = open(Arc::new(LocalEmbedding::default()), Arc::new(InMemoryRecordStore::new())).await;
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        store.upsert(s1, "location", "relocating to Berlin", "msg").await.unwrap();
        store.upsert(s2, "location", "relocating to Berlin", "msg").await.unwrap();
        store.upsert(s2, "salary", "expects 130k", "msg").await.unwrap();

        let recalled = store.recall_text(s1, "relocating to Berlin", 10).await.unwrap();
        assert_eq!(recalled.mode, RankingMode::Hybrid);
        assert_eq!(recalled.facts.len(), 1);
        assert!(recalled.facts.iter().all(|r| r.fact.session_id == s1));
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_stale_fact() {
        let embedder = switchable();
        let store = open(embedder.clone(), Arc::new(InMemoryRecordStore::new())).await;
        let s = Uuid::new_v4();
        let original = store.upsert(s, "salary", "Expects $120k", "m1").await.unwrap();
        assert!(!original.embedding_stale);

        embedder.down.store(true, Ordering::SeqCst);
        let updated = store.upsert(s, "salary", "Expects $130k", "m2").await.unwrap();
        assert!(updated.embedding_stale);
        assert_eq!(updated.content, "Expects $130k");
        assert_eq!(updated.embedding, original.embedding);

        let fresh = store.upsert(s, "location", "Lisbon", "m3").await.unwrap();
        assert!(fresh.embedding_stale);
        assert!(fresh.embedding.is_none());

        let recall = store.recall_text(s, "Lisbon", 5).await.unwrap();
        assert_eq!(recall.mode, RankingMode::KeywordOnly);
        assert_eq!(recall.facts[0].fact.topic.as_str(), "location");

        assert_eq!(store.backfill_stale().await.unwrap(), 0);
        embedder.down.store(false, Ordering::SeqCst);
        assert_eq!(store.backfill_stale().await.unwrap(), 2);
        assert!(store.list(s).iter().all(|f| !f.embedding_stale));
        assert_eq!(store.recall_text(s, "Lisbon", 1).await.unwrap().facts[0].fact.topic.as_str(), "location");
    }

    #[tokio::test]
    async fn test_get_and_delete_session() {
        let store = open(Arc::new(LocalEmbedding::default()), Arc::new(InMemoryRecordStore::new())).await;
        let s = Uuid::new_v4();
        store.upsert(s, "notice", "two weeks", "m").await.unwrap();
        assert_eq!(store.get(s, "NOTICE").unwrap().content, "two weeks");
        assert!(matches!(store.get(s, "salary"), Err(RecallError::NotFound(_))));
        assert!(matches!(store.get(s, "bad topic!"), Err(RecallError::InvalidInput(_))));

        assert_eq!(store.delete_session(s).await.unwrap(), 1);
        assert!(store.list(s).is_empty());
        assert_eq!(store.delete_session(s).await.unwrap(), 0);
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_reopen_restores_facts() {
        let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let s = Uuid::new_v4();
        {
            let store = open(Arc::new(LocalEmbedding::default()), Arc::clone(&records)).await;
            store.upsert(s, "salary", "Expects $120k", "m1").await.unwrap();
            store.upsert(s, "salary", "Expects $130k", "m2").await.unwrap();
        }
        let store = open(Arc::new(LocalEmbedding::default()), records).await;
        let facts = store.list(s);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "Expects $130k");
        assert_eq!(facts[0].source_message, "m2");
        assert_eq!(store.recall_text(s, "salary expectations", 3).await.unwrap().facts.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_one_fact_per_topic() {
        let store = Arc::new(open(Arc::new(LocalEmbedding::default()), Arc::new(InMemoryRecordStore::new())).await);
        let s = Uuid::new_v4();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.upsert(s, "salary", &format!("Expects ${}k", 100 + i), "m").await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.list(s).len(), 1);
        assert_eq!(store.index_stats().live, 1);
    }
}
