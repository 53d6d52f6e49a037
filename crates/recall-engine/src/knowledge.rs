//! Tenant-scoped knowledge base with hybrid (vector + keyword) retrieval.
//!
//! Every chunk belongs to exactly one owner. Both retrieval channels are
//! restricted to the requesting owner while they search, so a query can
//! never surface another tenant's chunk.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_core::{ChunkMetadata, EngineConfig, KnowledgeConfig, OwnerId, RecallError, RecallResult, Scope};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::embedding::{EmbedRequest, EmbeddingProvider};
use crate::ranker::{fuse, FusionWeights, RankingMode};
use crate::records::{Record, RecordStore};
use crate::text_index::TextIndex;
use crate::vector_index::{CandidateFilter, IndexStats, Neighbor, VectorIndex, VectorIndexConfig};

/// A stored knowledge chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeChunk {
    /// Chunk id.
    pub id: Uuid,
    /// Tenant that ingested the chunk.
    pub owner: OwnerId,
    /// Chunk text.
    pub text: String,
    /// Validated metadata.
    pub metadata: ChunkMetadata,
    /// Whether the chunk has a vector. Chunks ingested while the embedding
    /// provider was down are keyword-searchable only until backfilled.
    pub embedded: bool,
    /// Ingestion time.
    pub created_at: DateTime<Utc>,
}

impl KnowledgeChunk {
    fn from_record(record: Record) -> RecallResult<Self> {
        let Scope::Owner(owner) = record.scope else {
            return Err(RecallError::Storage(format!(
                "knowledge record {} has non-owner scope {}",
                record.id, record.scope
            )));
        };
        let metadata: ChunkMetadata =
            serde_json::from_value(serde_json::Value::Object(record.metadata.into_iter().collect()))?;
        Ok(Self {
            id: record.id,
            owner,
            text: record.text,
            metadata,
            embedded: record.vector.is_some(),
            created_at: record.created_at,
        })
    }
}

/// A ranked chunk with its fused and per-channel scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    /// The chunk.
    pub chunk: KnowledgeChunk,
    /// Weighted sum of the normalized channel scores.
    pub score: f32,
    /// Normalized vector score, if the chunk was a vector candidate.
    pub vector_score: Option<f32>,
    /// Normalized BM25 score, if the chunk was a keyword candidate.
    pub text_score: Option<f32>,
}

/// Result of a knowledge query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeResults {
    /// `KeywordOnly` when no query vector was available.
    pub mode: RankingMode,
    /// Best first, ties by id.
    pub chunks: Vec<ScoredChunk>,
}

impl KnowledgeResults {
    /// Whether the results were ranked by keyword score alone.
    pub fn is_degraded(&self) -> bool {
        self.mode == RankingMode::KeywordOnly
    }

    /// Chunk ids in rank order.
    pub fn ids(&self) -> Vec<Uuid> {
        self.chunks.iter().map(|c| c.chunk.id).collect()
    }
}

/// Knowledge collection: durable records plus derived vector and text indexes.
pub struct KnowledgeBase {
    config: KnowledgeConfig,
    dimension: usize,
    embed_timeout: Duration,
    records: Arc<dyn RecordStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: VectorIndex,
    text: parking_lot::RwLock<TextIndex>,
    /// chunk id -> owner, for filtering the text channel.
    owners: parking_lot::RwLock<HashMap<Uuid, OwnerId>>,
    /// Writers share it; `rebuild` takes it exclusively.
    lifecycle: tokio::sync::RwLock<()>,
}

impl KnowledgeBase {
    /// Opens the collection and builds its indexes from `records`.
    pub async fn open(
        config: &EngineConfig,
        records: Arc<dyn RecordStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> RecallResult<Self> {
        RecallError::check_dimension(config.dimension, embedder.dimension())?;
        let kb = Self {
            config: config.knowledge.clone(),
            dimension: config.dimension,
            embed_timeout: config.embedding_timeout(),
            records,
            embedder,
            vectors: VectorIndex::new(
                VectorIndexConfig::from_engine(config).with_ef_search(config.knowledge.ef_search),
            ),
            text: parking_lot::RwLock::new(TextIndex::new()),
            owners: parking_lot::RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::RwLock::new(()),
        };
        kb.rebuild().await?;
        Ok(kb)
    }

    /// Discards both indexes and rebuilds them from the record store.
    pub async fn rebuild(&self) -> RecallResult<usize> {
        let _guard = self.lifecycle.write().await;
        let records = self.records.list(None).await?;

        self.vectors.clear();
        let mut text = TextIndex::new();
        let mut owners = HashMap::new();
        let mut without_vector = 0usize;
        for record in &records {
            let Scope::Owner(owner) = record.scope else {
                warn!(id = %record.id, scope = %record.scope, "skipping knowledge record without owner");
                continue;
            };
            text.index(record.id, &record.text);
            owners.insert(record.id, owner);
            match &record.vector {
                Some(v) if v.len() == self.dimension => {
                    self.vectors.insert(record.id, record.scope, v)?;
                }
                Some(v) => {
                    warn!(id = %record.id, len = v.len(), expected = self.dimension, "stored vector has wrong dimension; needs backfill");
                    without_vector += 1;
                }
                None => without_vector += 1,
            }
        }
        *self.text.write() = text;
        *self.owners.write() = owners;

        info!(chunks = records.len(), without_vector, "knowledge base indexes rebuilt");
        Ok(records.len())
    }

    /// Compacts the record store.
    pub async fn flush(&self) -> RecallResult<()> {
        self.records.compact().await
    }

    /// Ingests a chunk, computing its embedding. If the provider is
    /// unavailable the chunk is stored without a vector and is searchable by
    /// keyword until [`backfill_embeddings`](Self::backfill_embeddings).
    pub async fn add(&self, owner: OwnerId, text: &str, metadata: ChunkMetadata) -> RecallResult<Uuid> {
        if text.trim().is_empty() {
            return Err(RecallError::InvalidInput("chunk text is empty".into()));
        }
        let vector = match EmbedRequest::new(text, self.embed_timeout).send(self.embedder.as_ref()).await {
            Ok(v) => Some(v),
            Err(e) if e.is_degradable() => {
                warn!(owner = %owner, error = %e, "embedding unavailable; chunk indexed for keywords only");
                None
            }
            Err(e) => return Err(e),
        };
        self.add_with_vector(owner, text, metadata, vector).await
    }

    /// Ingests a chunk with a caller-supplied vector (or none).
    pub async fn add_with_vector(
        &self,
        owner: OwnerId,
        text: &str,
        metadata: ChunkMetadata,
        vector: Option<Vec<f32>>,
    ) -> RecallResult<Uuid> {
        if text.trim().is_empty() {
            return Err(RecallError::InvalidInput("chunk text is empty".into()));
        }
        if let Some(v) = &vector {
            RecallError::check_dimension(self.dimension, v.len())?;
        }

        let _guard = self.lifecycle.read().await;
        let id = Uuid::new_v4();
        let scope = Scope::Owner(owner);
        let record = Record::new(id, scope, text)
            .with_metadata(metadata.to_map().into_iter().collect())
            .with_vector(vector);
        self.records.put(record.clone()).await?;

        self.owners.write().insert(id, owner);
        self.text.write().index(id, text);
        if let Some(v) = &record.vector {
            self.vectors.insert(id, scope, v)?;
        }
        debug!(id = %id, owner = %owner, embedded = record.vector.is_some(), "knowledge chunk added");
        Ok(id)
    }

    /// Hybrid query for one owner.
    ///
    /// With `query_vector = None` the result is ranked by keyword score alone
    /// and tagged [`RankingMode::KeywordOnly`]. A corrupted vector index is
    /// rebuilt from records once and the query retried.
    pub async fn query(
        &self,
        owner: OwnerId,
        query_text: &str,
        query_vector: Option<&[f32]>,
        top_k: usize,
    ) -> RecallResult<KnowledgeResults> {
        if let Some(v) = query_vector {
            RecallError::check_dimension(self.dimension, v.len())?;
        }
        if top_k == 0 {
            return Ok(KnowledgeResults {
                mode: if query_vector.is_some() { RankingMode::Hybrid } else { RankingMode::KeywordOnly },
                chunks: Vec::new(),
            });
        }
        let candidates = top_k.saturating_mul(self.config.candidate_multiplier);

        let text_results = {
            let owners = self.owners.read();
            self.text
                .read()
                .search_filtered(query_text, candidates, |id| owners.get(&id) == Some(&owner))
        };

        let vector_results = match query_vector {
            Some(v) => Some(self.search_vectors(owner, v, candidates).await?),
            None => None,
        };
        let vector_pairs: Option<Vec<(Uuid, f32)>> =
            vector_results.map(|hits| hits.into_iter().map(|n| (n.id, n.score)).collect());

        let ranking = fuse(
            vector_pairs.as_deref(),
            &text_results,
            FusionWeights {
                vector: self.config.vector_weight,
                text: self.config.text_weight,
            },
        );

        let mut chunks = Vec::with_capacity(top_k);
        for hit in ranking.hits {
            if chunks.len() >= top_k {
                break;
            }
            // Deleted since the indexes were read.
            let Some(record) = self.records.get(hit.id).await? else {
                continue;
            };
            if record.scope != Scope::Owner(owner) {
                error!(requested = %owner, actual = %record.scope, chunk = %hit.id, "index returned a chunk from another owner");
                continue;
            }
            chunks.push(ScoredChunk {
                chunk: KnowledgeChunk::from_record(record)?,
                score: hit.score,
                vector_score: hit.vector_score,
                text_score: hit.text_score,
            });
        }

        debug!(owner = %owner, mode = ?ranking.mode, returned = chunks.len(), "knowledge query");
        Ok(KnowledgeResults {
            mode: ranking.mode,
            chunks,
        })
    }

    /// Like [`query`](Self::query) but embeds `query_text` itself, degrading
    /// to keyword-only when the provider fails or times out.
    pub async fn query_text(&self, owner: OwnerId, query_text: &str, top_k: usize) -> RecallResult<KnowledgeResults> {
        let vector = if query_text.trim().is_empty() {
            None
        } else {
            match EmbedRequest::new(query_text, self.embed_timeout)
                .send(self.embedder.as_ref())
                .await
            {
                Ok(v) => Some(v),
                Err(e) if e.is_degradable() => {
                    warn!(owner = %owner, error = %e, "embedding unavailable; keyword-only query");
                    None
                }
                Err(e) => return Err(e),
            }
        };
        self.query(owner, query_text, vector.as_deref(), top_k).await
    }

    async fn search_vectors(&self, owner: OwnerId, vector: &[f32], candidates: usize) -> RecallResult<Vec<Neighbor>> {
        let filter = CandidateFilter::Scope(Scope::Owner(owner));
        let ef = self.config.ef_search;
        match self.vectors.search(vector, candidates, ef, Some(&filter)) {
            Err(RecallError::IndexCorrupted(reason)) => {
                error!(reason = %reason, "knowledge vector index corrupted; rebuilding from records");
                self.rebuild().await?;
                self.vectors.search(vector, candidates, ef, Some(&filter))
            }
            other => other,
        }
    }

    /// Fetches a chunk, enforcing ownership.
    pub async fn get_chunk(&self, owner: OwnerId, id: Uuid) -> RecallResult<KnowledgeChunk> {
        let record = self.owned_record(owner, id).await?;
        KnowledgeChunk::from_record(record)
    }

    /// Deletes a chunk, enforcing ownership.
    pub async fn delete_chunk(&self, owner: OwnerId, id: Uuid) -> RecallResult<()> {
        let _guard = self.lifecycle.read().await;
        self.owned_record(owner, id).await?;
        self.records.delete(id).await?;
        self.unindex(id);
        debug!(id = %id, owner = %owner, "knowledge chunk deleted");
        Ok(())
    }

    /// Removes every chunk of `owner`. Returns how many were deleted.
    pub async fn delete_owner(&self, owner: OwnerId) -> RecallResult<usize> {
        let _guard = self.lifecycle.read().await;
        let ids: Vec<Uuid> = self
            .records
            .list(Some(Scope::Owner(owner)))
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let removed = self.records.delete_many(&ids).await?;
        for id in &ids {
            self.unindex(*id);
        }
        info!(owner = %owner, removed, "owner knowledge removed");
        Ok(removed)
    }

    /// Embeds chunks stored without a vector. Stops at the first provider
    /// failure and returns how many chunks were repaired.
    pub async fn backfill_embeddings(&self) -> RecallResult<usize> {
        let _guard = self.lifecycle.read().await;
        let pending: Vec<Record> = self
            .records
            .list(None)
            .await?
            .into_iter()
            .filter(|r| r.vector.as_ref().map_or(true, |v| v.len() != self.dimension))
            .collect();

        let mut repaired = 0;
        for mut record in pending {
            let vector = match EmbedRequest::new(&record.text, self.embed_timeout)
                .send(self.embedder.as_ref())
                .await
            {
                Ok(v) => v,
                Err(e) if e.is_degradable() => {
                    warn!(error = %e, repaired, "backfill interrupted by embedding failure");
                    break;
                }
                Err(e) => return Err(e),
            };
            self.vectors.upsert(record.id, record.scope, &vector)?;
            record.vector = Some(vector);
            record.updated_at = Utc::now();
            self.records.put(record).await?;
            repaired += 1;
        }
        if repaired > 0 {
            info!(repaired, "knowledge embeddings backfilled");
        }
        Ok(repaired)
    }

    /// Number of stored chunks.
    pub async fn len(&self) -> RecallResult<usize> {
        self.records.count().await
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

    async fn owned_record(&self, owner: OwnerId, id: Uuid) -> RecallResult<Record> {
        let record = self
            .records
            .get(id)
            .await?
            .ok_or_else(|| RecallError::NotFound(format!("knowledge chunk {id}")))?;
        match record.scope {
            Scope::Owner(actual) if actual == owner => Ok(record),
            actual => {
                error!(requested = %owner, actual = %actual, chunk = %id, "cross-tenant chunk access rejected");
                Err(RecallError::OwnerMismatch {
                    requested: owner.to_string(),
                    actual: match actual {
                        Scope::Owner(o) => o.to_string(),
                        other => other.to_string(),
                    },
                })
            }
        }
    }

    fn unindex(&self, id: Uuid) {
        self.vectors.remove(id);
        self.text.write().remove(id);
        self.owners.write().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn vector_index(&self) -> &VectorIndex {
        &self.vectors
    }
}
