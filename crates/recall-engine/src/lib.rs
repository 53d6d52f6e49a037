//! Hybrid retrieval, semantic caching, and session memory.
//!
//! Provides an approximate nearest-neighbor index with scope-filtered
//! search, a BM25 keyword index, score fusion across both channels, a
//! similarity-keyed response cache with single-flight fills, and per-session
//! fact memory. Every index is rebuilt from durable records on startup.
//!
//! # Main types
//!
//! - [`RetrievalEngine`] — Facade over the three collections.
//! - [`VectorIndex`] — Layered proximity graph with tombstones and compaction.
//! - [`TextIndex`] — BM25 inverted index.
//! - [`KnowledgeBase`] — Owner-isolated chunks with hybrid ranking.
//! - [`SemanticCache`] — Similarity-keyed response cache.
//! - [`SessionMemoryStore`] — Topic-keyed facts per interview session.
//! - [`RecordStore`] — Durable storage the indexes are rebuilt from.
//! - [`EmbeddingProvider`] — Text-to-vector seam, with a local implementation.

/// Similarity-keyed response cache.
pub mod cache;
/// Embedding provider trait, timeouts, and local implementation.
pub mod embedding;
/// Engine facade and background maintenance.
pub mod engine;
/// OpenAI-compatible HTTP embedding provider.
#[cfg(feature = "http-embeddings")]
pub mod http_embedding;
/// Owner-isolated knowledge chunks.
pub mod knowledge;
/// Per-session fact memory.
pub mod memory;
/// Score normalization and fusion.
pub mod ranker;
/// Durable record storage.
pub mod records;
/// BM25 keyword index.
pub mod text_index;
/// Approximate nearest-neighbor index.
pub mod vector_index;

pub use cache::{CacheHit, CacheLookup, CacheStats, CachedResponse, FillTicket, SemanticCache};
pub use embedding::{CancelToken, EmbedRequest, EmbeddingProvider, LocalEmbedding};
pub use engine::{EngineStats, EngineStorage, MaintenanceReport, RetrievalEngine};
#[cfg(feature = "http-embeddings")]
pub use http_embedding::HttpEmbedding;
pub use knowledge::{KnowledgeBase, KnowledgeChunk, KnowledgeResults, ScoredChunk};
pub use memory::{MemoryFact, MemoryRecall, RecalledFact, SessionMemoryStore};
pub use ranker::{fuse, rank, FusionWeights, RankedId, Ranking, RankingMode};
pub use records::{FileRecordStore, InMemoryRecordStore, Record, RecordStore};
pub use text_index::TextIndex;
pub use vector_index::{
    cosine_similarity, CandidateFilter, IndexSnapshot, IndexStats, Neighbor, VectorIndex,
    VectorIndexConfig,
};
