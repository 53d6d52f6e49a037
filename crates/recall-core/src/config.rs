use serde::{Deserialize, Serialize};

use crate::error::{RecallError, RecallResult};
use crate::types::Topic;

/// Top-level engine configuration, usually loaded from `recall.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Embedding dimension shared by every collection.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Period of the background maintenance task.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Proximity-graph parameters.
    #[serde(default)]
    pub index: IndexConfig,
    /// Knowledge-base retrieval settings.
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    /// Semantic cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Session memory settings.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            maintenance_interval_secs: default_maintenance_interval(),
            index: IndexConfig::default(),
            knowledge: KnowledgeConfig::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document.
    pub fn from_toml(text: &str) -> RecallResult<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| RecallError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot operate with.
    pub fn validate(&self) -> RecallResult<()> {
        if self.dimension == 0 {
            return Err(RecallError::Config("dimension must be > 0".into()));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(RecallError::Config("maintenance_interval_secs must be > 0".into()));
        }
        if self.index.max_connections < 2 {
            return Err(RecallError::Config("index.max_connections must be >= 2".into()));
        }
        if self.index.ef_construction == 0 || self.index.ef_search == 0 {
            return Err(RecallError::Config("ef values must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.index.compaction_tombstone_ratio) {
            return Err(RecallError::Config(
                "index.compaction_tombstone_ratio must be within [0, 1]".into(),
            ));
        }
        let k = &self.knowledge;
        if k.vector_weight < 0.0 || k.text_weight < 0.0 || k.vector_weight + k.text_weight <= 0.0 {
            return Err(RecallError::Config(
                "knowledge weights must be non-negative and not both zero".into(),
            ));
        }
        if k.candidate_multiplier == 0 {
            return Err(RecallError::Config("knowledge.candidate_multiplier must be > 0".into()));
        }
        if !(-1.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(RecallError::Config(
                "cache.similarity_threshold must be within [-1, 1]".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(RecallError::Config("cache.max_entries must be > 0".into()));
        }
        if self.memory.max_topic_len == 0 {
            return Err(RecallError::Config("memory.max_topic_len must be > 0".into()));
        }
        if self.embedding.timeout_ms == 0 {
            return Err(RecallError::Config("embedding.timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> RecallResult<String> {
        toml::to_string_pretty(self).map_err(|e| RecallError::Config(e.to_string()))
    }

    /// Per-call embedding timeout.
    pub fn embedding_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.embedding.timeout_ms)
    }
}

/// Proximity-graph (vector index) parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexConfig {
    /// Neighbors kept per node on upper layers (M). Layer 0 keeps `2 * M`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Candidate frontier width while inserting.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// Candidate frontier width for searches that do not pass their own.
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Scopes with at most this many nodes are searched exhaustively.
    #[serde(default = "default_brute_force_threshold")]
    pub brute_force_threshold: usize,
    /// Tombstone share above which maintenance compacts the graph.
    #[serde(default = "default_tombstone_ratio")]
    pub compaction_tombstone_ratio: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            brute_force_threshold: default_brute_force_threshold(),
            compaction_tombstone_ratio: default_tombstone_ratio(),
        }
    }
}

/// Knowledge-base retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeConfig {
    /// Weight of the normalized vector score in the fused score.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    /// Weight of the normalized keyword score in the fused score.
    #[serde(default = "default_text_weight")]
    pub text_weight: f32,
    /// Each channel fetches `top_k * candidate_multiplier` candidates.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Frontier width for knowledge queries.
    #[serde(default = "default_knowledge_ef")]
    pub ef_search: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            ef_search: default_knowledge_ef(),
        }
    }
}

/// Whether cached answers are shared across tenants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// One cache for the whole deployment.
    #[default]
    Global,
    /// Entries are keyed by owner; lookups never cross tenants.
    PerTenant,
}

/// Semantic cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Minimum cosine similarity for a hit.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Entries older than this are expired.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Capacity bound; the oldest entries are evicted first.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// How long a coalesced caller waits for the in-flight fill.
    #[serde(default = "default_fill_timeout_ms")]
    pub fill_timeout_ms: u64,
    /// Global or per-tenant scoping.
    #[serde(default)]
    pub scope: CacheScope,
    /// Frontier width for cache lookups.
    #[serde(default = "default_cache_ef")]
    pub ef_search: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            fill_timeout_ms: default_fill_timeout_ms(),
            scope: CacheScope::default(),
            ef_search: default_cache_ef(),
        }
    }
}

/// Session memory settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// Frontier width for recall queries.
    #[serde(default = "default_memory_ef")]
    pub ef_search: usize,
    /// Maximum topic length in characters.
    #[serde(default = "default_max_topic_len")]
    pub max_topic_len: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ef_search: default_memory_ef(),
            max_topic_len: default_max_topic_len(),
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Per-call timeout; a timeout degrades instead of failing.
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
    /// Base URL of an OpenAI-compatible embeddings API. Local hashing when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Model name sent to the remote provider.
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_embedding_timeout_ms(),
            endpoint: None,
            model: None,
            api_key_env: None,
        }
    }
}

fn default_dimension() -> usize {
    256
}
fn default_maintenance_interval() -> u64 {
    60
}
fn default_max_connections() -> usize {
    16
}
fn default_ef_construction() -> usize {
    100
}
fn default_ef_search() -> usize {
    64
}
fn default_brute_force_threshold() -> usize {
    256
}
fn default_tombstone_ratio() -> f32 {
    0.25
}
fn default_vector_weight() -> f32 {
    0.6
}
fn default_text_weight() -> f32 {
    0.4
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_knowledge_ef() -> usize {
    128
}
fn default_similarity_threshold() -> f32 {
    0.95
}
fn default_ttl_secs() -> u64 {
    86_400
}
fn default_max_entries() -> usize {
    10_000
}
fn default_fill_timeout_ms() -> u64 {
    10_000
}
fn default_cache_ef() -> usize {
    32
}
fn default_memory_ef() -> usize {
    32
}
fn default_max_topic_len() -> usize {
    Topic::DEFAULT_MAX_LEN
}
fn default_embedding_timeout_ms() -> u64 {
    2_000
}
