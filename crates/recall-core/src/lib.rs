//! Core types, error taxonomy, and configuration for the recall engine.
//!
//! This crate provides the foundational types shared by the retrieval engine
//! and its binary: the failure taxonomy, the isolation scopes every record is
//! tagged with, validated chunk metadata and session topics, and the
//! serde-deserializable engine configuration.
//!
//! # Main types
//!
//! - [`RecallError`] — Unified error enum for the engine.
//! - [`RecallResult`] — Convenience alias for `Result<T, RecallError>`.
//! - [`Scope`] — Global, per-tenant, or per-session isolation tag.
//! - [`ChunkMetadata`] — Typed metadata with opaque passthrough of unknown keys.
//! - [`Topic`] — Validated session-fact key.
//! - [`EngineConfig`] — Engine configuration with defaults for every field.

/// Engine configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Identifiers, scopes, topics, and metadata.
pub mod types;

pub use config::{
    CacheConfig, CacheScope, EmbeddingConfig, EngineConfig, IndexConfig, KnowledgeConfig,
    MemoryConfig,
};
pub use error::{RecallError, RecallResult};
pub use types::{ChunkMetadata, OwnerId, Scope, SessionId, Topic};
