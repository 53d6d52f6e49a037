#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the recall-engine crate.
//!
//! Covers tenant isolation, keyword-only retrieval, cache similarity
//! thresholds, topic replacement, session isolation, deterministic ordering,
//! provider outages, concurrent sessions, and restart from durable records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use recall_core::{EngineConfig, OwnerId, RecallError, RecallResult};
use recall_engine::{
    EmbeddingProvider, EngineStorage, LocalEmbedding, RankingMode, RetrievalEngine,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Provider that is always down.
struct DownEmbedding {
    dimension: usize,
}

#[async_trait]
impl EmbeddingProvider for DownEmbedding {
    async fn embed(&self, _text: &str) -> RecallResult<Vec<f32>> {
        Err(RecallError::EmbeddingUnavailable("provider offline".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

async fn local_engine() -> RetrievalEngine {
    RetrievalEngine::in_memory(EngineConfig::default()).await.unwrap()
}

async fn down_engine() -> RetrievalEngine {
    let config = EngineConfig::default();
    let embedder = Arc::new(DownEmbedding {
        dimension: config.dimension,
    });
    RetrievalEngine::open(config, EngineStorage::in_memory(), embedder)
        .await
        .unwrap()
}

fn cache_engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.dimension = 3;
    config.cache.similarity_threshold = 0.95;
    config
}

fn no_meta() -> HashMap<String, serde_json::Value> {
    HashMap::new()
}

// ---------------------------------------------------------------------------
// 1. Knowledge tenant isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_returns_only_owner_chunks() {
    let engine = local_engine().await;
    let first = engine
        .add_knowledge(OwnerId(1), "5 years experience with distributed systems", no_meta())
        .await
        .unwrap();
    engine
        .add_knowledge(OwnerId(2), "Java backend, 2 years", no_meta())
        .await
        .unwrap();

    let results = engine
        .query_knowledge_text(OwnerId(1), "distributed systems experience", 5)
        .await
        .unwrap();
    assert_eq!(results.ids(), vec![first]);
    assert_eq!(results.mode, RankingMode::Hybrid);
}

#[tokio::test]
async fn other_owners_never_see_chunks() {
    let engine = local_engine().await;
    let mut owned_by_a = Vec::new();
    for i in 0..40 {
        let text = format!("relocation package covers flights and housing option {i}");
        owned_by_a.push(engine.add_knowledge(OwnerId(7), &text, no_meta()).await.unwrap());
    }
    engine
        .add_knowledge(OwnerId(8), "unrelated onboarding checklist", no_meta())
        .await
        .unwrap();

    for owner in [OwnerId(8), OwnerId(9)] {
        let results = engine
            .query_knowledge_text(owner, "relocation package flights housing", 20)
            .await
            .unwrap();
        assert!(results.ids().iter().all(|id| !owned_by_a.contains(id)));
    }
}

#[tokio::test]
async fn cross_owner_access_is_rejected() {
    let engine = local_engine().await;
    let id = engine
        .add_knowledge(OwnerId(1), "equity vests over four years", no_meta())
        .await
        .unwrap();

    let err = engine.get_chunk(OwnerId(2), id).await.unwrap_err();
    assert!(err.is_security_relevant());
    let err = engine.delete_chunk(OwnerId(2), id).await.unwrap_err();
    assert!(matches!(err, RecallError::OwnerMismatch { .. }));
    assert!(engine.get_chunk(OwnerId(1), id).await.is_ok());

    let missing = engine.get_chunk(OwnerId(1), Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(missing, RecallError::NotFound(_)));
}

#[tokio::test]
async fn invalid_metadata_is_rejected() {
    let engine = local_engine().await;
    let mut metadata = HashMap::new();
    metadata.insert("page".to_string(), serde_json::json!("seven"));
    assert!(engine
        .add_knowledge(OwnerId(1), "benefits overview", metadata)
        .await
        .is_err());
}

// ---------------------------------------------------------------------------
// 2. Keyword channel alone
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exact_phrase_found_without_vector() {
    let engine = local_engine().await;
    for i in 0..30 {
        engine
            .add_knowledge(OwnerId(1), &format!("general policy paragraph number {i}"), no_meta())
            .await
            .unwrap();
    }
    let target = engine
        .add_knowledge(OwnerId(1), "Employees accrue twenty five vacation days per year", no_meta())
        .await
        .unwrap();

    let results = engine
        .query_knowledge(OwnerId(1), "twenty five vacation days", None, 3)
        .await
        .unwrap();
    assert!(results.is_degraded());
    assert_eq!(results.ids().first(), Some(&target));
    assert!(results.chunks[0].vector_score.is_none());
}

#[tokio::test]
async fn wrong_query_dimension_is_rejected() {
    let engine = local_engine().await;
    let err = engine
        .query_knowledge(OwnerId(1), "salary", Some(&[1.0, 0.0]), 3)
        .await
        .unwrap_err();
    assert!(matches!(err, RecallError::DimensionMismatch { .. }));
}

// ---------------------------------------------------------------------------
// 3. Semantic cache thresholds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn similar_query_hits_cache() {
    let engine = RetrievalEngine::in_memory(cache_engine_config()).await.unwrap();
    let v1 = [1.0, 0.0, 0.0];
    let v2 = [0.97, (1.0f32 - 0.97 * 0.97).sqrt(), 0.0];

    engine
        .cache_record("What is the notice period?", &v1, "Two weeks")
        .await
        .unwrap();
    let hit = engine
        .cache_lookup("What's the notice period?", &v2)
        .await
        .unwrap();
    assert_eq!(hit.as_deref(), Some("Two weeks"));
}

#[tokio::test]
async fn dissimilar_query_misses_cache() {
    let engine = RetrievalEngine::in_memory(cache_engine_config()).await.unwrap();
    engine
        .cache_record("What is the notice period?", &[1.0, 0.0, 0.0], "Two weeks")
        .await
        .unwrap();

    let below = [0.9, (1.0f32 - 0.9 * 0.9).sqrt(), 0.0];
    assert!(engine.cache_lookup("Is the role remote?", &below).await.unwrap().is_none());
    assert!(engine
        .cache_lookup("Is there a bonus?", &[0.0, 1.0, 0.0])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn concurrent_fills_run_upstream_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let engine = Arc::new(RetrievalEngine::in_memory(cache_engine_config()).await.unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            engine
                .cache_get_or_fill(None, "Do you sponsor visas?", &[0.0, 0.0, 1.0], || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok("Yes, H-1B".to_string())
                })
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().response, "Yes, H-1B");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lookup_during_pending_record_waits_for_it() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let engine = Arc::new(RetrievalEngine::in_memory(cache_engine_config()).await.unwrap());
    let query = "What is the notice period?";
    let vector = [1.0, 0.0, 0.0];
    let upstream_calls = Arc::new(AtomicUsize::new(0));

    // First caller misses and goes upstream.
    assert!(engine.cache_lookup(query, &vector).await.unwrap().is_none());
    upstream_calls.fetch_add(1, Ordering::SeqCst);

    let mut followers = Vec::new();
    for _ in 0..4 {
        let engine = Arc::clone(&engine);
        let upstream_calls = Arc::clone(&upstream_calls);
        followers.push(tokio::spawn(async move {
            let started = std::time::Instant::now();
            let found = engine.cache_lookup(query, &vector).await.unwrap();
            if found.is_none() {
                upstream_calls.fetch_add(1, Ordering::SeqCst);
            }
            (found, started.elapsed())
        }));
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    engine.cache_record(query, &vector, "Two weeks").await.unwrap();

    for follower in followers {
        let (found, waited) = follower.await.unwrap();
        assert_eq!(found.as_deref(), Some("Two weeks"));
        assert!(waited >= std::time::Duration::from_millis(50), "returned after {waited:?}");
    }
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().await.unwrap().cache.in_flight, 0);
}

// ---------------------------------------------------------------------------
// 4. Session memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn topic_upsert_replaces_previous_fact() {
    let engine = local_engine().await;
    let session = Uuid::new_v4();
    let first = engine
        .memory_upsert(session, "salary", "Expects $120k", "I'd like around 120k")
        .await
        .unwrap();
    let second = engine
        .memory_upsert(session, "salary", "Expects $130k", "Actually 130k")
        .await
        .unwrap();

    let facts = engine.memory_list(session);
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].content, "Expects $130k");
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn repeated_upserts_keep_one_fact_per_topic() {
    let engine = local_engine().await;
    let session = Uuid::new_v4();
    for i in 0..25 {
        engine
            .memory_upsert(session, "salary", &format!("Expects ${i}k"), "m")
            .await
            .unwrap();
        engine
            .memory_upsert(session, "location", &format!("City {i}"), "m")
            .await
            .unwrap();
    }

    let facts = engine.memory_list(session);
    assert_eq!(facts.len(), 2);
    assert_eq!(engine.memory_get(session, "salary").unwrap().content, "Expects $24k");
    assert_eq!(engine.memory_get(session, "location").unwrap().content, "City 24");
}

#[tokio::test]
async fn recall_stays_within_session() {
    let engine = local_engine().await;
    let embedder = LocalEmbedding::new(engine.config().dimension);
    let s1 = Uuid::new_v4();
    let s2 = Uuid::new_v4();

    engine.memory_upsert(s1, "notice", "Two weeks notice", "m").await.unwrap();
    engine.memory_upsert(s2, "salary", "Expects $150k base salary", "m").await.unwrap();
    engine.memory_upsert(s2, "visa", "Needs visa sponsorship", "m").await.unwrap();

    let query = embedder.embed("Expects $150k base salary").await.unwrap();
    let recalled = engine.memory_recall(s1, &query, 5).await.unwrap();
    assert!(!recalled.is_empty());
    assert!(recalled.iter().all(|r| r.fact.session_id == s1));

    let other = engine.memory_recall(s2, &query, 1).await.unwrap();
    assert_eq!(other[0].fact.topic.as_str(), "salary");
}

#[tokio::test]
async fn concurrent_sessions_write_independently() {
    let engine = Arc::new(local_engine().await);
    let sessions: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();

    let mut handles = Vec::new();
    for session in sessions.iter().copied() {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                engine
                    .memory_upsert(session, "availability", &format!("Starts in {i} weeks"), "m")
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for session in sessions {
        let facts = engine.memory_list(session);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "Starts in 9 weeks");
    }
}

// ---------------------------------------------------------------------------
// 5. Determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_queries_return_identical_order() {
    let engine = local_engine().await;
    for i in 0..60 {
        let text = match i % 3 {
            0 => format!("remote work policy allows {i} days from home"),
            1 => format!("salary bands reviewed every {i} months"),
            _ => format!("remote salary adjustments for region {i}"),
        };
        engine.add_knowledge(OwnerId(4), &text, no_meta()).await.unwrap();
    }

    let first = engine.query_knowledge_text(OwnerId(4), "remote salary", 15).await.unwrap();
    let second = engine.query_knowledge_text(OwnerId(4), "remote salary", 15).await.unwrap();
    assert_eq!(first.ids(), second.ids());
    assert_eq!(first.ids().len(), 15);
}

// ---------------------------------------------------------------------------
// 6. Provider outage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn provider_down_degrades_to_keyword_ranking() {
    let engine = down_engine().await;
    let id = engine
        .add_knowledge(OwnerId(1), "Parental leave is sixteen weeks fully paid", no_meta())
        .await
        .unwrap();
    engine
        .add_knowledge(OwnerId(1), "Gym membership is reimbursed", no_meta())
        .await
        .unwrap();

    let results = engine
        .query_knowledge_text(OwnerId(1), "parental leave weeks", 5)
        .await
        .unwrap();
    assert!(results.is_degraded());
    assert_eq!(results.ids(), vec![id]);
    assert!(!engine.get_chunk(OwnerId(1), id).await.unwrap().embedded);
}

#[tokio::test]
async fn provider_down_keeps_memory_writes() {
    let engine = down_engine().await;
    let session = Uuid::new_v4();
    let fact = engine
        .memory_upsert(session, "salary", "Expects $120k", "m")
        .await
        .unwrap();
    assert!(fact.embedding_stale);

    let recall = engine.memory_recall_text(session, "salary expectations", 3).await.unwrap();
    assert_eq!(recall.mode, RankingMode::KeywordOnly);
    assert_eq!(recall.facts[0].fact.content, "Expects $120k");
}

// ---------------------------------------------------------------------------
// 7. Restart from durable records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_storage_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let session = Uuid::new_v4();
    let config = EngineConfig::default();

    let chunk = {
        let storage = EngineStorage::file(tmp.path()).await.unwrap();
        let engine = RetrievalEngine::open(
            config.clone(),
            storage,
            Arc::new(LocalEmbedding::new(config.dimension)),
        )
        .await
        .unwrap();
        engine.memory_upsert(session, "salary", "Expects $120k", "m").await.unwrap();
        engine.memory_upsert(session, "salary", "Expects $130k", "m").await.unwrap();
        let id = engine
            .add_knowledge(OwnerId(3), "Interview loop has four rounds", no_meta())
            .await
            .unwrap();
        engine.flush().await.unwrap();
        id
    };

    let storage = EngineStorage::file(tmp.path()).await.unwrap();
    let engine = RetrievalEngine::open(
        config.clone(),
        storage,
        Arc::new(LocalEmbedding::new(config.dimension)),
    )
    .await
    .unwrap();

    let facts = engine.memory_list(session);
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].content, "Expects $130k");

    let results = engine
        .query_knowledge_text(OwnerId(3), "how many interview rounds", 3)
        .await
        .unwrap();
    assert_eq!(results.ids(), vec![chunk]);
}

#[tokio::test]
async fn backfill_repairs_outage_writes() {
    let config = EngineConfig::default();
    let storage = EngineStorage::in_memory();
    let shared = EngineStorage {
        knowledge: Arc::clone(&storage.knowledge),
        cache: Arc::clone(&storage.cache),
        memory: Arc::clone(&storage.memory),
    };

    {
        let engine = RetrievalEngine::open(
            config.clone(),
            storage,
            Arc::new(DownEmbedding {
                dimension: config.dimension,
            }),
        )
        .await
        .unwrap();
        engine
            .add_knowledge(OwnerId(1), "Stock options vest monthly", no_meta())
            .await
            .unwrap();
        engine
            .memory_upsert(Uuid::new_v4(), "equity", "Wants options", "m")
            .await
            .unwrap();
    }

    let engine = RetrievalEngine::open(
        config.clone(),
        shared,
        Arc::new(LocalEmbedding::new(config.dimension)),
    )
    .await
    .unwrap();
    assert_eq!(engine.backfill().await.unwrap(), (1, 1));
    assert_eq!(engine.backfill().await.unwrap(), (0, 0));

    let results = engine
        .query_knowledge_text(OwnerId(1), "stock options", 3)
        .await
        .unwrap();
    assert!(!results.is_degraded());
    assert!(results.chunks[0].vector_score.is_some());
}
