//! Semantic response cache.
//!
//! Entries are keyed by embedding similarity rather than exact text: a lookup
//! returns the nearest stored response whose cosine similarity to the query
//! clears the configured threshold.
//!
//! # Single-flight
//!
//! A miss hands the caller a [`FillTicket`]. While that ticket is alive,
//! other callers whose query has the same fingerprint wait for it instead of
//! calling upstream themselves:
//!
//! ```text
//!  caller A ── lookup ── Miss(ticket) ── upstream call ── ticket.complete(r)
//!                                                              │
//!  caller B ── lookup ── waits on A's flight ─────────────── Hit(r)
//! ```
//!
//! Waiting is bounded by `fill_timeout_ms`; a waiter that times out gets its
//! own (detached) ticket and proceeds as an ordinary miss. Dropping a ticket
//! without completing it wakes waiters, who then retry the lookup.
//!
//! Callers that cannot hold a ticket across the upstream call use
//! [`SemanticCache::lookup_and_claim`]: the cache keeps the ticket itself
//! until [`SemanticCache::record`] for the same query releases it, or until
//! `fill_timeout_ms` passes.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_core::{CacheConfig, CacheScope, EngineConfig, OwnerId, RecallError, RecallResult, Scope};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::records::{Record, RecordStore};
use crate::text_index::tokenize;
use crate::vector_index::{CandidateFilter, IndexStats, VectorIndex, VectorIndexConfig};

/// Nearest neighbors inspected per lookup; the first fresh one above the
/// threshold wins.
const LOOKUP_CANDIDATES: usize = 4;

const RESPONSE_KEY: &str = "response";

/// A cached response returned by a lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHit {
    /// Stored response text.
    pub response: String,
    /// Query text the response was recorded under.
    pub query_text: String,
    /// Cosine similarity between the lookup and the stored query. `1.0` for
    /// responses handed over by a coalesced flight.
    pub similarity: f32,
    /// Whether the response came from another caller's in-flight fill.
    pub coalesced: bool,
}

/// Outcome of [`SemanticCache::lookup`].
#[derive(Debug)]
pub enum CacheLookup {
    /// A stored (or just-filled) response.
    Hit(CacheHit),
    /// No usable entry. The caller should fetch the response upstream and
    /// hand it to [`FillTicket::complete`].
    Miss(FillTicket),
}

/// Response plus where it came from, returned by [`SemanticCache::get_or_fill`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResponse {
    /// The response text.
    pub response: String,
    /// `true` if served from the cache or a coalesced flight.
    pub from_cache: bool,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Stored entries.
    pub entries: usize,
    /// Lookups answered from stored entries.
    pub hits: u64,
    /// Lookups that returned a fill ticket.
    pub misses: u64,
    /// Lookups answered by waiting on another caller's fill.
    pub coalesced: u64,
    /// Entries removed by age or capacity.
    pub evictions: u64,
    /// Fills currently in progress.
    pub in_flight: usize,
    /// Vector index counters.
    pub index: IndexStats,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    query_text: String,
    response: String,
    created_at: DateTime<Utc>,
}

/// Entries plus an age-ordered index for capacity eviction.
#[derive(Default)]
struct Entries {
    map: HashMap<Uuid, CacheEntry>,
    by_age: BTreeSet<(DateTime<Utc>, Uuid)>,
}

impl Entries {
    fn insert(&mut self, id: Uuid, entry: CacheEntry) {
        self.by_age.insert((entry.created_at, id));
        self.map.insert(id, entry);
    }

    fn remove(&mut self, id: Uuid) -> Option<CacheEntry> {
        let entry = self.map.remove(&id)?;
        self.by_age.remove(&(entry.created_at, id));
        Some(entry)
    }

    fn oldest(&self, n: usize) -> Vec<Uuid> {
        self.by_age.iter().take(n).map(|(_, id)| *id).collect()
    }
}

#[derive(Debug, Clone)]
enum FlightState {
    Pending,
    /// `None` when the leader gave up without a response.
    Done(Option<String>),
}

struct Flight {
    id: u64,
    rx: watch::Receiver<FlightState>,
}

struct CacheInner {
    config: CacheConfig,
    dimension: usize,
    records: Arc<dyn RecordStore>,
    vectors: VectorIndex,
    entries: parking_lot::RwLock<Entries>,
    in_flight: parking_lot::Mutex<HashMap<String, Flight>>,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

/// Tickets held on behalf of callers of `lookup_and_claim`, by fingerprint.
type ClaimedFills = Arc<parking_lot::Mutex<HashMap<String, FillTicket>>>;

/// Similarity-threshold response cache with in-flight request coalescing.
pub struct SemanticCache {
    inner: Arc<CacheInner>,
    claimed: ClaimedFills,
}

impl SemanticCache {
    /// Opens the cache, loading entries from `records` and dropping any that
    /// have already expired.
    pub async fn open(config: &EngineConfig, records: Arc<dyn RecordStore>) -> RecallResult<Self> {
        let cache = Self {
            inner: Arc::new(CacheInner {
                config: config.cache.clone(),
                dimension: config.dimension,
                records,
                vectors: VectorIndex::new(
                    VectorIndexConfig::from_engine(config).with_ef_search(config.cache.ef_search),
                ),
                entries: parking_lot::RwLock::new(Entries::default()),
                in_flight: parking_lot::Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
            claimed: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        };
        cache.rebuild().await?;
        cache.evict_expired().await?;
        Ok(cache)
    }

    /// Rebuilds the in-memory entries and vector index from records.
    pub async fn rebuild(&self) -> RecallResult<usize> {
        let inner = &self.inner;
        let records = inner.records.list(None).await?;
        inner.vectors.clear();
        let mut entries = Entries::default();
        for record in records {
            let (Some(vector), Some(response)) = (record.vector.as_ref(), record.meta_str(RESPONSE_KEY)) else {
                warn!(id = %record.id, "skipping cache record without vector or response");
                continue;
            };
            if vector.len() != inner.dimension {
                warn!(id = %record.id, len = vector.len(), "skipping cache record with wrong dimension");
                continue;
            }
            inner.vectors.insert(record.id, record.scope, vector)?;
            entries.insert(
                record.id,
                CacheEntry {
                    query_text: record.text.clone(),
                    response: response.to_string(),
                    created_at: record.created_at,
                },
            );
        }
        let count = entries.map.len();
        *inner.entries.write() = entries;
        info!(entries = count, "semantic cache loaded");
        Ok(count)
    }

    /// Compacts the record store.
    pub async fn flush(&self) -> RecallResult<()> {
        self.inner.records.compact().await
    }

    /// Looks up a response in the deployment-wide cache.
    ///
    /// Fails with [`RecallError::Config`] when the cache is configured
    /// per tenant; use [`lookup_for_owner`](Self::lookup_for_owner) there.
    pub async fn lookup(&self, query_text: &str, query_vector: &[f32]) -> RecallResult<CacheLookup> {
        let scope = self.scope_for(None)?;
        self.lookup_in(scope, query_text, query_vector).await
    }

    /// Looks up a response on behalf of `owner`. In a global deployment the
    /// owner is ignored and the shared cache is used.
    pub async fn lookup_for_owner(
        &self,
        owner: OwnerId,
        query_text: &str,
        query_vector: &[f32],
    ) -> RecallResult<CacheLookup> {
        let scope = self.scope_for(Some(owner))?;
        self.lookup_in(scope, query_text, query_vector).await
    }

    /// Lookup for callers that report the upstream response later through
    /// [`record`](Self::record) instead of a ticket.
    ///
    /// Joins an in-flight fill like [`lookup`](Self::lookup). On a miss the
    /// caller leads the fill: the cache holds its ticket, so concurrent
    /// lookups for the same query wait until `record` releases it or
    /// `fill_timeout_ms` passes.
    pub async fn lookup_and_claim(
        &self,
        owner: Option<OwnerId>,
        query_text: &str,
        query_vector: &[f32],
    ) -> RecallResult<Option<CacheHit>> {
        let scope = self.scope_for(owner)?;
        match self.lookup_in(scope, query_text, query_vector).await? {
            CacheLookup::Hit(hit) => Ok(Some(hit)),
            CacheLookup::Miss(ticket) => {
                if let Some(flight) = ticket.flight_id() {
                    self.claim(ticket, flight);
                }
                Ok(None)
            }
        }
    }

    /// Plain threshold lookup without joining or starting a flight.
    pub async fn peek(&self, owner: Option<OwnerId>, query_vector: &[f32]) -> RecallResult<Option<CacheHit>> {
        let scope = self.scope_for(owner)?;
        let hit = self.find_hit(scope, query_vector).await?;
        if hit.is_some() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    /// Stores a response in the deployment-wide cache, releasing any fill
    /// claimed for the same query.
    pub async fn record(&self, query_text: &str, query_vector: &[f32], response: &str) -> RecallResult<Uuid> {
        let scope = self.scope_for(None)?;
        self.record_in(scope, query_text, query_vector, response).await
    }

    /// Stores a response on behalf of `owner`.
    pub async fn record_for_owner(
        &self,
        owner: OwnerId,
        query_text: &str,
        query_vector: &[f32],
        response: &str,
    ) -> RecallResult<Uuid> {
        let scope = self.scope_for(Some(owner))?;
        self.record_in(scope, query_text, query_vector, response).await
    }

    /// Returns the cached response or runs `fill` exactly once across
    /// concurrent callers with the same query, caching its result.
    ///
    /// A failing `fill` is not cached; its error is returned and any waiters
    /// retry.
    pub async fn get_or_fill<F, Fut>(
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
        let scope = self.scope_for(owner)?;
        match self.lookup_in(scope, query_text, query_vector).await? {
            CacheLookup::Hit(hit) => Ok(CachedResponse {
                response: hit.response,
                from_cache: true,
            }),
            CacheLookup::Miss(ticket) => {
                let response = fill().await?;
                ticket.complete(response.clone()).await?;
                Ok(CachedResponse {
                    response,
                    from_cache: false,
                })
            }
        }
    }

    /// Removes entries older than the TTL. Returns how many were evicted.
    pub async fn evict_expired(&self) -> RecallResult<usize> {
        let now = Utc::now();
        let ttl = self.inner.config.ttl_secs;
        let expired: Vec<Uuid> = {
            let entries = self.inner.entries.read();
            entries
                .by_age
                .iter()
                .take_while(|(created, _)| is_expired(*created, now, ttl))
                .map(|(_, id)| *id)
                .collect()
        };
        if !expired.is_empty() {
            self.inner.evict(&expired).await?;
            debug!(evicted = expired.len(), "expired cache entries evicted");
        }
        Ok(expired.len())
    }

    /// Compacts the vector index if its tombstone share exceeds `ratio`.
    pub fn compact_if_needed(&self, ratio: f32) -> RecallResult<usize> {
        if self.inner.vectors.stats().tombstone_ratio() > ratio {
            self.inner.vectors.compact()
        } else {
            Ok(0)
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            entries: inner.entries.read().map.len(),
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            coalesced: inner.coalesced.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
            in_flight: inner.in_flight.lock().len(),
            index: inner.vectors.stats(),
        }
    }

    fn scope_for(&self, owner: Option<OwnerId>) -> RecallResult<Scope> {
        match (self.inner.config.scope, owner) {
            (CacheScope::Global, _) => Ok(Scope::Global),
            (CacheScope::PerTenant, Some(owner)) => Ok(Scope::Owner(owner)),
            (CacheScope::PerTenant, None) => Err(RecallError::Config(
                "cache is configured per tenant; an owner is required".into(),
            )),
        }
    }

    async fn record_in(
        &self,
        scope: Scope,
        query_text: &str,
        query_vector: &[f32],
        response: &str,
    ) -> RecallResult<Uuid> {
        let claimed = self.claimed.lock().remove(&fingerprint(scope, query_text));
        let id = self.inner.insert_entry(scope, query_text, query_vector, response).await?;
        if let Some(mut ticket) = claimed {
            ticket.finish(Some(response.to_string()));
        }
        Ok(id)
    }

    /// Parks a leader ticket until `record` takes it or the fill times out.
    fn claim(&self, ticket: FillTicket, flight: u64) {
        let key = ticket.key.clone();
        let previous = self.claimed.lock().insert(key.clone(), ticket);
        drop(previous);
        let claimed = Arc::clone(&self.claimed);
        let wait = Duration::from_millis(self.inner.config.fill_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let expired = {
                let mut claimed = claimed.lock();
                if claimed.get(&key).and_then(FillTicket::flight_id) == Some(flight) {
                    claimed.remove(&key)
                } else {
                    None
                }
            };
            if expired.is_some() {
                warn!(key = %key, "claimed fill was never recorded; releasing waiters");
            }
        });
    }

    /// Threshold search, rebuilding the index from records once if it turns
    /// out to be corrupted.
    async fn find_hit(&self, scope: Scope, query_vector: &[f32]) -> RecallResult<Option<CacheHit>> {
        match self.inner.find_hit(scope, query_vector) {
            Err(RecallError::IndexCorrupted(reason)) => {
                error!(reason = %reason, "cache vector index corrupted; rebuilding from records");
                self.rebuild().await?;
                self.inner.find_hit(scope, query_vector)
            }
            other => other,
        }
    }

    async fn lookup_in(&self, scope: Scope, query_text: &str, query_vector: &[f32]) -> RecallResult<CacheLookup> {
        let inner = &self.inner;
        RecallError::check_dimension(inner.dimension, query_vector.len())?;
        let key = fingerprint(scope, query_text);
        let wait = Duration::from_millis(inner.config.fill_timeout_ms);

        loop {
            if let Some(hit) = self.find_hit(scope, query_vector).await? {
                inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheLookup::Hit(hit));
            }

            let joined = {
                let mut in_flight = inner.in_flight.lock();
                match in_flight.get(&key) {
                    Some(flight) => Ok(flight.rx.clone()),
                    None => {
                        let id = inner.next_flight.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(FlightState::Pending);
                        in_flight.insert(key.clone(), Flight { id, rx });
                        Err((id, tx))
                    }
                }
            };

            let mut rx = match joined {
                Ok(rx) => rx,
                Err(flight) => {
                    let mut ticket = FillTicket::new(inner, scope, key.clone(), query_text, query_vector);
                    ticket.flight = Some(flight);
                    // A fill may have completed between the miss and our registration.
                    if let Some(hit) = self.find_hit(scope, query_vector).await? {
                        ticket.finish(Some(hit.response.clone()));
                        inner.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(CacheLookup::Hit(hit));
                    }
                    inner.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "cache miss; leading fill");
                    return Ok(CacheLookup::Miss(ticket));
                }
            };
            let outcome = match tokio::time::timeout(wait, rx.wait_for(|s| !matches!(s, FlightState::Pending))).await {
                Ok(Ok(state)) => match &*state {
                    FlightState::Done(response) => Some(response.clone()),
                    FlightState::Pending => Some(None),
                },
                // Leader dropped without finishing.
                Ok(Err(_)) => Some(None),
                Err(_) => None,
            };

            match outcome {
                Some(Some(response)) => {
                    inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheLookup::Hit(CacheHit {
                        response,
                        query_text: query_text.to_string(),
                        similarity: 1.0,
                        coalesced: true,
                    }));
                }
                Some(None) => continue,
                None => {
                    warn!(key = %key, timeout_ms = inner.config.fill_timeout_ms, "in-flight fill timed out; issuing own attempt");
                    inner.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheLookup::Miss(FillTicket::new(
                        inner,
                        scope,
                        key,
                        query_text,
                        query_vector,
                    )));
                }
            }
        }
    }
}

impl CacheInner {
    fn find_hit(&self, scope: Scope, query_vector: &[f32]) -> RecallResult<Option<CacheHit>> {
        RecallError::check_dimension(self.dimension, query_vector.len())?;
        let filter = CandidateFilter::Scope(scope);
        let neighbors = self
            .vectors
            .search(query_vector, LOOKUP_CANDIDATES, self.config.ef_search, Some(&filter))?;

        let now = Utc::now();
        let entries = self.entries.read();
        for neighbor in neighbors {
            if neighbor.score < self.config.similarity_threshold {
                break;
            }
            let Some(entry) = entries.map.get(&neighbor.id) else {
                continue;
            };
            if is_expired(entry.created_at, now, self.config.ttl_secs) {
                continue;
            }
            return Ok(Some(CacheHit {
                response: entry.response.clone(),
                query_text: entry.query_text.clone(),
                similarity: neighbor.score,
                coalesced: false,
            }));
        }
        Ok(None)
    }

    async fn insert_entry(
        &self,
        scope: Scope,
        query_text: &str,
        query_vector: &[f32],
        response: &str,
    ) -> RecallResult<Uuid> {
        RecallError::check_dimension(self.dimension, query_vector.len())?;
        let id = Uuid::new_v4();
        let mut record = Record::new(id, scope, query_text).with_vector(Some(query_vector.to_vec()));
        record
            .metadata
            .insert(RESPONSE_KEY.to_string(), serde_json::Value::String(response.to_string()));
        let created_at = record.created_at;
        self.records.put(record).await?;

        self.vectors.insert(id, scope, query_vector)?;
        let overflow = {
            let mut entries = self.entries.write();
            entries.insert(
                id,
                CacheEntry {
                    query_text: query_text.to_string(),
                    response: response.to_string(),
                    created_at,
                },
            );
            let excess = entries.map.len().saturating_sub(self.config.max_entries);
            entries.oldest(excess)
        };
        if !overflow.is_empty() {
            debug!(evicted = overflow.len(), "cache over capacity; evicting oldest");
            self.evict(&overflow).await?;
        }
        Ok(id)
    }

    async fn evict(&self, ids: &[Uuid]) -> RecallResult<()> {
        {
            let mut entries = self.entries.write();
            for id in ids {
                entries.remove(*id);
            }
        }
        for id in ids {
            self.vectors.remove(*id);
        }
        self.records.delete_many(ids).await?;
        self.evictions.fetch_add(ids.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Handle given to the caller that missed. Completing it stores the response
/// and wakes coalesced waiters; dropping it wakes them empty-handed.
pub struct FillTicket {
    cache: Arc<CacheInner>,
    scope: Scope,
    key: String,
    query_text: String,
    query_vector: Vec<f32>,
    flight: Option<(u64, watch::Sender<FlightState>)>,
}

impl FillTicket {
    fn new(cache: &Arc<CacheInner>, scope: Scope, key: String, query_text: &str, query_vector: &[f32]) -> Self {
        Self {
            cache: Arc::clone(cache),
            scope,
            key,
            query_text: query_text.to_string(),
            query_vector: query_vector.to_vec(),
            flight: None,
        }
    }

    /// Whether other callers may be waiting on this ticket.
    pub fn is_leader(&self) -> bool {
        self.flight.is_some()
    }

    fn flight_id(&self) -> Option<u64> {
        self.flight.as_ref().map(|(id, _)| *id)
    }

    /// Records `response` for the query that missed and releases waiters.
    pub async fn complete(mut self, response: impl Into<String>) -> RecallResult<Uuid> {
        let response = response.into();
        let stored = self
            .cache
            .insert_entry(self.scope, &self.query_text, &self.query_vector, &response)
            .await;
        match &stored {
            Ok(_) => self.finish(Some(response)),
            Err(_) => self.finish(None),
        }
        stored
    }

    fn finish(&mut self, response: Option<String>) {
        let Some((id, tx)) = self.flight.take() else {
            return;
        };
        tx.send_replace(FlightState::Done(response));
        let mut in_flight = self.cache.in_flight.lock();
        if in_flight.get(&self.key).is_some_and(|f| f.id == id) {
            in_flight.remove(&self.key);
        }
    }
}

impl Drop for FillTicket {
    fn drop(&mut self) {
        self.finish(None);
    }
}

impl std::fmt::Debug for FillTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FillTicket")
            .field("scope", &self.scope)
            .field("key", &self.key)
            .field("leader", &self.is_leader())
            .finish()
    }
}

/// Coarse single-flight key: scope plus the sorted, de-duplicated analyzed
/// terms of the query, hashed. Queries differing only in word order, case,
/// punctuation or stop words share a key.
pub fn fingerprint(scope: Scope, query_text: &str) -> String {
    let mut terms = tokenize(query_text);
    terms.sort();
    terms.dedup();
    let body = if terms.is_empty() {
        query_text.trim().to_lowercase()
    } else {
        terms.join(" ")
    };

    let mut hasher = Sha256::new();
    hasher.update(scope.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_expired(created_at: DateTime<Utc>, now: DateTime<Utc>, ttl_secs: u64) -> bool {
    let age = (now - created_at).num_seconds();
    age >= 0 && age as u64 >= ttl_secs
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::records::InMemoryRecordStore;
    use std::sync::atomic::AtomicUsize;

    fn config(dimension: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.dimension = dimension;
        config
    }

    /// Unit vector in the xy-plane with the given cosine to (1, 0, 0).
    fn at_cosine(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt(), 0.0]
    }

    async fn open(config: &EngineConfig) -> SemanticCache {
        SemanticCache::open(config, Arc::new(InMemoryRecordStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_hit_above_threshold() {
        let cache = open(&config(3)).await;
        cache
            .record("What is the notice period?", &at_cosine(1.0), "Two weeks")
            .await
            .unwrap();

        let CacheLookup::Hit(hit) = cache
            .lookup("What's the notice period?", &at_cosine(0.97))
            .await
            .unwrap()
        else {
            panic!("expected a hit");
        };
        assert_eq!(hit.response, "Two weeks");
        assert!(hit.similarity >= 0.95);
        assert!(!hit.coalesced);
    }

    #[tokio::test]
    async fn test_miss_below_threshold() {
        let cache = open(&config(3)).await;
        cache.record("notice period", &at_cosine(1.0), "Two weeks").await.unwrap();
        let lookup = cache.lookup("relocation budget", &at_cosine(0.90)).await.unwrap();
        assert!(matches!(lookup, CacheLookup::Miss(_)));
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_fill_once() {
        let cache = Arc::new(open(&config(3)).await);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fill(None, "what is the salary band", &at_cosine(1.0), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("band C".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().response, "band C");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_waiter_times_out_and_falls_through() {
        let mut config = config(3);
        config.cache.fill_timeout_ms = 30;
        let cache = open(&config).await;

        let CacheLookup::Miss(leader) = cache.lookup("stuck query", &at_cosine(1.0)).await.unwrap() else {
            panic!("expected miss");
        };
        assert!(leader.is_leader());

        let CacheLookup::Miss(own) = cache.lookup("stuck query", &at_cosine(1.0)).await.unwrap() else {
            panic!("expected fall-through miss");
        };
        assert!(!own.is_leader());
        own.complete("answered by waiter").await.unwrap();
        drop(leader);
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_abandoned_fill_wakes_waiters() {
        let cache = Arc::new(open(&config(3)).await);
        let CacheLookup::Miss(leader) = cache.lookup("flaky upstream", &at_cosine(1.0)).await.unwrap() else {
            panic!("expected miss");
        };

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.lookup("flaky upstream", &at_cosine(1.0)).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(leader);

        // The waiter retries and becomes the new leader.
        let CacheLookup::Miss(ticket) = waiter.await.unwrap() else {
            panic!("expected the waiter to miss after abandonment");
        };
        assert!(ticket.is_leader());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let mut config = config(3);
        config.cache.max_entries = 2;
        let cache = open(&config).await;

        cache.record("first", &[1.0, 0.0, 0.0], "1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.record("second", &[0.0, 1.0, 0.0], "2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.record("third", &[0.0, 0.0, 1.0], "3").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
        assert!(cache.peek(None, &[1.0, 0.0, 0.0]).await.unwrap().is_none());
        assert_eq!(cache.peek(None, &[0.0, 0.0, 1.0]).await.unwrap().unwrap().response, "3");
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let mut config = config(3);
        config.cache.ttl_secs = 0;
        let cache = open(&config).await;
        cache.record("old question", &at_cosine(1.0), "stale").await.unwrap();

        assert!(cache.peek(None, &at_cosine(1.0)).await.unwrap().is_none());
        assert_eq!(cache.evict_expired().await.unwrap(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_per_tenant_scope() {
        let mut config = config(3);
        config.cache.scope = CacheScope::PerTenant;
        let cache = open(&config).await;

        assert!(matches!(
            cache.lookup("q", &at_cosine(1.0)).await,
            Err(RecallError::Config(_))
        ));
        cache
            .record_for_owner(OwnerId(1), "notice period", &at_cosine(1.0), "Two weeks")
            .await
            .unwrap();
        assert!(cache.peek(Some(OwnerId(1)), &at_cosine(1.0)).await.unwrap().is_some());
        assert!(cache.peek(Some(OwnerId(2)), &at_cosine(1.0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let config = config(3);
        {
            let cache = SemanticCache::open(&config, Arc::clone(&records)).await.unwrap();
            cache.record("notice period", &at_cosine(1.0), "Two weeks").await.unwrap();
        }
        let cache = SemanticCache::open(&config, records).await.unwrap();
        assert_eq!(cache.peek(None, &at_cosine(0.99)).await.unwrap().unwrap().response, "Two weeks");
    }

    #[tokio::test]
    async fn test_claimed_miss_holds_concurrent_lookups() {
        let cache = Arc::new(open(&config(3)).await);
        assert!(cache
            .lookup_and_claim(None, "notice period", &at_cosine(1.0))
            .await
            .unwrap()
            .is_none());
        assert_eq!(cache.stats().in_flight, 1);

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.lookup_and_claim(None, "notice period", &at_cosine(1.0)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        cache.record("notice period", &at_cosine(1.0), "Two weeks").await.unwrap();
        let hit = waiter.await.unwrap().unwrap().expect("waiter should share the recorded response");
        assert_eq!(hit.response, "Two weeks");
        assert!(hit.coalesced);
        assert_eq!(cache.stats().in_flight, 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_unrecorded_claim_is_released() {
        let mut config = config(3);
        config.cache.fill_timeout_ms = 40;
        let cache = open(&config).await;
        assert!(cache
            .lookup_and_claim(None, "is the role remote", &at_cosine(1.0))
            .await
            .unwrap()
            .is_none());
        assert_eq!(cache.stats().in_flight, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.stats().in_flight, 0);
        assert!(cache.claimed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_index_rebuilt_on_lookup() {
        let mut config = config(3);
        config.index.brute_force_threshold = 0;
        config.cache.ef_search = 1;
        let cache = open(&config).await;
        for i in 0..12 {
            let angle = i as f32 * 0.5;
            cache
                .record(&format!("question {i}"), &[angle.cos(), angle.sin(), 0.0], &format!("answer {i}"))
                .await
                .unwrap();
        }
        cache.record("visa sponsorship", &[0.0, 0.0, 1.0], "Yes").await.unwrap();

        cache.inner.vectors.inject_dangling_edge();
        assert!(cache.inner.vectors.verify().is_err());

        let CacheLookup::Hit(hit) = cache.lookup("visa sponsorship", &[0.0, 0.0, 1.0]).await.unwrap() else {
            panic!("expected a hit after rebuild");
        };
        assert_eq!(hit.response, "Yes");
        cache.inner.vectors.verify().unwrap();
        assert_eq!(cache.stats().entries, 13);
    }

    #[test]
    fn test_fingerprint_is_coarse() {
        let a = fingerprint(Scope::Global, "What is the notice period?");
        let b = fingerprint(Scope::Global, "notice PERIOD, what is");
        let c = fingerprint(Scope::Owner(OwnerId(1)), "What is the notice period?");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
