use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recall_core::{RecallError, RecallResult};
use tokio::sync::watch;

use crate::text_index::tokenize;

/// Trait for computing text embeddings (vector representations).
///
/// Implementations call out to an external provider and may fail with
/// timeouts or rate limits; the engine never calls `embed` directly but goes
/// through [`EmbedRequest`] so every call has a deadline.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Compute embedding vector for a single text.
    async fn embed(&self, text: &str) -> RecallResult<Vec<f32>>;

    /// Compute embeddings for a batch of texts.
    async fn embed_batch(&self, texts: &[&str]) -> RecallResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Dimension of the embedding vectors produced by this provider.
    fn dimension(&self) -> usize;
}

/// Cooperative cancellation handle shared between a caller and the
/// embedding requests it issued.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancels every request observing this token.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns on cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A single embedding call with a deadline and a cancellation token.
///
/// Every failure mode (provider error, timeout, cancellation) comes back as
/// [`RecallError::EmbeddingUnavailable`], which callers treat as a signal to
/// degrade. A provider returning the wrong vector length is a
/// [`RecallError::DimensionMismatch`] instead, since no fallback fixes that.
#[derive(Debug, Clone)]
pub struct EmbedRequest<'a> {
    text: &'a str,
    timeout: Duration,
    cancel: CancelToken,
}

impl<'a> EmbedRequest<'a> {
    /// Creates a request with a fresh cancellation token.
    pub fn new(text: &'a str, timeout: Duration) -> Self {
        Self {
            text,
            timeout,
            cancel: CancelToken::new(),
        }
    }

    /// Attaches a caller-owned cancellation token. Chainable builder method.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the request against `provider`.
    pub async fn send(self, provider: &dyn EmbeddingProvider) -> RecallResult<Vec<f32>> {
        if self.cancel.is_cancelled() {
            return Err(RecallError::EmbeddingUnavailable("request cancelled".into()));
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(RecallError::EmbeddingUnavailable("request cancelled".into()));
            }
            outcome = tokio::time::timeout(self.timeout, provider.embed(self.text)) => outcome,
        };

        match outcome {
            Ok(Ok(vector)) => {
                RecallError::check_dimension(provider.dimension(), vector.len())?;
                Ok(vector)
            }
            Ok(Err(err @ RecallError::DimensionMismatch { .. })) => Err(err),
            Ok(Err(RecallError::EmbeddingUnavailable(msg))) => {
                Err(RecallError::EmbeddingUnavailable(msg))
            }
            Ok(Err(other)) => Err(RecallError::EmbeddingUnavailable(other.to_string())),
            Err(_) => Err(RecallError::EmbeddingUnavailable(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Local bag-of-words embedding (no external API needed).
/// Hashes analyzed terms into a fixed-size vector and L2-normalizes it.
/// Good enough for offline use and tests; production deployments point the
/// engine at a real provider.
pub struct LocalEmbedding {
    dimension: usize,
}

impl LocalEmbedding {
    /// Creates a hashing embedder with the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for LocalEmbedding {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    async fn embed(&self, text: &str) -> RecallResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RecallError::InvalidInput("Cannot embed empty text".to_string()));
        }

        let mut vector = vec![0.0f32; self.dimension];
        let terms = tokenize(text);

        let mut freq: HashMap<&str, f32> = HashMap::new();
        for term in &terms {
            *freq.entry(term.as_str()).or_insert(0.0) += 1.0;
        }

        let total = terms.len() as f32;
        if total == 0.0 {
            return Ok(vector);
        }

        // Several hash positions per term for better spread
        for (term, count) in &freq {
            let tf = count / total;
            let h1 = fnv1a(term.as_bytes()) as usize;
            let h2 = fnv1a(&[term.as_bytes(), &[1u8]].concat()) as usize;
            let h3 = fnv1a(&[term.as_bytes(), &[2u8]].concat()) as usize;

            vector[h1 % self.dimension] += tf;
            vector[h2 % self.dimension] += tf * 0.7;
            vector[h3 % self.dimension] += tf * 0.5;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// FNV-1a, 32 bit.
pub(crate) fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
