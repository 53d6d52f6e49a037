use async_trait::async_trait;
use recall_core::{EngineConfig, RecallError, RecallResult};
use serde::Deserialize;

use crate::embedding::EmbeddingProvider;

/// OpenAI-compatible embeddings API client.
///
/// Works with any provider that implements `POST /v1/embeddings`. Every
/// failure (transport, non-2xx status, malformed body) is reported as
/// [`RecallError::EmbeddingUnavailable`] so callers degrade instead of failing.
pub struct HttpEmbedding {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedding {
    /// Client for `{endpoint}/v1/embeddings` without authentication.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            dimension,
        }
    }

    /// Sets the bearer token. Chainable builder method.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Builds a client from `[embedding]`, or `None` when no endpoint is set.
    pub fn from_config(config: &EngineConfig) -> RecallResult<Option<Self>> {
        let Some(endpoint) = &config.embedding.endpoint else {
            return Ok(None);
        };
        let model = config
            .embedding
            .model
            .clone()
            .ok_or_else(|| RecallError::Config("embedding.model is required with an endpoint".into()))?;
        let mut client = Self::new(endpoint.clone(), model, config.dimension);
        if let Some(var) = &config.embedding.api_key_env {
            let key = std::env::var(var)
                .map_err(|_| RecallError::Config(format!("environment variable {var} is not set")))?;
            client = client.with_api_key(key);
        }
        Ok(Some(client))
    }

    async fn request(&self, input: serde_json::Value) -> RecallResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| RecallError::EmbeddingUnavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RecallError::EmbeddingUnavailable(format!(
                "embedding API error {status}: {text}"
            )));
        }

        let mut parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| RecallError::EmbeddingUnavailable(format!("malformed embedding response: {e}")))?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedding {
    async fn embed(&self, text: &str) -> RecallResult<Vec<f32>> {
        self.request(serde_json::json!(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::EmbeddingUnavailable("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> RecallResult<Vec<Vec<f32>>> {
        let vectors = self.request(serde_json::json!(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(RecallError::EmbeddingUnavailable(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
