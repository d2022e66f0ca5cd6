//! Embedding provider contract and the providers POF ships with.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use pof_core::normalize_text;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbeddingError {
    /// The provider cannot serve this run at all.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    /// This one input could not be embedded; others may still succeed.
    #[error("embedding failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Http,
    #[default]
    Hashing,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: ProviderKind,
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub timeout_secs: u64,
    pub backoff: BackoffPolicy,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hashing,
            url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 256,
            timeout_secs: 20,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub fn provider_from_settings(
    settings: &EmbeddingSettings,
) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match settings.provider {
        ProviderKind::Http => Ok(Arc::new(HttpEmbeddingProvider::new(settings)?)),
        ProviderKind::Hashing => Ok(Arc::new(HashingEmbeddingProvider::new(settings.dimensions)?)),
    }
}

/// OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug)]
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    backoff: BackoffPolicy,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(settings: &EmbeddingSettings) -> anyhow::Result<Self> {
        if settings.dimensions == 0 {
            bail!("embedding dimensions must be positive");
        }
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", settings.url.trim_end_matches('/')),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            dimensions: settings.dimensions,
            backoff: settings.backoff,
        })
    }

    async fn send_once(&self, text: &str) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: [text],
            dimensions: self.dimensions,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        for attempt in 0..=self.backoff.max_retries {
            let retries_left = attempt < self.backoff.max_retries;
            match self.send_once(text).await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: EmbeddingResponse = resp.json().await.map_err(|err| {
                            EmbeddingError::Failed(format!("decoding response: {err}"))
                        })?;
                        let vector = body
                            .data
                            .into_iter()
                            .next()
                            .map(|d| d.embedding)
                            .ok_or_else(|| {
                                EmbeddingError::Failed("empty embedding response".into())
                            })?;
                        if vector.len() != self.dimensions {
                            return Err(EmbeddingError::Failed(format!(
                                "expected {} dimensions, got {}",
                                self.dimensions,
                                vector.len()
                            )));
                        }
                        return Ok(vector);
                    }

                    if matches!(
                        status,
                        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
                    ) {
                        return Err(EmbeddingError::Unavailable(format!("http status {status}")));
                    }
                    if classify_status(status) == RetryDisposition::Retryable {
                        if retries_left {
                            warn!(%status, attempt, "embedding request failed, retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(EmbeddingError::Unavailable(format!(
                            "http status {status} after retries"
                        )));
                    }
                    return Err(EmbeddingError::Failed(format!("http status {status}")));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        if retries_left {
                            warn!(error = %err, attempt, "embedding request error, retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(EmbeddingError::Unavailable(format!(
                            "request failed after retries: {err}"
                        )));
                    }
                    return Err(EmbeddingError::Failed(err.to_string()));
                }
            }
        }
        Err(EmbeddingError::Unavailable("retry budget exhausted".into()))
    }
}

/// Offline provider: signed feature hashing of word unigrams and bigrams, L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimensions: usize) -> anyhow::Result<Self> {
        if dimensions == 0 {
            bail!("embedding dimensions must be positive");
        }
        Ok(Self { dimensions })
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(index_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let normalized = normalize_text(text);
        let tokens: Vec<String> = normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Err(EmbeddingError::Failed("no tokens to embed".into()));
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            let (index, sign) = self.bucket(token);
            vector[index] += sign;
        }
        for pair in tokens.windows(2) {
            let (index, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[index] += 0.5 * sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_sync(text)
    }
}

/// Static lookup table keyed by normalized text, for demos and tests.
#[derive(Debug, Clone, Default)]
pub struct FixtureEmbeddingProvider {
    vectors: HashMap<String, Vec<f32>>,
    unavailable: bool,
}

impl FixtureEmbeddingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(normalize_text(text), vector);
        self
    }

    /// A provider whose every call reports the service as down.
    pub fn unavailable() -> Self {
        Self {
            vectors: HashMap::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FixtureEmbeddingProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    fn dimensions(&self) -> usize {
        self.vectors.values().next().map(Vec::len).unwrap_or(0)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.unavailable {
            return Err(EmbeddingError::Unavailable("fixture provider is offline".into()));
        }
        let key = normalize_text(text);
        debug!(text = %key, "fixture embedding lookup");
        self.vectors
            .get(&key)
            .cloned()
            .ok_or_else(|| EmbeddingError::Failed(format!("no fixture vector for `{key}`")))
    }
}
