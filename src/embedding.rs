//! Embedding provider abstraction and implementations.
//!
//! The [`Embedder`] trait is the seam the store and retrieval service embed
//! through. [`ProviderChain`] is the production implementation: it batches,
//! truncates, retries with exponential backoff, falls back to a secondary
//! provider when one is configured, and shape-validates every response.
//!
//! Backends: `openai`, `cohere` (sends an `input_type` purpose hint),
//! `local` (in-process model, behind the `local-embeddings` feature), and
//! `disabled`.
//!
//! # Retry strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors → retry
//! - HTTP 401/403 → fail immediately, never retried, no fallback
//! - Other 4xx → fail immediately
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Also provides the vector utilities shared by storage and retrieval:
//! [`vec_to_blob`] / [`blob_to_vec`] for the SQLite BLOB encoding and
//! [`cosine_similarity`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Whether a batch is being embedded for indexing or for querying.
/// Providers that distinguish the two (Cohere) get the hint; others ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPurpose {
    Index,
    Query,
}

/// Turns batches of text into fixed-dimension vectors, one per input.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String], purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>>;
}

/// Authentication failure. Marked so callers can distinguish it from
/// transient errors: retrying on bad credentials wastes budget and time.
#[derive(Debug)]
pub struct AuthError(pub String);

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication failed: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

pub fn is_auth_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AuthError>().is_some()
}

/// The production [`Embedder`]: a primary provider with an optional
/// secondary that receives a batch only after the primary has exhausted
/// its retries on a recoverable error.
pub struct ProviderChain {
    primary: EmbeddingConfig,
    secondary: Option<EmbeddingConfig>,
    client: reqwest::Client,
}

impl ProviderChain {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        if !config.is_enabled() {
            bail!("Embedding provider is disabled. Set [embedding] provider in config.");
        }
        // Fail early on missing primary credentials.
        match config.provider.as_str() {
            "openai" => {
                api_key("OPENAI_API_KEY")?;
            }
            "cohere" => {
                api_key("COHERE_API_KEY")?;
            }
            _ => {}
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            primary: config.clone(),
            secondary: config.fallback(),
            client,
        })
    }

    async fn embed_backend(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
        purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>> {
        match config.provider.as_str() {
            "openai" => self.embed_openai(config, texts).await,
            "cohere" => self.embed_cohere(config, texts, purpose).await,
            "local" => self.embed_local(config, texts).await,
            other => bail!("Unknown embedding provider: {}", other),
        }
    }

    /// One batch against one backend, with bounded retry and backoff.
    async fn embed_with_retry(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
        purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.embed_backend(config, texts, purpose).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    if is_auth_error(&e) || !is_retryable(&e) {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }

    async fn embed_openai(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let key = api_key("OPENAI_API_KEY")?;
        let model = config
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;

        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RetryableError(format!("OpenAI request failed: {}", e)).into_anyhow())?;

        decode_provider_response("OpenAI", resp).await
    }

    async fn embed_cohere(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
        purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>> {
        let key = api_key("COHERE_API_KEY")?;
        let model = config
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Cohere provider"))?;

        let input_type = match purpose {
            EmbedPurpose::Index => "search_document",
            EmbedPurpose::Query => "search_query",
        };

        let body = serde_json::json!({
            "model": model,
            "texts": texts,
            "input_type": input_type,
        });

        let resp = self
            .client
            .post("https://api.cohere.com/v1/embed")
            .header("Authorization", format!("Bearer {}", key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RetryableError(format!("Cohere request failed: {}", e)).into_anyhow())?;

        decode_provider_response("Cohere", resp).await
    }

    /// In-process model. Inference is CPU-bound, so it runs on a blocking
    /// thread rather than stalling the async executor.
    #[cfg(feature = "local-embeddings")]
    async fn embed_local(
        &self,
        config: &EmbeddingConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let batch_size = config.batch_size;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                    .with_show_download_progress(false),
            )
            .map_err(|e| anyhow::anyhow!("failed to load local embedding model: {}", e))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("local embedding failed: {}", e))
        })
        .await?
    }

    #[cfg(not(feature = "local-embeddings"))]
    async fn embed_local(
        &self,
        _config: &EmbeddingConfig,
        _texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        bail!("provider 'local' requires the local-embeddings feature")
    }
}

#[async_trait]
impl Embedder for ProviderChain {
    async fn embed(&self, texts: &[String], purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t, self.primary.max_text_chars))
            .collect();

        let mut out = Vec::with_capacity(truncated.len());
        for batch in truncated.chunks(self.primary.batch_size) {
            let vectors = match self.embed_with_retry(&self.primary, batch, purpose).await {
                Ok(v) => v,
                Err(e) if is_auth_error(&e) => return Err(e),
                Err(e) => match &self.secondary {
                    Some(secondary) => {
                        eprintln!(
                            "Warning: embedding provider '{}' failed ({}), falling back to '{}'",
                            self.primary.provider, e, secondary.provider
                        );
                        self.embed_with_retry(secondary, batch, purpose).await?
                    }
                    None => return Err(e),
                },
            };
            validate_shape(batch.len(), &vectors, self.primary.dims)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

// ============ Response decoding ============

/// Providers return one of two JSON shapes for the same logical result:
/// OpenAI-style `{"data":[{"embedding":[..]}]}` or a flat
/// `{"embeddings":[[..]]}`. Decoded as a sum type with explicit fallback
/// between shapes rather than property probing.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProviderResponse {
    OpenAiShape { data: Vec<OpenAiDatum> },
    FlatShape { embeddings: Vec<Vec<f32>> },
}

#[derive(Deserialize)]
struct OpenAiDatum {
    embedding: Vec<f32>,
}

impl ProviderResponse {
    fn into_vectors(self) -> Vec<Vec<f32>> {
        match self {
            ProviderResponse::OpenAiShape { data } => {
                data.into_iter().map(|d| d.embedding).collect()
            }
            ProviderResponse::FlatShape { embeddings } => embeddings,
        }
    }
}

/// Transient failure eligible for retry.
#[derive(Debug)]
struct RetryableError(String);

impl std::fmt::Display for RetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryableError {}

impl RetryableError {
    fn into_anyhow(self) -> anyhow::Error {
        anyhow::Error::new(self)
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RetryableError>().is_some()
}

async fn decode_provider_response(
    provider: &str,
    resp: reqwest::Response,
) -> Result<Vec<Vec<f32>>> {
    let status = resp.status();

    if status.is_success() {
        let parsed: ProviderResponse = resp.json().await.map_err(|e| {
            anyhow::anyhow!("{} returned an unrecognized response shape: {}", provider, e)
        })?;
        return Ok(parsed.into_vectors());
    }

    let body = resp.text().await.unwrap_or_default();
    let detail: String = body.chars().take(300).collect();

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(anyhow::Error::new(AuthError(format!(
            "{} HTTP {}: {}",
            provider, status, detail
        ))));
    }

    if status.as_u16() == 429 || status.is_server_error() {
        return Err(RetryableError(format!("{} HTTP {}: {}", provider, status, detail)).into_anyhow());
    }

    bail!("{} HTTP {}: {}", provider, status, detail)
}

/// One vector per input, non-empty, uniform and finite, matching declared
/// dims when configured. A wrong shape is a provider error, never accepted.
fn validate_shape(
    expected_len: usize,
    vectors: &[Vec<f32>],
    declared_dims: Option<usize>,
) -> Result<()> {
    if vectors.len() != expected_len {
        bail!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected_len
        );
    }
    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    if dims == 0 {
        bail!("provider returned an empty embedding vector");
    }
    for v in vectors {
        if v.len() != dims {
            bail!(
                "non-uniform embedding dimensionality within batch ({} vs {})",
                v.len(),
                dims
            );
        }
        if v.iter().any(|x| !x.is_finite()) {
            bail!("non-finite value in embedding vector");
        }
    }
    if let Some(declared) = declared_dims {
        if dims != declared {
            bail!(
                "embedding dimensionality {} does not match configured dims {}",
                dims,
                declared
            );
        }
    }
    Ok(())
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

fn api_key(var: &str) -> Result<String> {
    std::env::var(var)
        .map_err(|_| anyhow::Error::new(AuthError(format!("{} environment variable not set", var))))
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for SQLite BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`] back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`. Returns `0.0` for empty or
/// length-mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
