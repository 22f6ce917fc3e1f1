use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub lms: LmsConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub websearch: WebSearchConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// LMS API settings. The access token is read from the `CANVAS_API_TOKEN`
/// environment variable, never from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct LmsConfig {
    /// Base URL of the Canvas instance, e.g. `https://school.instructure.com`.
    pub base_url: String,
    #[serde(default = "default_lms_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_lms_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Links enqueued per page; bounds fan-out on link-heavy pages.
    #[serde(default = "default_max_links_per_page")]
    pub max_links_per_page: usize,
    #[serde(default = "default_crawl_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            max_links_per_page: default_max_links_per_page(),
            timeout_secs: default_crawl_timeout_secs(),
        }
    }
}

fn default_max_pages() -> usize {
    25
}
fn default_max_depth() -> usize {
    2
}
fn default_max_links_per_page() -> usize {
    10
}
fn default_crawl_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    /// Characters of overlap carried into the next chunk.
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1200
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// One of `disabled`, `openai`, `cohere`, `local`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Secondary provider tried after the primary exhausts its retries.
    #[serde(default)]
    pub fallback_provider: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Texts longer than this are truncated before being sent.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            fallback_provider: None,
            fallback_model: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_max_text_chars() -> usize {
    8000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Config for the secondary provider, if one is set.
    pub fn fallback(&self) -> Option<EmbeddingConfig> {
        let provider = self.fallback_provider.clone()?;
        Some(EmbeddingConfig {
            provider,
            model: self.fallback_model.clone(),
            fallback_provider: None,
            fallback_model: None,
            ..self.clone()
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Top-score floor for using retrieved chunks verbatim.
    #[serde(default = "default_strong_threshold")]
    pub strong_threshold: f64,
    /// Top-score floor for using retrieved chunks with a partial-match disclaimer.
    #[serde(default = "default_weak_threshold")]
    pub weak_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            strong_threshold: default_strong_threshold(),
            weak_threshold: default_weak_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_strong_threshold() -> f64 {
    0.70
}
fn default_weak_threshold() -> f64 {
    0.40
}

/// Secondary web-search capability. Absence is a supported configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    /// One of `disabled`, `tavily`.
    #[serde(default = "default_search_provider")]
    pub provider: String,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            max_results: default_search_max_results(),
            timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_search_provider() -> String {
    "disabled".to_string()
}
fn default_search_max_results() -> usize {
    5
}
fn default_search_timeout_secs() -> u64 {
    10
}

impl WebSearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Blob storage for original file binaries. Upload failures never block
/// text extraction or storage.
#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    /// One of `disabled`, `local`, `s3`.
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    /// Root directory for the `local` backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Bucket for the `s3` backend.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_blob_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            root: None,
            bucket: None,
            region: default_blob_region(),
            endpoint_url: None,
        }
    }
}

fn default_blob_backend() -> String {
    "disabled".to_string()
}
fn default_blob_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// A `running` row older than this is treated as abandoned.
    #[serde(default = "default_staleness_minutes")]
    pub staleness_minutes: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staleness_minutes: default_staleness_minutes(),
        }
    }
}

fn default_staleness_minutes() -> i64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.lms.base_url.trim().is_empty() {
        anyhow::bail!("lms.base_url must not be empty");
    }

    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be smaller than chunking.chunk_chars");
    }

    if config.crawl.max_pages == 0 {
        anyhow::bail!("crawl.max_pages must be > 0");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.strong_threshold)
        || !(0.0..=1.0).contains(&config.retrieval.weak_threshold)
    {
        anyhow::bail!("retrieval thresholds must be in [0.0, 1.0]");
    }
    if config.retrieval.weak_threshold > config.retrieval.strong_threshold {
        anyhow::bail!("retrieval.weak_threshold must not exceed retrieval.strong_threshold");
    }

    if config.embedding.is_enabled() {
        if config.embedding.provider != "local" && config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    for provider in std::iter::once(config.embedding.provider.as_str())
        .chain(config.embedding.fallback_provider.as_deref())
    {
        match provider {
            "disabled" | "openai" | "cohere" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, cohere, or local.",
                other
            ),
        }
    }

    match config.websearch.provider.as_str() {
        "disabled" | "tavily" => {}
        other => anyhow::bail!(
            "Unknown websearch provider: '{}'. Must be disabled or tavily.",
            other
        ),
    }

    match config.blob.backend.as_str() {
        "disabled" => {}
        "local" => {
            if config.blob.root.is_none() {
                anyhow::bail!("blob.root must be set when blob.backend is 'local'");
            }
        }
        "s3" => {
            if config.blob.bucket.is_none() {
                anyhow::bail!("blob.bucket must be set when blob.backend is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown blob backend: '{}'. Must be disabled, local, or s3.",
            other
        ),
    }

    if config.sync.staleness_minutes <= 0 {
        anyhow::bail!("sync.staleness_minutes must be > 0");
    }

    Ok(config)
}
