//! Optional secondary web-search capability.
//!
//! Used by the fallback orchestrator when course retrieval comes back weak.
//! Absence is a supported configuration: [`create_search_provider`] returns
//! `None` for `disabled` and callers degrade to the general-knowledge tier.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::WebSearchConfig;

#[derive(Debug, Clone)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Provider-reported relevance in `[0, 1]`.
    pub relevance: f64,
}

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    async fn search(&self, topic: &str) -> Result<Vec<WebSearchResult>>;
}

/// Tavily-style JSON search API. The key is read from `TAVILY_API_KEY`.
pub struct TavilyProvider {
    client: reqwest::Client,
    max_results: usize,
}

impl TavilyProvider {
    pub fn new(config: &WebSearchConfig) -> Result<Self> {
        // Fail at construction, not per query.
        std::env::var("TAVILY_API_KEY")
            .context("TAVILY_API_KEY environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_results: config.max_results,
        })
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
}

#[async_trait]
impl WebSearchProvider for TavilyProvider {
    async fn search(&self, topic: &str) -> Result<Vec<WebSearchResult>> {
        let key = std::env::var("TAVILY_API_KEY")
            .context("TAVILY_API_KEY environment variable not set")?;
        let body = serde_json::json!({
            "api_key": key,
            "query": topic,
            "max_results": self.max_results,
        });
        let resp = self
            .client
            .post("https://api.tavily.com/search")
            .json(&body)
            .send()
            .await
            .context("web search request failed")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("web search failed (HTTP {})", status);
        }
        let parsed: TavilyResponse = resp
            .json()
            .await
            .context("web search response decode failed")?;
        Ok(parsed
            .results
            .into_iter()
            .map(|r| WebSearchResult {
                title: r.title,
                url: r.url,
                snippet: r.content,
                relevance: r.score.clamp(0.0, 1.0),
            })
            .collect())
    }
}

/// Build the configured provider, or `None` when web search is disabled.
pub fn create_search_provider(
    config: &WebSearchConfig,
) -> Result<Option<Box<dyn WebSearchProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "tavily" => Ok(Some(Box::new(TavilyProvider::new(config)?))),
        other => bail!("Unknown websearch provider: {}", other),
    }
}
