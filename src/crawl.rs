//! Bounded breadth-first crawler for hyperlinks found in course content.
//!
//! The crawler follows links out of LMS pages up to a page budget and a
//! depth limit, extracting text from every reachable HTML page and from
//! directly linked PDF/PPTX documents. A single unreachable or slow page is
//! skipped, never fatal. Fetching goes through the [`PageFetcher`] trait so
//! the traversal can be exercised against an in-memory site in tests.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;

use crate::config::CrawlConfig;
use crate::extract;

/// One successfully extracted external page.
#[derive(Debug, Clone)]
pub struct LinkedPage {
    /// Normalized URL (origin + path, query preserved, fragment stripped).
    pub url: String,
    pub title: Option<String>,
    pub text: String,
}

/// A fetched response body plus its content type.
pub struct FetchedPage {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Fetches one URL. Implementations must enforce their own timeout.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// Production fetcher with a bounded per-request timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetch failed: {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("fetch failed: {} (HTTP {})", url, status);
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = resp.bytes().await?.to_vec();
        Ok(FetchedPage {
            content_type,
            bytes,
        })
    }
}

/// Normalize a URL for the visited set: http(s) only, fragment stripped,
/// query preserved. Returns `None` for other schemes or unparseable input.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

pub struct LinkCrawler<'a> {
    fetcher: &'a dyn PageFetcher,
    config: &'a CrawlConfig,
}

impl<'a> LinkCrawler<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, config: &'a CrawlConfig) -> Self {
        Self { fetcher, config }
    }

    /// Breadth-first traversal from `seeds`. Stops when the page budget or
    /// the queue is exhausted; never visits the same normalized URL twice.
    pub async fn crawl(&self, seeds: &[String]) -> Vec<LinkedPage> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        for seed in seeds {
            if let Some(url) = normalize_url(seed) {
                if visited.insert(url.clone()) {
                    queue.push_back((url, 0));
                }
            }
        }

        let mut pages = Vec::new();

        while let Some((url, depth)) = queue.pop_front() {
            if pages.len() >= self.config.max_pages {
                break;
            }

            let fetched = match self.fetcher.fetch(&url).await {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: skipping crawled page: {}", e);
                    continue;
                }
            };

            match extract::classify(&fetched.content_type, &url) {
                Some(extract::MIME_HTML) => {
                    let html = String::from_utf8_lossy(&fetched.bytes).into_owned();

                    if depth < self.config.max_depth {
                        self.enqueue_links(&url, &html, depth, &mut visited, &mut queue);
                    }

                    let text = extract::html_to_text(&html);
                    if !text.is_empty() {
                        pages.push(LinkedPage {
                            url: url.clone(),
                            title: extract::html_title(&html),
                            text,
                        });
                    }
                }
                Some(_) => {
                    if let Some(text) = extract::extract(&fetched.bytes, &fetched.content_type, &url)
                    {
                        pages.push(LinkedPage {
                            url: url.clone(),
                            title: None,
                            text,
                        });
                    }
                }
                None => {}
            }
        }

        pages
    }

    fn enqueue_links(
        &self,
        base: &str,
        html: &str,
        depth: usize,
        visited: &mut HashSet<String>,
        queue: &mut VecDeque<(String, usize)>,
    ) {
        let base_url = match Url::parse(base) {
            Ok(u) => u,
            Err(_) => return,
        };
        let mut enqueued = 0;
        for href in extract::html_links(html) {
            if enqueued >= self.config.max_links_per_page {
                break;
            }
            let resolved = match base_url.join(&href) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            };
            if let Some(url) = normalize_url(&resolved) {
                if visited.insert(url.clone()) {
                    queue.push_back((url, depth + 1));
                    enqueued += 1;
                }
            }
        }
    }
}
