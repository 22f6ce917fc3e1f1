//! LMS (Canvas) API client.
//!
//! The [`LmsApi`] trait is the collaborator seam the walker drives; the
//! [`CanvasClient`] implementation speaks the Canvas REST API with
//! bearer-token auth and transparent Link-header pagination. A 404 on the
//! course front page is a valid "no front page" result, not an error.
//!
//! The access token is read from the `CANVAS_API_TOKEN` environment
//! variable.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::LmsConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Course {
    pub id: i64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Module {
    pub id: i64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleItem {
    pub id: i64,
    pub title: Option<String>,
    /// Canvas item type: `Page`, `Assignment`, `File`, `ExternalUrl`,
    /// `SubHeader`, ...
    #[serde(rename = "type")]
    pub item_type: String,
    /// Page slug, present for `Page` items.
    pub page_url: Option<String>,
    /// Assignment or file id, present for `Assignment`/`File` items.
    pub content_id: Option<i64>,
    /// Target URL, present for `ExternalUrl` items.
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    pub title: Option<String>,
    pub body: Option<String>,
    /// Page slug.
    pub url: Option<String>,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub id: i64,
    pub display_name: Option<String>,
    #[serde(rename = "content-type")]
    pub content_type: Option<String>,
    /// Download URL (pre-authenticated).
    pub url: Option<String>,
    pub size: Option<i64>,
}

#[async_trait]
pub trait LmsApi: Send + Sync {
    async fn list_courses(&self) -> Result<Vec<Course>>;
    async fn list_modules(&self, course_id: i64) -> Result<Vec<Module>>;
    async fn list_module_items(&self, course_id: i64, module_id: i64) -> Result<Vec<ModuleItem>>;
    async fn get_page(&self, course_id: i64, page_url: &str) -> Result<Page>;
    /// `Ok(None)` when the course has no front page.
    async fn get_front_page(&self, course_id: i64) -> Result<Option<Page>>;
    async fn get_assignment(&self, course_id: i64, assignment_id: i64) -> Result<Assignment>;
    async fn get_file_info(&self, file_id: i64) -> Result<FileInfo>;
    async fn download_file(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct CanvasClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl CanvasClient {
    pub fn from_config(config: &LmsConfig) -> Result<Self> {
        let token = std::env::var("CANVAS_API_TOKEN")
            .context("CANVAS_API_TOKEN environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// GET a paginated collection, following `Link: <...>; rel="next"`
    /// headers until the last page.
    async fn get_paginated<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut url = format!("{}?per_page=100", self.api_url(path));
        let mut out = Vec::new();
        loop {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await
                .with_context(|| format!("LMS request failed: {}", url))?;
            let status = resp.status();
            if !status.is_success() {
                bail!("LMS request failed: {} (HTTP {})", url, status);
            }
            let next = next_page_url(resp.headers());
            let batch: Vec<T> = resp
                .json()
                .await
                .with_context(|| format!("LMS response decode failed: {}", url))?;
            out.extend(batch);
            match next {
                Some(n) => url = n,
                None => break,
            }
        }
        Ok(out)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.api_url(path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("LMS request failed: {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("LMS request failed: {} (HTTP {})", url, status);
        }
        resp.json()
            .await
            .with_context(|| format!("LMS response decode failed: {}", url))
    }
}

/// Extract the `rel="next"` target from a Canvas `Link` header.
fn next_page_url(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    for part in link.split(',') {
        let mut segments = part.split(';');
        let url = segments.next()?.trim();
        let is_next = segments
            .any(|s| s.trim().eq_ignore_ascii_case("rel=\"next\""));
        if is_next {
            return Some(url.trim_start_matches('<').trim_end_matches('>').to_string());
        }
    }
    None
}

#[async_trait]
impl LmsApi for CanvasClient {
    async fn list_courses(&self) -> Result<Vec<Course>> {
        self.get_paginated("/courses").await
    }

    async fn list_modules(&self, course_id: i64) -> Result<Vec<Module>> {
        self.get_paginated(&format!("/courses/{}/modules", course_id))
            .await
    }

    async fn list_module_items(&self, course_id: i64, module_id: i64) -> Result<Vec<ModuleItem>> {
        self.get_paginated(&format!(
            "/courses/{}/modules/{}/items",
            course_id, module_id
        ))
        .await
    }

    async fn get_page(&self, course_id: i64, page_url: &str) -> Result<Page> {
        self.get_json(&format!("/courses/{}/pages/{}", course_id, page_url))
            .await
    }

    async fn get_front_page(&self, course_id: i64) -> Result<Option<Page>> {
        let url = self.api_url(&format!("/courses/{}/front_page", course_id));
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("LMS request failed: {}", url))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("LMS request failed: {} (HTTP {})", url, status);
        }
        let page: Page = resp
            .json()
            .await
            .with_context(|| format!("LMS response decode failed: {}", url))?;
        Ok(Some(page))
    }

    async fn get_assignment(&self, course_id: i64, assignment_id: i64) -> Result<Assignment> {
        self.get_json(&format!(
            "/courses/{}/assignments/{}",
            course_id, assignment_id
        ))
        .await
    }

    async fn get_file_info(&self, file_id: i64) -> Result<FileInfo> {
        self.get_json(&format!("/files/{}", file_id)).await
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("file download failed: {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("file download failed: {} (HTTP {})", url, status);
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, LINK};

    #[test]
    fn next_link_parsed_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://school.test/api/v1/courses?page=2&per_page=100>; rel=\"next\", \
                 <https://school.test/api/v1/courses?page=5&per_page=100>; rel=\"last\"",
            ),
        );
        assert_eq!(
            next_page_url(&headers).as_deref(),
            Some("https://school.test/api/v1/courses?page=2&per_page=100")
        );
    }

    #[test]
    fn no_next_link_on_last_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://school.test/api/v1/courses?page=5>; rel=\"last\"",
            ),
        );
        assert_eq!(next_page_url(&headers), None);
        assert_eq!(next_page_url(&HeaderMap::new()), None);
    }

    #[test]
    fn module_item_decodes_canvas_shape() {
        let json = r#"{
            "id": 44,
            "title": "Week 1 Reading",
            "type": "Page",
            "page_url": "week-1-reading",
            "html_url": "https://school.test/courses/1/pages/week-1-reading"
        }"#;
        let item: ModuleItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.item_type, "Page");
        assert_eq!(item.page_url.as_deref(), Some("week-1-reading"));
        assert!(item.content_id.is_none());
    }

    #[test]
    fn file_info_decodes_hyphenated_content_type() {
        let json = r#"{
            "id": 99,
            "display_name": "syllabus.pdf",
            "content-type": "application/pdf",
            "url": "https://school.test/files/99/download?verifier=abc",
            "size": 12345
        }"#;
        let info: FileInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.content_type.as_deref(), Some("application/pdf"));
    }
}
