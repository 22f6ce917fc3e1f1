//! LMS Content Walker.
//!
//! Walks one course's modules and items, extracts text from each item, and
//! link-crawls page/assignment bodies for external material. Results are
//! streamed over a channel as [`WalkEvent`]s so the consumer can persist
//! incrementally instead of buffering a whole course; a bounded channel
//! gives the walk natural backpressure against persistence latency.
//!
//! Per-item failures are logged and skipped. The walk only fails as a whole
//! when the LMS module listing itself is unreachable or the consumer goes
//! away.

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::blob::BlobStore;
use crate::config::CrawlConfig;
use crate::crawl::{normalize_url, LinkCrawler, PageFetcher};
use crate::extract;
use crate::lms::{Course, LmsApi, ModuleItem};
use crate::models::{Material, MaterialKind, Provenance};

/// Events streamed out of a course walk.
#[derive(Debug)]
pub enum WalkEvent {
    /// Narration: one module item read.
    ItemRead {
        message: String,
        index: u64,
        total: u64,
    },
    /// One extracted, non-empty material, ready to store.
    Material(Material),
}

pub struct Walker<'a> {
    pub lms: &'a dyn LmsApi,
    pub fetcher: &'a dyn PageFetcher,
    pub crawl: &'a CrawlConfig,
    pub blob: &'a dyn BlobStore,
}

impl<'a> Walker<'a> {
    /// Walk one course, sending events to `tx`. Returns when every module
    /// item has been visited.
    pub async fn walk_course(&self, course: &Course, tx: &mpsc::Sender<WalkEvent>) -> Result<()> {
        // Dedupe within one walk: link crawling from multiple items can
        // discover the same external page more than once.
        let mut seen: HashSet<String> = HashSet::new();

        let modules = self.lms.list_modules(course.id).await?;
        let mut entries: Vec<(Option<String>, ModuleItem)> = Vec::new();
        for module in &modules {
            match self.lms.list_module_items(course.id, module.id).await {
                Ok(items) => {
                    entries.extend(items.into_iter().map(|item| (module.name.clone(), item)));
                }
                Err(e) => {
                    eprintln!("Warning: skipping module {}: {}", module.id, e);
                }
            }
        }

        let total = entries.len() as u64 + 1;
        let mut index = 0u64;

        // The course landing page always goes first and is link-crawled
        // like any other page.
        match self.lms.get_front_page(course.id).await {
            Ok(Some(page)) => {
                let title = page.title.clone().unwrap_or_else(|| "front page".to_string());
                self.emit_item(tx, format!("Reading front page '{}'", title), index, total)
                    .await?;
                if let Some(body) = page.body.as_deref() {
                    self.ingest_html(
                        "page-front",
                        MaterialKind::Page,
                        page.title.clone(),
                        page.html_url.clone(),
                        None,
                        body,
                        &mut seen,
                        tx,
                    )
                    .await?;
                }
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("Warning: front page for course {}: {}", course.id, e);
            }
        }
        index += 1;

        for (module_name, item) in entries {
            if let Err(e) = self
                .walk_item(course, &module_name, &item, index, total, &mut seen, tx)
                .await
            {
                // Consumer-side closure is the one walk-fatal case.
                if tx.is_closed() {
                    return Err(e);
                }
                eprintln!(
                    "Warning: skipping item {} ('{}'): {}",
                    item.id,
                    item.title.as_deref().unwrap_or(""),
                    e
                );
            }
            index += 1;
        }

        Ok(())
    }

    async fn walk_item(
        &self,
        course: &Course,
        module_name: &Option<String>,
        item: &ModuleItem,
        index: u64,
        total: u64,
        seen: &mut HashSet<String>,
        tx: &mpsc::Sender<WalkEvent>,
    ) -> Result<()> {
        let title = item.title.clone().unwrap_or_default();
        match item.item_type.as_str() {
            "Page" => {
                let slug = item
                    .page_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("page item without page_url"))?;
                self.emit_item(tx, format!("Reading page '{}'", title), index, total)
                    .await?;
                let page = self.lms.get_page(course.id, slug).await?;
                if let Some(body) = page.body.as_deref() {
                    self.ingest_html(
                        &format!("page-{}", slug),
                        MaterialKind::Page,
                        page.title.clone().or(item.title.clone()),
                        page.html_url.clone(),
                        module_name.clone(),
                        body,
                        seen,
                        tx,
                    )
                    .await?;
                }
            }
            "Assignment" => {
                let assignment_id = item
                    .content_id
                    .ok_or_else(|| anyhow!("assignment item without content_id"))?;
                self.emit_item(tx, format!("Reading assignment '{}'", title), index, total)
                    .await?;
                let assignment = self.lms.get_assignment(course.id, assignment_id).await?;
                if let Some(body) = assignment.description.as_deref() {
                    self.ingest_html(
                        &format!("assignment-{}", assignment_id),
                        MaterialKind::Assignment,
                        assignment.name.clone().or(item.title.clone()),
                        assignment.html_url.clone(),
                        module_name.clone(),
                        body,
                        seen,
                        tx,
                    )
                    .await?;
                }
            }
            "File" => {
                let file_id = item
                    .content_id
                    .ok_or_else(|| anyhow!("file item without content_id"))?;
                self.emit_item(tx, format!("Reading file '{}'", title), index, total)
                    .await?;
                self.ingest_file(course, file_id, module_name.clone(), seen, tx)
                    .await?;
            }
            "ExternalUrl" => {
                let url = item
                    .external_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("external url item without target"))?;
                self.emit_item(tx, format!("Reading linked page '{}'", title), index, total)
                    .await?;
                self.crawl_links(
                    &[url.to_string()],
                    &format!("item-{}", item.id),
                    module_name.clone(),
                    seen,
                    tx,
                )
                .await?;
            }
            // SubHeader and other navigation-only item types carry no content.
            _ => {
                self.emit_item(tx, format!("Skipping '{}'", title), index, total)
                    .await?;
            }
        }
        Ok(())
    }

    /// Extract an HTML body into a material, then crawl its hyperlinks.
    #[allow(clippy::too_many_arguments)]
    async fn ingest_html(
        &self,
        item_id: &str,
        kind: MaterialKind,
        title: Option<String>,
        source_url: Option<String>,
        module_name: Option<String>,
        body: &str,
        seen: &mut HashSet<String>,
        tx: &mpsc::Sender<WalkEvent>,
    ) -> Result<()> {
        let text = extract::html_to_text(body);
        if !text.is_empty() && seen.insert(item_id.to_string()) {
            self.emit_material(
                tx,
                Material {
                    item_id: item_id.to_string(),
                    kind,
                    text,
                    title,
                    source_url,
                    module_name: module_name.clone(),
                    provenance: Provenance::Native,
                    linked_from: None,
                },
            )
            .await?;
        }

        let links: Vec<String> = extract::html_links(body)
            .into_iter()
            .filter(|href| normalize_url(href).is_some())
            .collect();
        if !links.is_empty() {
            self.crawl_links(&links, item_id, module_name, seen, tx).await?;
        }
        Ok(())
    }

    /// Crawl outward from `seeds`, attributing discovered pages back to the
    /// originating item.
    async fn crawl_links(
        &self,
        seeds: &[String],
        linked_from: &str,
        module_name: Option<String>,
        seen: &mut HashSet<String>,
        tx: &mpsc::Sender<WalkEvent>,
    ) -> Result<()> {
        let crawler = LinkCrawler::new(self.fetcher, self.crawl);
        for page in crawler.crawl(seeds).await {
            let item_id = crawled_item_id(&page.url);
            if !seen.insert(item_id.clone()) {
                continue;
            }
            self.emit_material(
                tx,
                Material {
                    item_id,
                    kind: MaterialKind::CrawledPage,
                    text: page.text,
                    title: page.title,
                    source_url: Some(page.url),
                    module_name: module_name.clone(),
                    provenance: Provenance::Linked,
                    linked_from: Some(linked_from.to_string()),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn ingest_file(
        &self,
        course: &Course,
        file_id: i64,
        module_name: Option<String>,
        seen: &mut HashSet<String>,
        tx: &mpsc::Sender<WalkEvent>,
    ) -> Result<()> {
        let info = self.lms.get_file_info(file_id).await?;
        let name = info
            .display_name
            .clone()
            .unwrap_or_else(|| format!("file-{}", file_id));
        let url = info
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("file {} has no download url", file_id))?;
        let bytes = self.lms.download_file(url).await?;

        // Original binary kept on the side; failure here never blocks the
        // extracted text.
        let blob_path = format!("courses/{}/files/{}-{}", course.id, file_id, name);
        if let Err(e) = self.blob.upload(&bytes, &blob_path).await {
            eprintln!("Warning: blob upload failed for '{}': {}", name, e);
        }

        let content_type = info.content_type.as_deref().unwrap_or("");
        let item_id = format!("file-{}", file_id);
        if let Some(text) = extract::extract(&bytes, content_type, &name) {
            if seen.insert(item_id.clone()) {
                self.emit_material(
                    tx,
                    Material {
                        item_id,
                        kind: MaterialKind::File,
                        text,
                        title: Some(name),
                        source_url: info.url.clone(),
                        module_name,
                        provenance: Provenance::Native,
                        linked_from: None,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn emit_item(
        &self,
        tx: &mpsc::Sender<WalkEvent>,
        message: String,
        index: u64,
        total: u64,
    ) -> Result<()> {
        tx.send(WalkEvent::ItemRead {
            message,
            index,
            total,
        })
        .await
        .map_err(|_| anyhow!("walk consumer closed"))
    }

    async fn emit_material(&self, tx: &mpsc::Sender<WalkEvent>, material: Material) -> Result<()> {
        tx.send(WalkEvent::Material(material))
            .await
            .map_err(|_| anyhow!("walk consumer closed"))
    }
}

/// Stable item id for a crawled page, derived from its normalized URL.
pub fn crawled_item_id(normalized_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("crawled-{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::DisabledBlobStore;
    use crate::crawl::FetchedPage;
    use crate::lms::{Assignment, Course, FileInfo, Module, Page};
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn long_para(label: &str) -> String {
        format!(
            "<p>{} — enough prose here to clear the extractor's fifty character noise floor comfortably.</p>",
            label
        )
    }

    struct MockLms {
        pages: HashMap<String, Page>,
        front_page: Option<Page>,
        items: Vec<ModuleItem>,
        assignments: HashMap<i64, Assignment>,
    }

    #[async_trait]
    impl LmsApi for MockLms {
        async fn list_courses(&self) -> Result<Vec<Course>> {
            Ok(vec![Course {
                id: 1,
                name: Some("Course".to_string()),
            }])
        }
        async fn list_modules(&self, _course_id: i64) -> Result<Vec<Module>> {
            Ok(vec![Module {
                id: 10,
                name: Some("Module A".to_string()),
            }])
        }
        async fn list_module_items(
            &self,
            _course_id: i64,
            _module_id: i64,
        ) -> Result<Vec<ModuleItem>> {
            Ok(self.items.clone())
        }
        async fn get_page(&self, _course_id: i64, page_url: &str) -> Result<Page> {
            self.pages
                .get(page_url)
                .cloned()
                .ok_or_else(|| anyhow!("no such page"))
        }
        async fn get_front_page(&self, _course_id: i64) -> Result<Option<Page>> {
            Ok(self.front_page.clone())
        }
        async fn get_assignment(&self, _course_id: i64, assignment_id: i64) -> Result<Assignment> {
            self.assignments
                .get(&assignment_id)
                .cloned()
                .ok_or_else(|| anyhow!("no such assignment"))
        }
        async fn get_file_info(&self, _file_id: i64) -> Result<FileInfo> {
            anyhow::bail!("no files in this mock")
        }
        async fn download_file(&self, _url: &str) -> Result<Vec<u8>> {
            anyhow::bail!("no files in this mock")
        }
    }

    struct MockFetcher {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl PageFetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            match self.pages.get(url) {
                Some(html) => Ok(FetchedPage {
                    content_type: "text/html".to_string(),
                    bytes: html.as_bytes().to_vec(),
                }),
                None => anyhow::bail!("404: {}", url),
            }
        }
    }

    fn page_item(id: i64, slug: &str) -> ModuleItem {
        ModuleItem {
            id,
            title: Some(slug.to_string()),
            item_type: "Page".to_string(),
            page_url: Some(slug.to_string()),
            content_id: None,
            external_url: None,
        }
    }

    async fn collect_walk(lms: &MockLms, fetcher: &MockFetcher) -> Vec<Material> {
        let crawl_cfg = crate::config::CrawlConfig::default();
        let blob = DisabledBlobStore;
        let walker = Walker {
            lms,
            fetcher,
            crawl: &crawl_cfg,
            blob: &blob,
        };
        let course = Course {
            id: 1,
            name: Some("Course".to_string()),
        };
        let (tx, mut rx) = mpsc::channel(64);
        let consume = async {
            let mut materials = Vec::new();
            while let Some(ev) = rx.recv().await {
                if let WalkEvent::Material(m) = ev {
                    materials.push(m);
                }
            }
            materials
        };
        let (walk_res, materials) = tokio::join!(
            async {
                let r = walker.walk_course(&course, &tx).await;
                drop(tx);
                r
            },
            consume
        );
        walk_res.unwrap();
        materials
    }

    #[tokio::test]
    async fn two_items_linking_same_url_yield_one_material() {
        let external = format!(
            "<html><body>{}</body></html>",
            long_para("shared external resource")
        );
        let body_a = format!(
            "<html><body>{}<a href=\"http://ext.test/shared\">shared</a></body></html>",
            long_para("page a content")
        );
        let body_b = format!(
            "<html><body>{}<a href=\"http://ext.test/shared#frag\">shared</a></body></html>",
            long_para("page b content")
        );

        let mut pages = HashMap::new();
        pages.insert(
            "page-a".to_string(),
            Page {
                title: Some("A".to_string()),
                body: Some(body_a),
                url: Some("page-a".to_string()),
                html_url: None,
            },
        );
        pages.insert(
            "page-b".to_string(),
            Page {
                title: Some("B".to_string()),
                body: Some(body_b),
                url: Some("page-b".to_string()),
                html_url: None,
            },
        );
        let lms = MockLms {
            pages,
            front_page: None,
            items: vec![page_item(1, "page-a"), page_item(2, "page-b")],
            assignments: HashMap::new(),
        };
        let mut fetched = HashMap::new();
        fetched.insert("http://ext.test/shared".to_string(), external);
        let fetcher = MockFetcher { pages: fetched };

        let materials = collect_walk(&lms, &fetcher).await;
        let crawled: Vec<&Material> = materials
            .iter()
            .filter(|m| m.kind == MaterialKind::CrawledPage)
            .collect();
        assert_eq!(crawled.len(), 1, "same URL must yield exactly one material");
        assert_eq!(crawled[0].provenance, Provenance::Linked);
        assert_eq!(crawled[0].linked_from.as_deref(), Some("page-page-a"));
        assert_eq!(materials.len(), 3);
    }

    #[tokio::test]
    async fn front_page_is_walked_first() {
        let front = Page {
            title: Some("Welcome".to_string()),
            body: Some(format!(
                "<html><body>{}</body></html>",
                long_para("welcome to the course")
            )),
            url: None,
            html_url: None,
        };
        let mut pages = HashMap::new();
        pages.insert(
            "week-1".to_string(),
            Page {
                title: Some("Week 1".to_string()),
                body: Some(format!(
                    "<html><body>{}</body></html>",
                    long_para("week one content")
                )),
                url: Some("week-1".to_string()),
                html_url: None,
            },
        );
        let lms = MockLms {
            pages,
            front_page: Some(front),
            items: vec![page_item(1, "week-1")],
            assignments: HashMap::new(),
        };
        let fetcher = MockFetcher {
            pages: HashMap::new(),
        };

        let materials = collect_walk(&lms, &fetcher).await;
        assert_eq!(materials.len(), 2);
        assert_eq!(materials[0].item_id, "page-front");
        assert_eq!(materials[1].item_id, "page-week-1");
    }

    #[tokio::test]
    async fn unreadable_item_is_skipped_not_fatal() {
        let mut pages = HashMap::new();
        pages.insert(
            "good".to_string(),
            Page {
                title: Some("Good".to_string()),
                body: Some(format!(
                    "<html><body>{}</body></html>",
                    long_para("good page content")
                )),
                url: Some("good".to_string()),
                html_url: None,
            },
        );
        let lms = MockLms {
            pages,
            front_page: None,
            items: vec![page_item(1, "missing"), page_item(2, "good")],
            assignments: HashMap::new(),
        };
        let fetcher = MockFetcher {
            pages: HashMap::new(),
        };

        let materials = collect_walk(&lms, &fetcher).await;
        assert_eq!(materials.len(), 1);
        assert_eq!(materials[0].item_id, "page-good");
    }

    #[tokio::test]
    async fn empty_extraction_is_discarded() {
        let mut pages = HashMap::new();
        pages.insert(
            "thin".to_string(),
            Page {
                title: Some("Thin".to_string()),
                body: Some("<html><body><p>tiny</p></body></html>".to_string()),
                url: Some("thin".to_string()),
                html_url: None,
            },
        );
        let lms = MockLms {
            pages,
            front_page: None,
            items: vec![page_item(1, "thin")],
            assignments: HashMap::new(),
        };
        let fetcher = MockFetcher {
            pages: HashMap::new(),
        };

        let materials = collect_walk(&lms, &fetcher).await;
        assert!(materials.is_empty());
    }

    #[test]
    fn crawled_ids_are_stable_and_distinct() {
        let a = crawled_item_id("http://ext.test/a");
        let b = crawled_item_id("http://ext.test/b");
        assert_eq!(a, crawled_item_id("http://ext.test/a"));
        assert_ne!(a, b);
        assert!(a.starts_with("crawled-"));
    }
}
