//! End-to-end sync tests: a full walk over a mock LMS, resume after an
//! interrupted run, and the persisted progress row observers poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use canvas_context::blob::DisabledBlobStore;
use canvas_context::config::{
    ChunkingConfig, Config, CrawlConfig, DbConfig, EmbeddingConfig, LmsConfig, RetrievalConfig,
    SyncConfig, WebSearchConfig,
};
use canvas_context::crawl::{FetchedPage, PageFetcher};
use canvas_context::embedding::{EmbedPurpose, Embedder};
use canvas_context::lms::{Assignment, Course, FileInfo, LmsApi, Module, ModuleItem, Page};
use canvas_context::migrate;
use canvas_context::progress::NoProgress;
use canvas_context::sync::{self, SyncStatus};

struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String], _purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0, 0.25])
            .collect())
    }
}

/// No external links in these fixtures, so every fetch is a miss.
struct NoFetcher;

#[async_trait]
impl PageFetcher for NoFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        anyhow::bail!("unexpected fetch: {}", url)
    }
}

/// Ten single-page courses; records which courses were walked.
struct MockLms {
    courses: Vec<Course>,
    pages: HashMap<i64, Page>,
    walked: Arc<Mutex<Vec<i64>>>,
}

impl MockLms {
    fn new(course_count: i64) -> Self {
        let mut courses = Vec::new();
        let mut pages = HashMap::new();
        for id in 0..course_count {
            courses.push(Course {
                id,
                name: Some(format!("Course {}", id)),
            });
            pages.insert(
                id,
                Page {
                    title: Some(format!("Overview {}", id)),
                    body: Some(format!(
                        "<html><body><p>Course {} overview with enough body text to clear \
                         the extractor's noise floor and produce a stored material.</p></body></html>",
                        id
                    )),
                    url: Some("overview".to_string()),
                    html_url: None,
                },
            );
        }
        Self {
            courses,
            pages,
            walked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn walked_courses(&self) -> Vec<i64> {
        self.walked.lock().unwrap().clone()
    }
}

#[async_trait]
impl LmsApi for MockLms {
    async fn list_courses(&self) -> Result<Vec<Course>> {
        Ok(self.courses.clone())
    }
    async fn list_modules(&self, course_id: i64) -> Result<Vec<Module>> {
        self.walked.lock().unwrap().push(course_id);
        Ok(vec![Module {
            id: 1,
            name: Some("Module".to_string()),
        }])
    }
    async fn list_module_items(&self, course_id: i64, _module_id: i64) -> Result<Vec<ModuleItem>> {
        Ok(vec![ModuleItem {
            id: course_id * 100 + 1,
            title: Some("Overview".to_string()),
            item_type: "Page".to_string(),
            page_url: Some(format!("overview-{}", course_id)),
            content_id: None,
            external_url: None,
        }])
    }
    async fn get_page(&self, course_id: i64, _page_url: &str) -> Result<Page> {
        self.pages
            .get(&course_id)
            .cloned()
            .ok_or_else(|| anyhow!("no page for course {}", course_id))
    }
    async fn get_front_page(&self, _course_id: i64) -> Result<Option<Page>> {
        Ok(None)
    }
    async fn get_assignment(&self, _course_id: i64, _assignment_id: i64) -> Result<Assignment> {
        anyhow::bail!("no assignments in this mock")
    }
    async fn get_file_info(&self, _file_id: i64) -> Result<FileInfo> {
        anyhow::bail!("no files in this mock")
    }
    async fn download_file(&self, _url: &str) -> Result<Vec<u8>> {
        anyhow::bail!("no files in this mock")
    }
}

fn test_config() -> Config {
    Config {
        db: DbConfig {
            path: ":memory:".into(),
        },
        lms: LmsConfig {
            base_url: "https://school.test".to_string(),
            timeout_secs: 5,
        },
        crawl: CrawlConfig::default(),
        chunking: ChunkingConfig::default(),
        embedding: EmbeddingConfig::default(),
        retrieval: RetrievalConfig::default(),
        websearch: WebSearchConfig::default(),
        blob: canvas_context::config::BlobConfig::default(),
        sync: SyncConfig::default(),
    }
}

async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

fn deps(pool: &SqlitePool, lms: Arc<MockLms>) -> sync::SyncDeps {
    sync::SyncDeps {
        config: test_config(),
        pool: pool.clone(),
        lms,
        fetcher: Arc::new(NoFetcher),
        embedder: Arc::new(StubEmbedder),
        blob: Arc::new(DisabledBlobStore),
        reporter: Arc::new(NoProgress),
    }
}

#[tokio::test]
async fn full_sync_walks_every_course_and_completes() {
    let pool = test_pool().await;
    let lms = Arc::new(MockLms::new(10));
    let deps = deps(&pool, lms.clone());

    sync::run_sync(&deps, "tenant-1").await.unwrap();

    let row = sync::load_progress(&pool, "tenant-1").await.unwrap().unwrap();
    assert_eq!(row.status, SyncStatus::Completed);
    assert_eq!(row.course_total, 10);
    assert_eq!(row.materials_stored, 10);
    assert!(row.chunks_created >= 10);
    assert_eq!(lms.walked_courses(), (0..10).collect::<Vec<_>>());

    let summary = row.summary.unwrap();
    assert_eq!(summary["courses"], 10);
    assert_eq!(summary["materials_stored"], 10);
}

#[tokio::test]
async fn interrupted_sync_resumes_from_recorded_course() {
    let pool = test_pool().await;
    let lms = Arc::new(MockLms::new(10));
    let deps = deps(&pool, lms.clone());

    // Simulate a run that died while walking course 3: the row is still
    // `running`, three courses' counters are in, course_index is 3.
    sync::try_begin(&pool, "tenant-1", 30).await.unwrap();
    sqlx::query(
        "UPDATE sync_progress SET course_index = 3, course_total = 10, \
         materials_stored = 3, chunks_created = 3 WHERE tenant_id = 'tenant-1'",
    )
    .execute(&pool)
    .await
    .unwrap();

    sync::run_sync(&deps, "tenant-1").await.unwrap();

    // Courses 0..2 are not re-walked; counters carry over.
    assert_eq!(lms.walked_courses(), (3..10).collect::<Vec<_>>());
    let row = sync::load_progress(&pool, "tenant-1").await.unwrap().unwrap();
    assert_eq!(row.status, SyncStatus::Completed);
    assert_eq!(row.materials_stored, 10);
    assert_eq!(row.chunks_created, 10);
}

#[tokio::test]
async fn second_sync_over_unchanged_courses_stores_nothing_new() {
    let pool = test_pool().await;
    let lms = Arc::new(MockLms::new(4));
    let deps = deps(&pool, lms.clone());

    sync::run_sync(&deps, "tenant-1").await.unwrap();
    let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await
        .unwrap();

    sync::run_sync(&deps, "tenant-1").await.unwrap();
    let row = sync::load_progress(&pool, "tenant-1").await.unwrap().unwrap();
    assert_eq!(row.status, SyncStatus::Completed);
    // The second run skipped every material, so its counters are zero...
    assert_eq!(row.materials_stored, 0);
    // ...and no additional chunk rows exist.
    let chunk_count_after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(chunk_count_after, chunk_count);
}

#[tokio::test]
async fn detached_sync_is_observable_through_the_progress_row() {
    let pool = test_pool().await;
    let lms = Arc::new(MockLms::new(3));
    let deps = deps(&pool, lms.clone());

    let handle = sync::spawn_sync(deps, "tenant-1".to_string());

    // An observer sees the run through the persisted row only.
    let mut status = None;
    for _ in 0..200 {
        if let Some(row) = sync::load_progress(&pool, "tenant-1").await.unwrap() {
            status = Some(row.status);
            if row.status == SyncStatus::Completed {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    handle.await.unwrap();

    assert_eq!(status, Some(SyncStatus::Completed));
    let row = sync::load_progress(&pool, "tenant-1").await.unwrap().unwrap();
    assert_eq!(row.materials_stored, 3);
}

#[tokio::test]
async fn failed_course_listing_flips_status_to_failed() {
    struct BrokenLms;

    #[async_trait]
    impl LmsApi for BrokenLms {
        async fn list_courses(&self) -> Result<Vec<Course>> {
            anyhow::bail!("LMS unreachable")
        }
        async fn list_modules(&self, _c: i64) -> Result<Vec<Module>> {
            unreachable!()
        }
        async fn list_module_items(&self, _c: i64, _m: i64) -> Result<Vec<ModuleItem>> {
            unreachable!()
        }
        async fn get_page(&self, _c: i64, _p: &str) -> Result<Page> {
            unreachable!()
        }
        async fn get_front_page(&self, _c: i64) -> Result<Option<Page>> {
            unreachable!()
        }
        async fn get_assignment(&self, _c: i64, _a: i64) -> Result<Assignment> {
            unreachable!()
        }
        async fn get_file_info(&self, _f: i64) -> Result<FileInfo> {
            unreachable!()
        }
        async fn download_file(&self, _u: &str) -> Result<Vec<u8>> {
            unreachable!()
        }
    }

    let pool = test_pool().await;
    let deps = sync::SyncDeps {
        config: test_config(),
        pool: pool.clone(),
        lms: Arc::new(BrokenLms),
        fetcher: Arc::new(NoFetcher),
        embedder: Arc::new(StubEmbedder),
        blob: Arc::new(DisabledBlobStore),
        reporter: Arc::new(NoProgress),
    };

    assert!(sync::run_sync(&deps, "tenant-1").await.is_err());
    let row = sync::load_progress(&pool, "tenant-1").await.unwrap().unwrap();
    assert_eq!(row.status, SyncStatus::Failed);
    assert!(row.error.unwrap().contains("LMS unreachable"));
}

#[tokio::test]
async fn cancel_mid_run_stops_at_the_next_course_boundary() {
    /// Delegates to the mock, but fires a cancel while course 2 is being
    /// walked, the way an external observer would.
    struct CancellingLms {
        inner: Arc<MockLms>,
        pool: SqlitePool,
    }

    #[async_trait]
    impl LmsApi for CancellingLms {
        async fn list_courses(&self) -> Result<Vec<Course>> {
            self.inner.list_courses().await
        }
        async fn list_modules(&self, course_id: i64) -> Result<Vec<Module>> {
            if course_id == 2 {
                sync::cancel_sync(&self.pool, "tenant-1").await?;
            }
            self.inner.list_modules(course_id).await
        }
        async fn list_module_items(&self, c: i64, m: i64) -> Result<Vec<ModuleItem>> {
            self.inner.list_module_items(c, m).await
        }
        async fn get_page(&self, c: i64, p: &str) -> Result<Page> {
            self.inner.get_page(c, p).await
        }
        async fn get_front_page(&self, c: i64) -> Result<Option<Page>> {
            self.inner.get_front_page(c).await
        }
        async fn get_assignment(&self, c: i64, a: i64) -> Result<Assignment> {
            self.inner.get_assignment(c, a).await
        }
        async fn get_file_info(&self, f: i64) -> Result<FileInfo> {
            self.inner.get_file_info(f).await
        }
        async fn download_file(&self, u: &str) -> Result<Vec<u8>> {
            self.inner.download_file(u).await
        }
    }

    let pool = test_pool().await;
    let inner = Arc::new(MockLms::new(5));
    let deps = sync::SyncDeps {
        config: test_config(),
        pool: pool.clone(),
        lms: Arc::new(CancellingLms {
            inner: inner.clone(),
            pool: pool.clone(),
        }),
        fetcher: Arc::new(NoFetcher),
        embedder: Arc::new(StubEmbedder),
        blob: Arc::new(DisabledBlobStore),
        reporter: Arc::new(NoProgress),
    };

    sync::run_sync(&deps, "tenant-1").await.unwrap();

    // Course 2 finishes (cancellation is cooperative, not mid-course), and
    // the boundary check stops the run before course 3.
    assert_eq!(inner.walked_courses(), vec![0, 1, 2]);
    let row = sync::load_progress(&pool, "tenant-1").await.unwrap().unwrap();
    assert_eq!(row.status, SyncStatus::Idle);
}
