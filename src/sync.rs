//! Resumable sync state machine and the full-sync driver.
//!
//! All progress lives in one `sync_progress` row per tenant: the running
//! task writes it, and every observer (`cvx status`, a cancel request, a
//! restarted process deciding whether to resume) polls the same row. There
//! is no in-memory-only progress channel.
//!
//! States: `idle → running → {completed, failed}`, with `running`
//! re-enterable via resume and `running → idle` on cancel. Transitions are
//! guarded in SQL (`... WHERE status = 'running'`): an illegal transition
//! is rejected with an error, never silently overwritten.
//!
//! Cancellation and staleness are both poll-based: the driver re-reads its
//! own status before each course, and a `running` row whose start
//! timestamp is older than the staleness window is treated as abandoned.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::crawl::PageFetcher;
use crate::embedding::{is_auth_error, Embedder};
use crate::lms::LmsApi;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::store::{self, MaterialOutcome};
use crate::walk::{WalkEvent, Walker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => bail!("unknown sync status: {}", other),
        }
    }
}

/// Read-only snapshot of one tenant's sync progress.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub tenant_id: String,
    pub status: SyncStatus,
    pub phase: String,
    pub course_index: i64,
    pub course_total: i64,
    pub materials_stored: i64,
    pub chunks_created: i64,
    pub course_materials: i64,
    pub course_chunks: i64,
    pub message: String,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub started_at: i64,
    pub updated_at: i64,
}

pub async fn load_progress(pool: &SqlitePool, tenant: &str) -> Result<Option<SyncProgress>> {
    let row = sqlx::query("SELECT * FROM sync_progress WHERE tenant_id = ?")
        .bind(tenant)
        .fetch_optional(pool)
        .await?;
    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };
    let status: String = row.get("status");
    let summary_json: Option<String> = row.get("summary_json");
    Ok(Some(SyncProgress {
        tenant_id: row.get("tenant_id"),
        status: SyncStatus::parse(&status)?,
        phase: row.get("phase"),
        course_index: row.get("course_index"),
        course_total: row.get("course_total"),
        materials_stored: row.get("materials_stored"),
        chunks_created: row.get("chunks_created"),
        course_materials: row.get("course_materials"),
        course_chunks: row.get("course_chunks"),
        message: row.get("message"),
        error: row.get("error"),
        summary: summary_json.and_then(|s| serde_json::from_str(&s).ok()),
        started_at: row.get("started_at"),
        updated_at: row.get("updated_at"),
    }))
}

/// How a sync run starts: from scratch, or picking up an abandoned run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginSync {
    Fresh,
    Resumed {
        course_index: i64,
        materials_stored: i64,
        chunks_created: i64,
    },
}

/// Claim the tenant's progress row for a new run.
///
/// A `running` row started within the staleness window is resumed from its
/// recorded course index with its cumulative counters intact; an older one
/// is abandoned and the run starts fresh with zeroed counters.
pub async fn try_begin(pool: &SqlitePool, tenant: &str, staleness_minutes: i64) -> Result<BeginSync> {
    let now = chrono::Utc::now().timestamp();

    if let Some(row) = load_progress(pool, tenant).await? {
        if row.status == SyncStatus::Running {
            let age_minutes = (now - row.started_at) / 60;
            if age_minutes < staleness_minutes {
                sqlx::query(
                    r#"
                    UPDATE sync_progress
                    SET message = 'resuming interrupted sync', error = NULL,
                        started_at = ?, updated_at = ?
                    WHERE tenant_id = ? AND status = 'running'
                    "#,
                )
                .bind(now)
                .bind(now)
                .bind(tenant)
                .execute(pool)
                .await?;
                return Ok(BeginSync::Resumed {
                    course_index: row.course_index,
                    materials_stored: row.materials_stored,
                    chunks_created: row.chunks_created,
                });
            }
        }
    }

    sqlx::query(
        r#"
        INSERT INTO sync_progress (tenant_id, status, phase, course_index, course_total,
                                   materials_stored, chunks_created, course_materials,
                                   course_chunks, message, error, summary_json,
                                   started_at, updated_at)
        VALUES (?, 'running', 'starting', 0, 0, 0, 0, 0, 0, 'sync started', NULL, NULL, ?, ?)
        ON CONFLICT(tenant_id) DO UPDATE SET
            status = 'running', phase = 'starting',
            course_index = 0, course_total = 0,
            materials_stored = 0, chunks_created = 0,
            course_materials = 0, course_chunks = 0,
            message = 'sync started', error = NULL, summary_json = NULL,
            started_at = excluded.started_at, updated_at = excluded.updated_at
        "#,
    )
    .bind(tenant)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(BeginSync::Fresh)
}

async fn course_boundary(
    pool: &SqlitePool,
    tenant: &str,
    course_index: i64,
    course_total: i64,
    message: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let n = sqlx::query(
        r#"
        UPDATE sync_progress
        SET phase = 'walking', course_index = ?, course_total = ?,
            course_materials = 0, course_chunks = 0, message = ?, updated_at = ?
        WHERE tenant_id = ? AND status = 'running'
        "#,
    )
    .bind(course_index)
    .bind(course_total)
    .bind(message)
    .bind(now)
    .bind(tenant)
    .execute(pool)
    .await?
    .rows_affected();
    if n == 0 {
        bail!("sync for '{}' is no longer running", tenant);
    }
    Ok(())
}

async fn update_counters(
    pool: &SqlitePool,
    tenant: &str,
    materials_stored: i64,
    chunks_created: i64,
    course_materials: i64,
    course_chunks: i64,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE sync_progress
        SET materials_stored = ?, chunks_created = ?,
            course_materials = ?, course_chunks = ?, updated_at = ?
        WHERE tenant_id = ? AND status = 'running'
        "#,
    )
    .bind(materials_stored)
    .bind(chunks_created)
    .bind(course_materials)
    .bind(course_chunks)
    .bind(now)
    .bind(tenant)
    .execute(pool)
    .await?;
    Ok(())
}

/// `running → completed`. Rejected when the row is not running.
pub async fn complete_sync(
    pool: &SqlitePool,
    tenant: &str,
    summary: &serde_json::Value,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let n = sqlx::query(
        r#"
        UPDATE sync_progress
        SET status = 'completed', phase = 'done', message = 'sync completed',
            summary_json = ?, updated_at = ?
        WHERE tenant_id = ? AND status = 'running'
        "#,
    )
    .bind(summary.to_string())
    .bind(now)
    .bind(tenant)
    .execute(pool)
    .await?
    .rows_affected();
    if n == 0 {
        bail!("illegal transition to completed: sync for '{}' is not running", tenant);
    }
    Ok(())
}

/// `running → failed`. Rejected when the row is not running.
pub async fn fail_sync(pool: &SqlitePool, tenant: &str, error: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let n = sqlx::query(
        r#"
        UPDATE sync_progress
        SET status = 'failed', phase = 'done', message = 'sync failed',
            error = ?, updated_at = ?
        WHERE tenant_id = ? AND status = 'running'
        "#,
    )
    .bind(error)
    .bind(now)
    .bind(tenant)
    .execute(pool)
    .await?
    .rows_affected();
    if n == 0 {
        bail!("illegal transition to failed: sync for '{}' is not running", tenant);
    }
    Ok(())
}

/// Cooperative cancel: flips `running → idle`. The walk loop notices at
/// its next course boundary. Returns whether anything was cancelled.
pub async fn cancel_sync(pool: &SqlitePool, tenant: &str) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let n = sqlx::query(
        r#"
        UPDATE sync_progress
        SET status = 'idle', message = 'sync cancelled', updated_at = ?
        WHERE tenant_id = ? AND status = 'running'
        "#,
    )
    .bind(now)
    .bind(tenant)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(n > 0)
}

/// Everything a sync run needs. Owned/`Arc`ed so the whole bundle can be
/// handed to a detached background task.
pub struct SyncDeps {
    pub config: Config,
    pub pool: SqlitePool,
    pub lms: Arc<dyn LmsApi>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub embedder: Arc<dyn Embedder>,
    pub blob: Arc<dyn BlobStore>,
    pub reporter: Arc<dyn SyncProgressReporter>,
}

/// Run a full sync for `tenant` in the foreground: claim the progress row
/// (fresh or resumed), walk every course, and close the row out as
/// `completed` or `failed`.
pub async fn run_sync(deps: &SyncDeps, tenant: &str) -> Result<()> {
    let begin = try_begin(&deps.pool, tenant, deps.config.sync.staleness_minutes).await?;

    match drive(deps, tenant, begin).await {
        Ok(Some(summary)) => complete_sync(&deps.pool, tenant, &summary).await,
        // Cancelled: the cancel request already moved the row off running.
        Ok(None) => Ok(()),
        Err(e) => {
            if let Err(te) = fail_sync(&deps.pool, tenant, &e.to_string()).await {
                eprintln!("Warning: could not record sync failure: {}", te);
            }
            Err(e)
        }
    }
}

/// Spawn a sync as a detached background task. The caller gets the handle
/// back immediately; observers follow the persisted progress row.
pub fn spawn_sync(deps: SyncDeps, tenant: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_sync(&deps, &tenant).await {
            eprintln!("Warning: background sync for '{}' failed: {}", tenant, e);
        }
    })
}

/// Walk all courses. Returns `Ok(None)` when cancelled, otherwise the
/// completion summary.
async fn drive(
    deps: &SyncDeps,
    tenant: &str,
    begin: BeginSync,
) -> Result<Option<serde_json::Value>> {
    let courses = deps.lms.list_courses().await?;
    let course_total = courses.len() as i64;

    let (start_index, mut total_materials, mut total_chunks) = match begin {
        BeginSync::Fresh => (0i64, 0i64, 0i64),
        BeginSync::Resumed {
            course_index,
            materials_stored,
            chunks_created,
        } => (course_index, materials_stored, chunks_created),
    };

    for (i, course) in courses.iter().enumerate() {
        if (i as i64) < start_index {
            continue;
        }

        // The only writer is this task, but cancellation comes from
        // outside: re-read our own row before each course.
        match load_progress(&deps.pool, tenant).await? {
            Some(row) if row.status == SyncStatus::Running => {}
            _ => return Ok(None),
        }

        let course_name = course
            .name
            .clone()
            .unwrap_or_else(|| format!("course {}", course.id));
        course_boundary(
            &deps.pool,
            tenant,
            i as i64,
            course_total,
            &format!("Walking '{}'", course_name),
        )
        .await?;
        deps.reporter.report(SyncProgressEvent::CourseStarted {
            name: course_name.clone(),
            index: i as u64,
            total: course_total as u64,
        });

        let walker = Walker {
            lms: deps.lms.as_ref(),
            fetcher: deps.fetcher.as_ref(),
            crawl: &deps.config.crawl,
            blob: deps.blob.as_ref(),
        };
        let course_id = course.id.to_string();
        let (tx, mut rx) = mpsc::channel::<WalkEvent>(8);

        let walk_fut = async {
            let r = walker.walk_course(course, &tx).await;
            drop(tx);
            r
        };

        let consume_fut = async {
            let mut course_materials = 0i64;
            let mut course_chunks = 0i64;
            while let Some(event) = rx.recv().await {
                match event {
                    WalkEvent::ItemRead {
                        message,
                        index,
                        total,
                    } => {
                        deps.reporter.report(SyncProgressEvent::ItemRead {
                            message,
                            index,
                            total,
                        });
                    }
                    WalkEvent::Material(material) => {
                        match store::store_material(
                            &deps.pool,
                            &course_id,
                            &material,
                            deps.embedder.as_ref(),
                            &deps.config.chunking,
                        )
                        .await
                        {
                            Ok(MaterialOutcome::Stored { chunks }) => {
                                course_materials += 1;
                                course_chunks += chunks as i64;
                                update_counters(
                                    &deps.pool,
                                    tenant,
                                    total_materials + course_materials,
                                    total_chunks + course_chunks,
                                    course_materials,
                                    course_chunks,
                                )
                                .await?;
                                deps.reporter.report(SyncProgressEvent::MaterialStored {
                                    course_materials: course_materials as u64,
                                    course_chunks: course_chunks as u64,
                                });
                            }
                            Ok(MaterialOutcome::Unchanged) => {}
                            Err(e) if is_auth_error(&e) => return Err(e),
                            Err(e) => {
                                eprintln!(
                                    "Warning: material '{}' not stored (will retry next sync): {}",
                                    material.item_id, e
                                );
                            }
                        }
                    }
                }
            }
            Ok::<(i64, i64), anyhow::Error>((course_materials, course_chunks))
        };

        let (walk_res, consume_res) = tokio::join!(walk_fut, consume_fut);
        let (course_materials, course_chunks) = consume_res?;
        if let Err(e) = walk_res {
            // A whole-course failure is logged and the walk moves on; only
            // errors escaping this loop flip the sync to failed.
            eprintln!("Warning: course '{}' walk incomplete: {}", course_name, e);
        }

        total_materials += course_materials;
        total_chunks += course_chunks;
    }

    Ok(Some(serde_json::json!({
        "courses": course_total,
        "materials_stored": total_materials,
        "chunks_created": total_chunks,
    })))
}
