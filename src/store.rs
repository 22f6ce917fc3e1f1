//! Incremental Material Store.
//!
//! Persists chunk rows with embeddings, gated by a per-material content
//! hash: unchanged materials are skipped entirely (no re-embedding, no
//! re-write), and the hash is only written after every chunk of a material
//! made it in. Partial failure leaves the hash untouched so the next sync
//! retries the whole material instead of treating it as done.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::{is_auth_error, vec_to_blob, EmbedPurpose, Embedder};
use crate::models::{Material, StoreOutcome};

/// Digest of a material's text, used to detect changes across syncs.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// What one material's store pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialOutcome {
    /// Content hash matched; nothing touched.
    Unchanged,
    Stored { chunks: u64 },
}

/// Store one material: hash-gate, replace the chunk set, embed, insert,
/// then record the hash.
pub async fn store_material(
    pool: &SqlitePool,
    course_id: &str,
    material: &Material,
    embedder: &dyn Embedder,
    chunking: &ChunkingConfig,
) -> Result<MaterialOutcome> {
    let hash = content_hash(&material.text);

    let existing: Option<String> =
        sqlx::query_scalar("SELECT hash FROM content_hashes WHERE course_id = ? AND item_id = ?")
            .bind(course_id)
            .bind(&material.item_id)
            .fetch_optional(pool)
            .await?;

    // The core incremental-sync optimization: the hash is persisted, so
    // this skip holds across process restarts.
    if existing.as_deref() == Some(hash.as_str()) {
        return Ok(MaterialOutcome::Unchanged);
    }

    let chunks = chunk_text(
        &material.item_id,
        &material.text,
        chunking.chunk_chars,
        chunking.overlap_chars,
    );
    if chunks.is_empty() {
        return Ok(MaterialOutcome::Unchanged);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder
        .embed(&texts, EmbedPurpose::Index)
        .await
        .with_context(|| format!("embedding failed for material '{}'", material.item_id))?;
    if vectors.len() != chunks.len() {
        anyhow::bail!(
            "embedder returned {} vectors for {} chunks of '{}'",
            vectors.len(),
            chunks.len(),
            material.item_id
        );
    }

    // No partial or duplicate chunk set survives a content update: the old
    // set goes away before the new one lands.
    sqlx::query("DELETE FROM chunks WHERE course_id = ? AND item_id = ?")
        .bind(course_id)
        .bind(&material.item_id)
        .execute(pool)
        .await?;

    let now = chrono::Utc::now().timestamp();
    let mut stored = 0u64;
    for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
        let blob = vec_to_blob(vector);
        // A replay of a previously interrupted run may hit an existing row;
        // converging on the new content is a success, not an error.
        sqlx::query(
            r#"
            INSERT INTO chunks (course_id, id, item_id, chunk_index, text, title, source_url,
                                module_name, provenance, linked_from, content_kind,
                                embedding, dims, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(course_id, id) DO UPDATE SET
                text = excluded.text,
                title = excluded.title,
                source_url = excluded.source_url,
                module_name = excluded.module_name,
                provenance = excluded.provenance,
                linked_from = excluded.linked_from,
                content_kind = excluded.content_kind,
                embedding = excluded.embedding,
                dims = excluded.dims,
                created_at = excluded.created_at
            "#,
        )
        .bind(course_id)
        .bind(&chunk.id)
        .bind(&chunk.item_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&material.title)
        .bind(&material.source_url)
        .bind(&material.module_name)
        .bind(material.provenance.as_str())
        .bind(&material.linked_from)
        .bind(material.kind.as_str())
        .bind(&blob)
        .bind(vector.len() as i64)
        .bind(now)
        .execute(pool)
        .await?;
        stored += 1;
    }

    // Only now is the material "up to date".
    sqlx::query(
        r#"
        INSERT INTO content_hashes (course_id, item_id, hash, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(course_id, item_id) DO UPDATE SET
            hash = excluded.hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(course_id)
    .bind(&material.item_id)
    .bind(&hash)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(MaterialOutcome::Stored { chunks: stored })
}

/// Store a course's materials, firing `on_progress` with cumulative
/// per-course counters after each material. A material that fails to embed
/// is logged and retried on the next sync; only credential failures abort.
pub async fn store_course(
    pool: &SqlitePool,
    course_id: &str,
    materials: &[Material],
    embedder: &dyn Embedder,
    chunking: &ChunkingConfig,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<StoreOutcome> {
    let mut outcome = StoreOutcome::default();
    for material in materials {
        match store_material(pool, course_id, material, embedder, chunking).await {
            Ok(MaterialOutcome::Stored { chunks }) => {
                outcome.materials_stored += 1;
                outcome.chunks_created += chunks;
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
        on_progress(outcome.materials_stored, outcome.chunks_created);
    }
    Ok(outcome)
}

/// Stored hash for one material, if its last store pass completed.
pub async fn stored_hash(
    pool: &SqlitePool,
    course_id: &str,
    item_id: &str,
) -> Result<Option<String>> {
    let hash =
        sqlx::query_scalar("SELECT hash FROM content_hashes WHERE course_id = ? AND item_id = ?")
            .bind(course_id)
            .bind(item_id)
            .fetch_optional(pool)
            .await?;
    Ok(hash)
}
