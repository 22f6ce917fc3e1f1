//! Retrieval Service: top-K stored chunks for a topic within a course,
//! ranked by cosine similarity against the query embedding.
//!
//! Scores are clamped into `[0, 1]` (negative cosine is "no match", not
//! "anti-match") so the fallback orchestrator can compare them against its
//! thresholds directly.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, EmbedPurpose, Embedder};
use crate::models::RetrievedMaterial;

pub async fn top_chunks(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    course_id: &str,
    topic: &str,
    k: usize,
) -> Result<Vec<RetrievedMaterial>> {
    if topic.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let query_vec = embedder
        .embed(&[topic.to_string()], EmbedPurpose::Query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty embedding response for query"))?;

    let rows = sqlx::query(
        r#"
        SELECT id, item_id, text, title, source_url, module_name, embedding
        FROM chunks
        WHERE course_id = ?
        "#,
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<RetrievedMaterial> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            let score = cosine_similarity(&query_vec, &vec).max(0.0) as f64;
            RetrievedMaterial {
                chunk_id: row.get("id"),
                item_id: row.get("item_id"),
                text: row.get("text"),
                title: row.get("title"),
                source_url: row.get("source_url"),
                module_name: row.get("module_name"),
                score,
            }
        })
        .collect();

    // Deterministic order: score desc, then chunk id asc.
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(k);

    Ok(candidates)
}
