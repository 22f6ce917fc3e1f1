use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Chunk rows carry a copy of their material's metadata plus the
    // embedding vector as a little-endian f32 BLOB.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            course_id TEXT NOT NULL,
            id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            title TEXT,
            source_url TEXT,
            module_name TEXT,
            provenance TEXT NOT NULL DEFAULT 'native',
            linked_from TEXT,
            content_kind TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (course_id, id),
            UNIQUE (course_id, item_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Hash of the text that was fully embedded and stored last time.
    // A row exists only when every chunk of the material made it in.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_hashes (
            course_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (course_id, item_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One progress row per tenant; all observers poll this row.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_progress (
            tenant_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            phase TEXT NOT NULL DEFAULT '',
            course_index INTEGER NOT NULL DEFAULT 0,
            course_total INTEGER NOT NULL DEFAULT 0,
            materials_stored INTEGER NOT NULL DEFAULT 0,
            chunks_created INTEGER NOT NULL DEFAULT 0,
            course_materials INTEGER NOT NULL DEFAULT 0,
            course_chunks INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            error TEXT,
            summary_json TEXT,
            started_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_course_item ON chunks(course_id, item_id)")
        .execute(pool)
        .await?;

    Ok(())
}
