use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Integrated articles. `article_json` is the full serialized article;
    // the other columns are denormalized for listing and stats.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            canonical_id TEXT PRIMARY KEY,
            title TEXT,
            version INTEGER NOT NULL,
            superseded_by TEXT,
            last_merged_at INTEGER NOT NULL,
            article_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Identifier index over live articles
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS article_identifiers (
            scheme TEXT NOT NULL,
            value TEXT NOT NULL,
            canonical_id TEXT NOT NULL,
            PRIMARY KEY (scheme, value, canonical_id),
            FOREIGN KEY (canonical_id) REFERENCES articles(canonical_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Record keys that contributed to each article
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS article_members (
            record_key TEXT NOT NULL,
            canonical_id TEXT NOT NULL,
            PRIMARY KEY (record_key, canonical_id),
            FOREIGN KEY (canonical_id) REFERENCES articles(canonical_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_article_members_id ON article_members(canonical_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_article_identifiers_id ON article_identifiers(canonical_id)",
    )
    .execute(pool)
    .await?;

    // Ledger of normalized source records
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_records (
            record_key TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            record_json TEXT NOT NULL,
            fetched_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-source fetch cursors
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Documents waiting to be promoted by a staging source
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staging_articles (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            staged_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            stage TEXT NOT NULL,
            result_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("m.sqlite")).await.unwrap();
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        for table in [
            "article_identifiers",
            "article_members",
            "articles",
            "checkpoints",
            "runs",
            "source_records",
            "staging_articles",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing {}", table);
        }
    }
}
