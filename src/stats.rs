//! Database statistics and health overview.
//!
//! A quick summary of what has been integrated: article counts, the record
//! ledger per source, staging backlog and the latest runs. Used by
//! `integrator stats` to give confidence that runs are converging.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::runs;

/// Per-source breakdown of ledger records.
struct SourceStats {
    source: String,
    record_count: i64,
    article_count: i64,
    last_run_ts: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE superseded_by IS NULL")
        .fetch_one(&pool)
        .await?;
    let superseded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE superseded_by IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM source_records")
        .fetch_one(&pool)
        .await?;
    let identifiers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM article_identifiers")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Article Integrator: Database Stats");
    println!("===================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Articles:    {} live, {} superseded", live, superseded);
    println!("  Records:     {}", records);
    println!("  Identifiers: {}", identifiers);

    // Staging backlog by status
    let staging_rows =
        sqlx::query("SELECT status, COUNT(*) AS n FROM staging_articles GROUP BY status ORDER BY status")
            .fetch_all(&pool)
            .await?;
    if !staging_rows.is_empty() {
        let parts: Vec<String> = staging_rows
            .iter()
            .map(|row| format!("{} {}", row.get::<i64, _>("n"), row.get::<String, _>("status")))
            .collect();
        println!("  Staging:     {}", parts.join(", "));
    }

    // Per-source breakdown
    let source_rows = sqlx::query(
        r#"
        SELECT
            r.source_id,
            COUNT(DISTINCT r.record_key) AS record_count,
            COUNT(DISTINCT a.canonical_id) AS article_count
        FROM source_records r
        LEFT JOIN article_members m ON m.record_key = r.record_key
        LEFT JOIN articles a ON a.canonical_id = m.canonical_id AND a.superseded_by IS NULL
        GROUP BY r.source_id
        ORDER BY record_count DESC, r.source_id ASC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let checkpoint_rows = sqlx::query("SELECT source, updated_at FROM checkpoints")
        .fetch_all(&pool)
        .await?;

    let source_stats: Vec<SourceStats> = source_rows
        .iter()
        .map(|row| {
            let source: String = row.get("source_id");
            let last_run_ts = checkpoint_rows
                .iter()
                .find(|cp| cp.get::<String, _>("source") == source)
                .map(|cp| cp.get::<i64, _>("updated_at"));
            SourceStats {
                source,
                record_count: row.get("record_count"),
                article_count: row.get("article_count"),
                last_run_ts,
            }
        })
        .collect();

    if !source_stats.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<28} {:>8} {:>9}   {}",
            "SOURCE", "RECORDS", "ARTICLES", "CHECKPOINT"
        );
        println!("  {}", "-".repeat(66));

        for s in &source_stats {
            let checkpoint = match s.last_run_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<28} {:>8} {:>9}   {}",
                s.source, s.record_count, s.article_count, checkpoint
            );
        }
    }

    let recent = runs::recent_runs(&pool, 5).await?;
    if !recent.is_empty() {
        println!();
        println!("  Recent runs:");
        for run in &recent {
            let written = run.result["written_count"].as_u64().unwrap_or(0);
            let failed = run.result["failed_sources"]
                .as_array()
                .map(|a| a.len())
                .unwrap_or(0);
            println!(
                "  {}  {:<10} written {:<6} failed sources {}   {}",
                &run.run_id[..8.min(run.run_id.len())],
                run.stage,
                written,
                failed,
                format_ts_relative(run.finished_at)
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
