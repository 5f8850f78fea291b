//! Article retrieval.
//!
//! `integrator show <canonical_id>` prints one integrated article with the
//! provenance of every field. `integrator lookup <scheme> <value>` finds the
//! live article carrying an identifier; the value is canonicalized the same
//! way source records are, so `lookup isbn 0-441-01359-7` finds the
//! ISBN-13 form.

use anyhow::{bail, Result};

use article_integrator_core::normalize::{canonical_scheme, canonicalize_identifier};
use article_integrator_core::{IntegratedArticle, Store};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Fetch an article by canonical id, live or superseded.
pub async fn get_article(config: &Config, id: &str) -> Result<IntegratedArticle> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let article = store.get(id).await?;
    pool.close().await;

    match article {
        Some(article) => Ok(article),
        None => bail!("article not found: {}", id),
    }
}

/// Find the live article carrying an identifier.
pub async fn lookup_article(
    config: &Config,
    scheme: &str,
    value: &str,
) -> Result<Option<IntegratedArticle>> {
    let scheme = canonical_scheme(scheme);
    let value = match canonicalize_identifier(&scheme, value) {
        Ok(value) => value,
        Err(reason) => bail!("invalid {} '{}': {}", scheme, value, reason),
    };

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let article = store.find_by_identifier(&scheme, &value).await?;
    pool.close().await;
    Ok(article)
}

/// CLI entry point for `show`.
pub async fn run_show(config: &Config, id: &str, json: bool) -> Result<()> {
    let article = get_article(config, id).await?;
    print_article(&article, json)
}

/// CLI entry point for `lookup`.
pub async fn run_lookup(config: &Config, scheme: &str, value: &str, json: bool) -> Result<()> {
    match lookup_article(config, scheme, value).await? {
        Some(article) => print_article(&article, json),
        None => bail!("no article with {} {}", scheme, value),
    }
}

fn print_article(article: &IntegratedArticle, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(article)?);
        return Ok(());
    }

    println!("--- Article ---");
    println!("id:           {}", article.canonical_id);
    println!("title:        {}", article.title().unwrap_or("(untitled)"));
    println!("version:      {}", article.version);
    println!(
        "merged_at:    {}",
        article.last_merged_at.format("%Y-%m-%dT%H:%M:%SZ")
    );
    if let Some(survivor) = &article.superseded_by {
        println!("superseded:   by {}", survivor);
    }
    println!(
        "sources:      {}",
        article
            .contributing_sources
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    println!("--- Fields ---");
    for (name, value) in &article.fields {
        let source = article
            .provenance
            .get(name)
            .map(String::as_str)
            .unwrap_or("?");
        println!("{:<22} {}  [{}]", name, value, source);
    }
    println!();

    println!("--- Members ({}) ---", article.members.len());
    for member in &article.members {
        println!("{}", member);
    }

    Ok(())
}
