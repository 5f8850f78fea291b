//! `integrator sources`: list configured source adapters.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::traits::AdapterRegistry;

pub async fn list_sources(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let registry = AdapterRegistry::from_config(config, &pool)?;

    if registry.is_empty() {
        println!("No sources configured. Add [sources.<type>.<name>] tables to the config.");
        pool.close().await;
        return Ok(());
    }

    println!("{:<28} {:<12} {:<10} DESCRIPTION", "SOURCE", "TYPE", "STATUS");
    for adapter in registry.adapters() {
        println!(
            "{:<28} {:<12} {:<10} {}",
            adapter.source_id(),
            adapter.adapter_type(),
            source_status(config, adapter.adapter_type(), adapter.name()),
            adapter.description()
        );
    }

    pool.close().await;
    Ok(())
}

/// Cheap local health check. Remote sources are only checked by a run.
fn source_status(config: &Config, adapter_type: &str, name: &str) -> &'static str {
    match adapter_type {
        "filesystem" => match config.sources.filesystem.get(name) {
            Some(fs) if fs.root.is_dir() => "OK",
            _ => "MISSING",
        },
        _ => "OK",
    }
}
