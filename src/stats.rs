//! Index statistics and health overview.
//!
//! Used by `rrag stats` to show what is indexed, how much of it is embedded,
//! and whether any repository has chunks stuck in failed jobs.

use anyhow::Result;

use crate::config::Config;
use crate::pipeline::RepositoryStats;
use crate::services::AppServices;

/// Run the stats command: query the stores and print a summary.
pub async fn run_stats(config: &Config, repository_id: Option<String>) -> Result<()> {
    let services = AppServices::build(config).await?;
    let stats = services.pipeline.stats(repository_id.as_deref()).await?;

    let total: u64 = stats.repositories.iter().map(|r| r.total_chunks).sum();
    let embedded: u64 = stats.repositories.iter().map(|r| r.embedded).sum();
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("repo-rag: Index Stats");
    println!("======================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!(
        "  Embeddings:    {} ({})",
        config.embedding.provider,
        services.embedding.model_name()
    );
    println!("  Vector store:  {}", config.vector_store.provider);
    match services.embedding.vector_store().ping().await {
        Ok(()) => println!("  Vector health: ok"),
        Err(e) => println!("  Vector health: unavailable ({:#})", e),
    }
    println!();
    println!("  Repositories:  {}", stats.repositories.len());
    println!("  Chunks:        {}", total);
    println!(
        "  Embedded:      {} / {} ({}%)",
        embedded,
        total,
        if total > 0 { (embedded * 100) / total } else { 0 }
    );

    if !stats.repositories.is_empty() {
        println!();
        print_repository_table(&stats.repositories);
    }
    println!();

    services.pool.close().await;
    Ok(())
}

/// Per-repository breakdown, one row per repository.
pub fn print_repository_table(repositories: &[RepositoryStats]) {
    println!(
        "  {:<24} {:>8} {:>9} {:>8} {:>7} {:>6}",
        "REPOSITORY", "CHUNKS", "EMBEDDED", "PENDING", "FAILED", "JOBS"
    );
    println!("  {}", "-".repeat(68));
    for r in repositories {
        println!(
            "  {:<24} {:>8} {:>9} {:>8} {:>7} {:>6}",
            r.repository_id,
            r.total_chunks,
            r.embedded,
            r.pending,
            r.failed,
            r.queued_jobs + r.running_jobs
        );
        if let Some(err) = &r.last_error {
            println!("    last error: {}", err);
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
