//! `rrag embed pending`: run the embedding pipeline once and exit.
//!
//! Starts the same worker pool the server runs, queues the selected
//! repositories, waits until the queue drains and prints a summary.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::pipeline::QueueOutcome;
use crate::services::AppServices;
use crate::stats::print_repository_table;

pub async fn run_embed_pending(config: &Config, repository_id: Option<String>, dry_run: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let mut config = config.clone();
    if repository_id.is_some() {
        // Only the named repository; leave other interrupted jobs for the server.
        config.pipeline.resume_on_start = false;
    }
    let services = AppServices::build(&config).await?;
    let pipeline = &services.pipeline;

    if dry_run {
        let stats = pipeline.stats(repository_id.as_deref()).await?;
        println!("embed pending (dry-run)");
        let pending: u64 = stats.repositories.iter().map(|r| r.pending + r.failed).sum();
        println!("  chunks needing embeddings: {}", pending);
        return Ok(());
    }

    pipeline.start().await?;
    if let Some(repo) = &repository_id {
        match pipeline.queue_repository(repo).await? {
            QueueOutcome::Accepted { job_ids, chunks } => {
                println!("Queued {} chunks in {} jobs for '{}'", chunks, job_ids.len(), repo)
            }
            QueueOutcome::AlreadyInProgress => println!("'{}' already queued", repo),
            QueueOutcome::NothingPending => println!("'{}': all chunks up to date", repo),
        }
    }

    pipeline.wait_idle().await;
    pipeline.stop().await;

    let stats = pipeline.stats(repository_id.as_deref()).await?;
    println!("embed pending");
    if let Some(reason) = &stats.degraded_reason {
        println!("  degraded: {}", reason);
    }
    print_repository_table(&stats.repositories);

    services.pool.close().await;
    Ok(())
}
