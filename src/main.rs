use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use jobq::queue::JobQueue;
use jobq::tasks::{TaskRegistry, builtin};
use jobq::worker::{Worker, spawn_lock_recovery};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // ── Queue ────────────────────────────────────────────────────────────
    let queue = Arc::new(
        JobQueue::from_env()
            .await
            .context("failed to open job store")?,
    );
    let config = queue.config().clone();

    eprintln!("jobq v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_url);
    eprintln!("   Worker: {} ({} slots)", config.worker_id, config.concurrency);

    match queue.get_stats().await {
        Ok(stats) => eprintln!(
            "   Jobs: {} pending, {} locked, {} failed, {} completed",
            stats.pending, stats.locked, stats.failed, stats.completed
        ),
        Err(e) => tracing::warn!("Could not read queue stats: {}", e),
    }

    // ── Tasks ────────────────────────────────────────────────────────────
    let mut registry = TaskRegistry::new();
    builtin::register_all(&mut registry)?;
    eprintln!("   Tasks: {}", registry.names().join(", "));

    let shutdown = CancellationToken::new();

    // ── Lock recovery ────────────────────────────────────────────────────
    let recovery = match config.recovery_interval {
        Some(interval) => {
            eprintln!(
                "   Lock recovery: every {}s (stale after {}s)",
                interval.as_secs(),
                config.stale_lock_after.as_secs()
            );
            Some(spawn_lock_recovery(
                Arc::clone(&queue),
                interval,
                config.stale_lock_after,
                shutdown.clone(),
            ))
        }
        None => {
            eprintln!("   Lock recovery: disabled");
            None
        }
    };

    // ── Worker ───────────────────────────────────────────────────────────
    let worker = Worker::new(Arc::clone(&queue), Arc::new(registry));
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    shutdown_signal()
        .await
        .context("failed to listen for shutdown signal")?;
    eprintln!("\nShutting down...");
    shutdown.cancel();

    let summary = worker_task.await.context("worker task failed")?;
    if let Some(handle) = recovery
        && let Err(e) = handle.await
    {
        tracing::error!("Lock recovery task failed: {}", e);
    }

    eprintln!(
        "   Completed: {}, retried: {}, failed: {}, abandoned: {}",
        summary.completed, summary.retried, summary.failed, summary.abandoned
    );

    match Arc::try_unwrap(queue) {
        Ok(queue) => queue.close(),
        Err(_) => tracing::debug!("Queue still shared at exit"),
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
