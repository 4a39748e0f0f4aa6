//! Reconciliation trigger loop
//!
//! A cancellable background task that reconciles once at startup and then
//! whenever the topology file changes, detected by polling its mtime. An
//! aborted pass is logged and the loop keeps going; the shutdown signal is
//! checked between passes, never mid-pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use super::Reconciler;

/// Spawn the loop; dropping or signalling the returned sender stops it
/// after the current pass.
pub fn spawn_watch_loop(
    reconciler: Arc<Reconciler>,
    topology_path: PathBuf,
    poll_interval: Duration,
) -> watch::Sender<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    tokio::spawn(async move {
        info!(
            "reconciliation loop started, watching {} every {}s",
            topology_path.display(),
            poll_interval.as_secs()
        );

        // baseline before the startup pass, so an edit landing while that
        // pass runs still registers as a change on the first tick
        let mut last_seen = modified_at(&topology_path);
        run_pass(&reconciler).await;

        let mut ticker = interval(poll_interval);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = modified_at(&topology_path);
                    if current != last_seen {
                        last_seen = current;
                        info!("topology file changed, reconciling");
                        run_pass(&reconciler).await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("reconciliation loop shutting down");
                    break;
                }
            }
        }
    });

    shutdown_tx
}

async fn run_pass(reconciler: &Reconciler) {
    match reconciler.reconcile().await {
        Ok(report) => {
            if report.written {
                info!(
                    "pass complete: {} scale command(s), proxy reloaded",
                    report.scaled.len()
                );
            }
        }
        // the loop must outlive a failed pass; the next trigger retries
        Err(e) => error!("reconciliation pass failed: {}", e),
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
