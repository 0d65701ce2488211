//! Periodic clean up: times out stuck introspections, purges old sessions and
//! resyncs the firewall whitelist.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};

use inspector_core::SessionStore;

use super::firewall::Firewall;

/// Run the sweep every `period` until shutdown.
///
/// Spawned from `main.rs`; a zero period disables it.
pub async fn run_sweep_loop(
    store: SessionStore,
    firewall: Arc<dyn Firewall>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    if period.is_zero() {
        tracing::info!("Periodic clean up disabled via config");
        return;
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(period_secs = period.as_secs(), "Clean up loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_sweep_tick(&store, firewall.as_ref()).await {
                    Ok(timed_out) if !timed_out.is_empty() => {
                        tracing::info!(count = timed_out.len(), "Clean up tick complete");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Periodic clean up failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Clean up loop shutting down");
                break;
            }
        }
    }
}

/// A single sweep. Returns the ids of sessions that timed out.
pub async fn run_sweep_tick(store: &SessionStore, firewall: &dyn Firewall) -> Result<Vec<String>> {
    let timed_out = store.sweep().await?;
    firewall.update_filters().await?;
    Ok(timed_out)
}
