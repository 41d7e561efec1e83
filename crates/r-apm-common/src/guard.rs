//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Shared primitives and utilities for the agent runtime."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Spawn a named periodic worker whose individual ticks may fail without
/// killing the loop.
///
/// Tick errors are logged with the worker name and swallowed; the worker only
/// exits when the shutdown channel flips (or its sender is dropped). Missed
/// ticks are skipped rather than bursted, so a slow tick does not queue up
/// catch-up work behind itself.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + initial_delay;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = tick().await {
                        error!(worker = name, error = %err, "worker tick failed");
                    }
                }
            }
        }
        debug!(worker = name, "worker stopped");
    })
}
