//! Periodic health probing of connected upstreams.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ManagedClient;

/// Spawns the probe loop for one client.
///
/// The task holds only a weak reference so a dropped client ends its probe,
/// and stops on `token` cancellation. The first tick fires one full interval
/// after connect, not immediately.
pub(crate) fn spawn_probe(
    client: Weak<ManagedClient>,
    name: &str,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let name = name.to_string();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval's first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(client) = client.upgrade() else { break };
                    client.run_health_probe().await;
                }
            }
        }
        debug!(server = %name, "health probe stopped");
    })
}
