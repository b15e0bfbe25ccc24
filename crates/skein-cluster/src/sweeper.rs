//! Periodic garbage collection of membership rows.

use std::time::Duration;

use skein_core::epoch_millis;
use skein_rpc::{Codec, ConnectionHub};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::ClusterResult;
use crate::registry::{Registry, SweepReport};
use crate::service::broadcast_remove;

/// Run one sweep against the live connections of `hub` and broadcast the
/// `remove` events it produced.
pub fn sweep_once(registry: &Registry, hub: &ConnectionHub, codec: &Codec) -> ClusterResult<SweepReport> {
    let report = registry.sweep(epoch_millis(), |conn| hub.contains(conn))?;
    for host in &report.announce {
        let sent = broadcast_remove(registry, hub, codec, host);
        debug!(group = %host.group, id = host.id, sent, "remove broadcast by sweeper");
    }
    Ok(report)
}

/// Spawn the sweeper loop. It stops when `shutdown` flips or its sender
/// is dropped.
pub fn spawn_sweeper(
    registry: Registry,
    hub: ConnectionHub,
    codec: Codec,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(every = ?every, "sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sweep_once(&registry, &hub, &codec) {
                        error!(error = %err, "sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("sweeper stopped");
    })
}
