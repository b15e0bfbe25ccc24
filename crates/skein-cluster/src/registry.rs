//! Node id allocation and the lifecycle of membership rows.
//!
//! Every operation is one [`StateStore::transact`] call, so concurrent
//! workers never allocate the same id or soft-delete a row twice.

use std::net::SocketAddr;
use std::time::Duration;

use skein_core::config::RegisterSection;
use skein_core::{ConnectionId, WorkerId};
use skein_state::{Host, NodeId, StateStore};
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};
use crate::types::RegisterRequest;

const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Ids are allocated from `0..max_nodes_per_group`.
    pub max_nodes_per_group: u32,
    /// Removed rows older than this are deleted even if their connection
    /// still looks alive.
    pub grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_group: 65_536,
            grace: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    pub fn from_section(section: &RegisterSection) -> Self {
        Self {
            max_nodes_per_group: section.max_nodes_per_group.max(1),
            grace: Duration::from_secs(section.grace_secs),
        }
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub host: Host,
    /// Every live node after the registration, in key order.
    pub hosts: Vec<Host>,
}

/// What one sweep changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows hard-deleted.
    pub deleted: Vec<Host>,
    /// Rows whose `remove` event still has to go out.
    pub announce: Vec<Host>,
}

#[derive(Clone)]
pub struct Registry {
    store: StateStore,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(store: StateStore, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Validate `request`, resolve the node id and persist the row.
    pub fn register(
        &self,
        request: RegisterRequest,
        conn: ConnectionId,
        worker: WorkerId,
        peer: Option<SocketAddr>,
    ) -> ClusterResult<Registration> {
        let port = request
            .port
            .filter(|p| *p != 0)
            .ok_or_else(|| ClusterError::RegistrationConflict("port is required".into()))?;
        let group = request
            .group
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        if group.contains('/') {
            return Err(ClusterError::RegistrationConflict(format!(
                "invalid group name {group:?}"
            )));
        }
        let ip = request
            .ip
            .filter(|ip| !ip.is_empty())
            .or_else(|| peer.map(|p| p.ip().to_string()))
            .ok_or_else(|| ClusterError::RegistrationConflict("cannot determine node ip".into()))?;
        let key = if request.encrypt {
            Some(generate_key()?)
        } else {
            None
        };
        let max = self.config.max_nodes_per_group;

        let registration = self.store.transact(|txn| {
            let rows = txn.list_group(&group)?;
            let id = match request.id.filter(|id| *id >= 0) {
                Some(proposed) => {
                    let Some(id) = NodeId::try_from(proposed).ok().filter(|id| *id < max) else {
                        return Ok(Err(ClusterError::RegistrationConflict(format!(
                            "id {proposed} is out of range"
                        ))));
                    };
                    if rows.iter().any(|h| h.id == id && h.is_live()) {
                        return Ok(Err(ClusterError::RegistrationConflict(format!(
                            "node {group}/{id} is already registered"
                        ))));
                    }
                    id
                }
                None => match rows
                    .iter()
                    .find(|h| !h.is_live() && h.ip == ip && h.port == port)
                {
                    Some(previous) => previous.id,
                    None => match lowest_free_id(&rows, max) {
                        Some(id) => id,
                        None => {
                            return Ok(Err(ClusterError::RegistrationConflict(format!(
                                "group {group} has no free node id"
                            ))));
                        }
                    },
                },
            };

            let host = Host {
                id,
                group: group.clone(),
                ip: ip.clone(),
                port,
                task_port: request.task_port,
                worker_num: request.worker_num,
                task_num: request.task_num,
                key: key.clone(),
                fd: conn,
                from_id: worker,
                removed: 0,
                announced: false,
            };
            txn.put(&host)?;
            let mut hosts = txn.list_all()?;
            hosts.retain(Host::is_live);
            Ok(Ok(Registration { host, hosts }))
        })??;

        info!(
            group = %registration.host.group,
            id = registration.host.id,
            addr = %registration.host.address(),
            conn,
            "node registered"
        );
        Ok(registration)
    }

    /// Soft-delete the live row registered over `conn`.
    ///
    /// The row is marked announced; the caller broadcasts its `remove`.
    pub fn disconnect(&self, conn: ConnectionId, now_ms: u64) -> ClusterResult<Option<Host>> {
        let removed = self.store.transact(|txn| {
            let Some(mut host) = txn.for_connection(conn)? else {
                return Ok(None);
            };
            if host.fd != conn || !txn.mark_removed(&mut host, now_ms)? {
                return Ok(None);
            }
            Ok(Some(host))
        })?;
        if let Some(host) = &removed {
            info!(group = %host.group, id = host.id, conn, "node disconnected");
        }
        Ok(removed)
    }

    /// One garbage-collection pass.
    ///
    /// Removed rows are deleted once their connection is gone, or
    /// unconditionally after the grace period. Live rows whose connection
    /// vanished without a close notification are soft-deleted and
    /// reported for announcement.
    pub fn sweep(
        &self,
        now_ms: u64,
        is_alive: impl Fn(ConnectionId) -> bool,
    ) -> ClusterResult<SweepReport> {
        let grace_ms = self.config.grace.as_millis() as u64;
        let report = self.store.transact(|txn| {
            let mut report = SweepReport::default();
            for mut host in txn.list_all()? {
                let alive = is_alive(host.fd);
                if host.is_live() {
                    if !alive && txn.mark_removed(&mut host, now_ms)? {
                        report.announce.push(host);
                    }
                    continue;
                }
                let expired = now_ms.saturating_sub(host.removed) >= grace_ms;
                if !alive || expired {
                    txn.remove(&host.group, host.id)?;
                    if !host.announced {
                        report.announce.push(host.clone());
                    }
                    report.deleted.push(host);
                }
            }
            Ok(report)
        })?;
        for host in &report.deleted {
            info!(group = %host.group, id = host.id, "node row deleted");
        }
        debug!(
            deleted = report.deleted.len(),
            announce = report.announce.len(),
            "sweep finished"
        );
        Ok(report)
    }

    /// Soft-delete every live row left over from an earlier server run.
    ///
    /// Connection ids restart with the server, so stale `fd` values could
    /// otherwise match new connections.
    pub fn recover(&self, now_ms: u64) -> ClusterResult<usize> {
        let recovered = self.store.transact(|txn| {
            let mut count = 0;
            for mut host in txn.list_all()? {
                if txn.mark_removed(&mut host, now_ms)? {
                    count += 1;
                }
            }
            Ok(count)
        })?;
        if recovered > 0 {
            info!(recovered, "stale node rows marked removed");
        }
        Ok(recovered)
    }

    pub fn live_hosts(&self) -> ClusterResult<Vec<Host>> {
        Ok(self.store.live_hosts()?)
    }

    pub fn host_for_connection(&self, conn: ConnectionId) -> ClusterResult<Option<Host>> {
        Ok(self.store.host_for_connection(conn)?)
    }
}

/// Smallest id in `0..max` with no row, live or removed.
fn lowest_free_id(rows: &[Host], max: NodeId) -> Option<NodeId> {
    // Rows come in id order.
    let mut candidate: NodeId = 0;
    for host in rows {
        if host.id > candidate {
            break;
        }
        if host.id == candidate {
            candidate = candidate.checked_add(1)?;
        }
    }
    (candidate < max).then_some(candidate)
}

/// 32 hex characters of fresh randomness.
pub fn generate_key() -> ClusterResult<String> {
    let mut raw = [0u8; 16];
    getrandom::getrandom(&mut raw).map_err(|e| ClusterError::Random(e.to_string()))?;
    Ok(hex::encode(raw))
}
