//! StateStore — redb-backed membership table.
//!
//! Host rows are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter is what a
//! register server without a `data_dir` runs on).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use skein_core::ConnectionId;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn decode(bytes: &[u8]) -> StateResult<Host> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(CONNECTIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// Changes are committed only when `f` returns `Ok`; an error drops the
    /// transaction and leaves the table untouched.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut HostTxn<'_>) -> StateResult<T>,
    ) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = {
            let mut view = HostTxn {
                hosts: txn.open_table(HOSTS).map_err(map_err!(Table))?,
                conns: txn.open_table(CONNECTIONS).map_err(map_err!(Table))?,
            };
            f(&mut view)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert or replace a host together with its connection index entry.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.transact(|txn| txn.put(host))?;
        debug!(key = %host.table_key(), fd = host.fd, "host stored");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_host(&self, group: &str, id: NodeId) -> StateResult<Option<Host>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let key = host_key(group, id);
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Every row of every group, live or removed, in key order.
    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.scan(None)
    }

    /// Rows of one group in id order.
    pub fn list_group(&self, group: &str) -> StateResult<Vec<Host>> {
        self.scan(Some(&group_prefix(group)))
    }

    /// Live rows of every group.
    pub fn live_hosts(&self) -> StateResult<Vec<Host>> {
        let mut hosts = self.list_hosts()?;
        hosts.retain(Host::is_live);
        Ok(hosts)
    }

    fn scan(&self, prefix: Option<&str>) -> StateResult<Vec<Host>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.is_none_or(|p| key.value().starts_with(p)) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    /// The host registered over `conn`, if any.
    pub fn host_for_connection(&self, conn: ConnectionId) -> StateResult<Option<Host>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let conns = txn.open_table(CONNECTIONS).map_err(map_err!(Table))?;
        let fd = conn.to_string();
        let Some(key) = conns
            .get(fd.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string())
        else {
            return Ok(None);
        };
        let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        match hosts.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }
}

/// Both membership tables opened inside one write transaction.
pub struct HostTxn<'txn> {
    hosts: Table<'txn, &'static str, &'static [u8]>,
    conns: Table<'txn, &'static str, &'static str>,
}

impl HostTxn<'_> {
    pub fn get(&self, group: &str, id: NodeId) -> StateResult<Option<Host>> {
        let key = host_key(group, id);
        match self.hosts.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Rows of one group in id order.
    pub fn list_group(&self, group: &str) -> StateResult<Vec<Host>> {
        let prefix = group_prefix(group);
        let mut results = Vec::new();
        for entry in self.hosts.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    pub fn list_all(&self) -> StateResult<Vec<Host>> {
        let mut results = Vec::new();
        for entry in self.hosts.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// The row registered over `conn`, if any.
    pub fn for_connection(&self, conn: ConnectionId) -> StateResult<Option<Host>> {
        let fd = conn.to_string();
        let Some(key) = self
            .conns
            .get(fd.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string())
        else {
            return Ok(None);
        };
        match self.hosts.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a row and point its connection at it.
    pub fn put(&mut self, host: &Host) -> StateResult<()> {
        let key = host.table_key();
        if let Some(previous) = self.get(&host.group, host.id)? {
            if previous.fd != host.fd {
                self.unlink(previous.fd, &key)?;
            }
        }
        let value = serde_json::to_vec(host).map_err(map_err!(Serialize))?;
        self.hosts
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        let fd = host.fd.to_string();
        self.conns
            .insert(fd.as_str(), key.as_str())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Hard-delete a row and its connection index entry.
    pub fn remove(&mut self, group: &str, id: NodeId) -> StateResult<Option<Host>> {
        let key = host_key(group, id);
        let removed = match self.hosts.remove(key.as_str()).map_err(map_err!(Write))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        if let Some(host) = &removed {
            self.unlink(host.fd, &key)?;
        }
        Ok(removed)
    }

    /// Soft-delete a live host in place: stamp `removed = at_ms`, flag it
    /// as announced and store it. Returns `false` for rows already removed.
    pub fn mark_removed(&mut self, host: &mut Host, at_ms: u64) -> StateResult<bool> {
        if !host.is_live() {
            return Ok(false);
        }
        host.removed = at_ms.max(1);
        host.announced = true;
        self.put(host)?;
        Ok(true)
    }

    /// Drop the index entry of `conn` if it still points at `key`.
    fn unlink(&mut self, conn: ConnectionId, key: &str) -> StateResult<()> {
        let fd = conn.to_string();
        let points_here = self
            .conns
            .get(fd.as_str())
            .map_err(map_err!(Read))?
            .is_some_and(|guard| guard.value() == key);
        if points_here {
            self.conns.remove(fd.as_str()).map_err(map_err!(Write))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn host(group: &str, id: NodeId, fd: ConnectionId) -> Host {
        Host {
            id,
            group: group.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 9600 + id as u16,
            task_port: 0,
            worker_num: 2,
            task_num: 0,
            key: None,
            fd,
            from_id: 0,
            removed: 0,
            announced: false,
        }
    }

    // ── CRUD ───────────────────────────────────────────────────────

    #[test]
    fn put_and_get() {
        let store = store();
        store.put_host(&host("default", 1, 7)).unwrap();

        let got = store.get_host("default", 1).unwrap().unwrap();
        assert_eq!(got.port, 9601);
        assert_eq!(got.fd, 7);
        assert!(store.get_host("default", 2).unwrap().is_none());
        assert!(store.get_host("other", 1).unwrap().is_none());
    }

    #[test]
    fn list_group_is_isolated_and_ordered() {
        let store = store();
        store.put_host(&host("game", 10, 1)).unwrap();
        store.put_host(&host("game", 2, 2)).unwrap();
        store.put_host(&host("gamex", 1, 3)).unwrap();
        store.put_host(&host("chat", 5, 4)).unwrap();

        let ids: Vec<_> = store.list_group("game").unwrap().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 10]);
        assert_eq!(store.list_hosts().unwrap().len(), 4);
    }

    #[test]
    fn connection_index_follows_host() {
        let store = store();
        store.put_host(&host("default", 1, 7)).unwrap();
        assert_eq!(store.host_for_connection(7).unwrap().unwrap().id, 1);
        assert!(store.host_for_connection(8).unwrap().is_none());

        // Re-registering over a new connection moves the index entry.
        store.put_host(&host("default", 1, 9)).unwrap();
        assert!(store.host_for_connection(7).unwrap().is_none());
        assert_eq!(store.host_for_connection(9).unwrap().unwrap().id, 1);
    }

    #[test]
    fn delete_removes_index_entry() {
        let store = store();
        store.put_host(&host("default", 1, 7)).unwrap();
        let removed = store.transact(|txn| txn.remove("default", 1)).unwrap().unwrap();
        assert_eq!(removed.id, 1);
        assert!(store.get_host("default", 1).unwrap().is_none());
        assert!(store.host_for_connection(7).unwrap().is_none());
        assert!(store.transact(|txn| txn.remove("default", 1)).unwrap().is_none());
    }

    // ── Soft delete ────────────────────────────────────────────────

    #[test]
    fn mark_removed_applies_once() {
        let store = store();
        store.put_host(&host("default", 1, 7)).unwrap();

        let mark = |at| {
            store.transact(|txn| {
                let mut row = txn.get("default", 1)?.unwrap();
                txn.mark_removed(&mut row, at)
            })
        };
        assert!(mark(1_000).unwrap());
        assert!(!mark(2_000).unwrap());

        let stored = store.get_host("default", 1).unwrap().unwrap();
        assert_eq!(stored.removed, 1_000);
        assert!(stored.announced);
        assert!(store.live_hosts().unwrap().is_empty());
        // The row stays reachable from its connection until swept.
        assert!(store.host_for_connection(7).unwrap().is_some());
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn failed_transaction_rolls_back() {
        let store = store();
        let result: StateResult<()> = store.transact(|txn| {
            txn.put(&host("default", 1, 7))?;
            Err(StateError::Write("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.get_host("default", 1).unwrap().is_none());
        assert!(store.host_for_connection(7).unwrap().is_none());
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let store = store();
        let count = store
            .transact(|txn| {
                txn.put(&host("default", 1, 1))?;
                txn.put(&host("default", 2, 2))?;
                txn.remove("default", 1)?;
                Ok(txn.list_group("default")?.len())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.list_hosts().unwrap().len(), 1);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("members.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_host(&host("default", 3, 11)).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get_host("default", 3).unwrap().unwrap().port, 9603);
        assert_eq!(store.host_for_connection(11).unwrap().unwrap().id, 3);
    }

    #[test]
    fn empty_store_operations() {
        let store = store();
        assert!(store.list_hosts().unwrap().is_empty());
        assert!(store.list_group("default").unwrap().is_empty());
        assert!(store.host_for_connection(1).unwrap().is_none());
    }
}
