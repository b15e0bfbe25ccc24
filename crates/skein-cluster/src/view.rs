//! A node's local copy of cluster membership.

use std::collections::BTreeMap;
use std::sync::Arc;

use skein_state::{Host, NodeId};
use tokio::sync::watch;

pub type Membership = BTreeMap<(String, NodeId), Host>;

/// Ordered `(group, id) → Host` map fed by `reg.ok`, `add` and `remove`.
/// Every change is published to [`MembershipView::subscribe`] receivers.
#[derive(Clone)]
pub struct MembershipView {
    tx: Arc<watch::Sender<Membership>>,
}

impl Default for MembershipView {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipView {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Membership::new());
        Self { tx: Arc::new(tx) }
    }

    /// Replace the whole view with the live rows in `hosts`.
    pub fn reset(&self, hosts: impl IntoIterator<Item = Host>) {
        let fresh = hosts
            .into_iter()
            .filter(Host::is_live)
            .map(|h| ((h.group.clone(), h.id), h))
            .collect();
        self.tx.send_replace(fresh);
    }

    pub fn insert(&self, host: Host) {
        self.tx.send_modify(|m| {
            m.insert((host.group.clone(), host.id), host);
        });
    }

    pub fn remove(&self, group: &str, id: NodeId) -> Option<Host> {
        let mut removed = None;
        self.tx.send_if_modified(|m| {
            removed = m.remove(&(group.to_string(), id));
            removed.is_some()
        });
        removed
    }

    pub fn get(&self, group: &str, id: NodeId) -> Option<Host> {
        self.tx.borrow().get(&(group.to_string(), id)).cloned()
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.tx.borrow().values().cloned().collect()
    }

    pub fn group(&self, group: &str) -> Vec<Host> {
        self.tx
            .borrow()
            .values()
            .filter(|h| h.group == group)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Membership> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(group: &str, id: NodeId) -> Host {
        Host {
            id,
            group: group.into(),
            ip: "127.0.0.1".into(),
            port: 9000 + id as u16,
            task_port: 0,
            worker_num: 1,
            task_num: 0,
            key: None,
            fd: id as u64 + 1,
            from_id: 0,
            removed: 0,
            announced: false,
        }
    }

    #[test]
    fn reset_drops_removed_rows() {
        let view = MembershipView::new();
        let mut gone = host("default", 2);
        gone.removed = 10;
        view.reset([host("default", 1), gone, host("game", 0)]);
        assert_eq!(view.len(), 2);
        assert!(view.get("default", 2).is_none());
        assert_eq!(view.group("game").len(), 1);
    }

    #[test]
    fn hosts_are_ordered_by_group_then_id() {
        let view = MembershipView::new();
        view.insert(host("b", 1));
        view.insert(host("a", 5));
        view.insert(host("a", 2));
        let keys: Vec<_> = view.hosts().into_iter().map(|h| (h.group, h.id)).collect();
        assert_eq!(
            keys,
            vec![("a".to_string(), 2), ("a".to_string(), 5), ("b".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn changes_notify_subscribers() {
        let view = MembershipView::new();
        let mut rx = view.subscribe();

        view.insert(host("default", 1));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        // Removing an unknown node is not a change.
        assert!(view.remove("default", 9).is_none());
        assert!(!rx.has_changed().unwrap());

        assert!(view.remove("default", 1).is_some());
        assert!(rx.has_changed().unwrap());
        assert!(view.is_empty());
    }
}
