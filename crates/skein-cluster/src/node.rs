//! Built-in service of a worker node.

use serde_json::{Value, json};
use skein_rpc::{Arity, CapabilityTable, RemoteError, Reply, Service};
use tokio::sync::watch;

use crate::types::Assignment;
use crate::view::MembershipView;

/// Answers liveness pings and exposes the node's view of the cluster.
pub struct NodeService {
    view: MembershipView,
    assignment: watch::Receiver<Option<Assignment>>,
}

impl NodeService {
    pub fn new(view: MembershipView, assignment: watch::Receiver<Option<Assignment>>) -> Self {
        Self { view, assignment }
    }
}

impl Service for NodeService {
    fn capabilities() -> CapabilityTable<Self> {
        CapabilityTable::new()
            .method("ping", Arity::Exact(0), |_node: &mut NodeService, _ctx, _args| {
                Ok(Reply::value("pong"))
            })
            .method("hosts", Arity::Range(0, 1), |node: &mut NodeService, _ctx, args| {
                let hosts = match args.first().and_then(Value::as_str) {
                    Some(group) => node.view.group(group),
                    None => node.view.hosts(),
                };
                serde_json::to_value(hosts)
                    .map(Reply::Value)
                    .map_err(|e| RemoteError::internal(e.to_string()))
            })
            .property("id", |node: &NodeService| match &*node.assignment.borrow() {
                Some(assignment) => json!(assignment.id),
                None => Value::Null,
            })
            .property("group", |node: &NodeService| match &*node.assignment.borrow() {
                Some(assignment) => json!(assignment.group),
                None => Value::Null,
            })
    }
}
