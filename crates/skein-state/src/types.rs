//! Persisted cluster membership records.

use serde::{Deserialize, Serialize};
use skein_core::{ConnectionId, WorkerId};

/// Node id, unique within a group.
pub type NodeId = u32;

/// One registered cluster node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: NodeId,
    pub group: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub task_port: u16,
    #[serde(default)]
    pub worker_num: u32,
    #[serde(default)]
    pub task_num: u32,
    /// Session secret, present only when the node asked for encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Connection the node registered over.
    #[serde(default)]
    pub fd: ConnectionId,
    /// Worker that handled the registration.
    #[serde(default)]
    pub from_id: WorkerId,
    /// Soft-delete time in epoch milliseconds, 0 while live.
    #[serde(default)]
    pub removed: u64,
    /// Whether the `remove` event for this node went out already.
    #[serde(default)]
    pub announced: bool,
}

impl Host {
    /// Composite key: `{group}/{id:010}`.
    pub fn table_key(&self) -> String {
        host_key(&self.group, self.id)
    }

    pub fn is_live(&self) -> bool {
        self.removed == 0
    }

    /// `ip:port` of the node's RPC endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Composite key of a host; zero padding keeps ids in numeric order.
pub fn host_key(group: &str, id: NodeId) -> String {
    format!("{group}/{id:010}")
}

/// Prefix shared by every key of `group`.
pub fn group_prefix(group: &str) -> String {
    format!("{group}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_numerically() {
        assert!(host_key("g", 9) < host_key("g", 10));
        assert!(host_key("g", 10).starts_with(&group_prefix("g")));
        assert!(!host_key("gg", 1).starts_with(&group_prefix("g")));
    }

    #[test]
    fn wire_names_are_camel_case() {
        let host = Host {
            id: 3,
            group: "default".into(),
            ip: "10.0.0.1".into(),
            port: 9601,
            task_port: 9602,
            worker_num: 4,
            task_num: 2,
            key: None,
            fd: 12,
            from_id: 1,
            removed: 0,
            announced: false,
        };
        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json["taskPort"], 9602);
        assert_eq!(json["workerNum"], 4);
        assert_eq!(json["fromId"], 1);
        assert!(json.get("key").is_none());
        assert_eq!(host.address(), "10.0.0.1:9601");
    }

    #[test]
    fn missing_optional_fields_default() {
        let host: Host =
            serde_json::from_str(r#"{"id":1,"group":"g","ip":"1.2.3.4","port":80}"#).unwrap();
        assert!(host.is_live());
        assert_eq!(host.worker_num, 0);
    }
}
