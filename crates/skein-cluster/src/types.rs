//! Payloads of the registration protocol.

use serde::{Deserialize, Serialize};
use skein_core::config::NodeSection;
use skein_state::{Host, NodeId};

/// Body of a `reg` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    /// Proposed id; negative or absent means "allocate one".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Advertised address; the server uses the peer address when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub task_port: u16,
    pub worker_num: u32,
    pub task_num: u32,
    /// Ask the server for a per-node session key.
    pub encrypt: bool,
}

impl RegisterRequest {
    pub fn from_section(node: &NodeSection) -> Self {
        Self {
            id: node.id,
            group: Some(node.group.clone()),
            ip: node.ip.clone(),
            port: node.port,
            task_port: node.task_port,
            worker_num: node.worker_num,
            task_num: node.task_num,
            encrypt: node.encrypt,
        }
    }
}

/// Body of a `reg.ok` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub id: NodeId,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub key: Option<String>,
    pub ip: String,
    /// Every live node, the new one included.
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// Body of a `remove` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedNode {
    pub group: String,
    pub id: NodeId,
}

impl From<&Host> for RemovedNode {
    fn from(host: &Host) -> Self {
        Self {
            group: host.group.clone(),
            id: host.id,
        }
    }
}

/// What the register server assigned to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub id: NodeId,
    pub group: String,
    pub ip: String,
    pub key: Option<String>,
}

impl From<&RegisterReply> for Assignment {
    fn from(reply: &RegisterReply) -> Self {
        Self {
            id: reply.id,
            group: reply.group.clone(),
            ip: reply.ip.clone(),
            key: reply.key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_accepts_partial_bodies() {
        let req: RegisterRequest = serde_json::from_value(json!({"port": 9601})).unwrap();
        assert_eq!(req.port, Some(9601));
        assert_eq!(req.id, None);
        assert!(!req.encrypt);

        let req: RegisterRequest =
            serde_json::from_value(json!({"id": 4, "taskPort": 9602, "workerNum": 2})).unwrap();
        assert_eq!(req.id, Some(4));
        assert_eq!(req.task_port, 9602);
        assert_eq!(req.worker_num, 2);
    }

    #[test]
    fn request_from_node_section() {
        let node = NodeSection {
            port: Some(7001),
            group: "game".into(),
            encrypt: true,
            ..NodeSection::default()
        };
        let req = RegisterRequest::from_section(&node);
        assert_eq!(req.group.as_deref(), Some("game"));
        assert_eq!(req.port, Some(7001));
        assert!(req.encrypt);
        let wire = serde_json::to_value(&req).unwrap();
        assert!(wire.get("id").is_none());
        assert_eq!(wire["taskPort"], 0);
    }
}
