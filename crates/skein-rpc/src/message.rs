//! The logical unit exchanged between client and server.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::RemoteError;

/// Kind of a [`Message`], carried on the wire as its lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "get")]
    Get,
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "fun")]
    Fun,
    #[serde(rename = "bind")]
    Bind,
    /// Accepted as an alias of `fun`.
    #[serde(rename = "call")]
    Call,
    #[serde(rename = "on")]
    On,
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "reg")]
    Reg,
    #[serde(rename = "reg.ok")]
    RegOk,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "remove")]
    Remove,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::Get,
        MessageType::Set,
        MessageType::Fun,
        MessageType::Bind,
        MessageType::Call,
        MessageType::On,
        MessageType::Close,
        MessageType::Error,
        MessageType::Reg,
        MessageType::RegOk,
        MessageType::Add,
        MessageType::Remove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Get => "get",
            MessageType::Set => "set",
            MessageType::Fun => "fun",
            MessageType::Bind => "bind",
            MessageType::Call => "call",
            MessageType::On => "on",
            MessageType::Close => "close",
            MessageType::Error => "error",
            MessageType::Reg => "reg",
            MessageType::RegOk => "reg.ok",
            MessageType::Add => "add",
            MessageType::Remove => "remove",
        }
    }

    /// Property reads, property writes and method invocations.
    pub fn is_access(&self) -> bool {
        matches!(
            self,
            MessageType::Get | MessageType::Set | MessageType::Fun | MessageType::Call
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown message type: {s}"))
    }
}

/// One request, response, event or control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(rename = "rpcService", default)]
    pub rpc_service: String,
    /// Request id, echoed on the matching response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<f64>,
}

static LAST_REQUEST_MICROS: AtomicU64 = AtomicU64::new(0);

/// A fresh request id: seconds since the epoch with microsecond precision,
/// strictly increasing within the process.
pub fn next_request_id() -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let mut last = LAST_REQUEST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_REQUEST_MICROS.compare_exchange_weak(
            last,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next as f64 / 1_000_000.0,
            Err(current) => last = current,
        }
    }
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            name: None,
            args: None,
            rpc_service: String::new(),
            id: None,
        }
    }

    /// Method invocation with positional arguments.
    pub fn call(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(MessageType::Fun)
            .with_name(name)
            .with_args(Value::Array(args))
    }

    pub fn get(name: impl Into<String>) -> Self {
        Self::new(MessageType::Get).with_name(name)
    }

    pub fn set(name: impl Into<String>, value: Value) -> Self {
        Self::new(MessageType::Set).with_name(name).with_args(value)
    }

    /// Server-pushed event.
    pub fn event(name: impl Into<String>, args: Value) -> Self {
        Self::new(MessageType::On).with_name(name).with_args(args)
    }

    pub fn error(code: i64, msg: impl Into<String>) -> Self {
        Self::new(MessageType::Error).with_args(json!({ "code": code, "msg": msg.into() }))
    }

    /// Final message before the server closes the connection.
    pub fn close(code: i64, msg: impl Into<String>) -> Self {
        Self::new(MessageType::Close).with_args(json!({ "code": code, "msg": msg.into() }))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.rpc_service = service.into();
        self
    }

    pub fn with_id(mut self, id: Option<f64>) -> Self {
        self.id = id;
        self
    }

    /// The response to this request carrying `value`.
    pub fn reply(&self, value: Value) -> Message {
        Message {
            kind: self.kind,
            name: self.name.clone(),
            args: Some(value),
            rpc_service: self.rpc_service.clone(),
            id: self.id,
        }
    }

    /// Positional arguments of a method invocation.
    ///
    /// A missing `args` is an empty list and a non-array value is a single
    /// argument.
    pub fn positional_args(&self) -> Vec<Value> {
        match &self.args {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        }
    }

    /// `(code, msg)` of an `error` or `close` message.
    pub fn error_parts(&self) -> Option<(i64, String)> {
        if !matches!(self.kind, MessageType::Error | MessageType::Close) {
            return None;
        }
        let args = self.args.as_ref();
        let code = args
            .and_then(|a| a.get("code"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let msg = args
            .and_then(|a| a.get("msg"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((code, msg))
    }
}

impl From<&RemoteError> for Message {
    fn from(err: &RemoteError) -> Self {
        Message::error(err.code, err.msg.clone())
    }
}
