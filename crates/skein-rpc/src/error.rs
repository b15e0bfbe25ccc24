//! Error types for the skein RPC layer.

use std::time::Duration;

use skein_pool::PoolError;
use thiserror::Error;

/// Result type alias for envelope and frame codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type alias for client and server operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Failures while turning messages into frames and back.
///
/// Every decode-side variant means the envelope is corrupt or forged; the
/// receiver never executes anything carried by it.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("envelope issued at {issued} is older than allowed (now {now})")]
    Expired { issued: u64, now: u64 },

    #[error("envelope issued at {issued} lies in the future (now {now})")]
    FromFuture { issued: u64, now: u64 },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid delimiter: {0}")]
    InvalidDelimiter(String),

    #[error("random source unavailable: {0}")]
    Random(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure reported by the remote side, or by a service handler.
///
/// Codes follow HTTP conventions: 400 bad arguments, 403 forbidden name,
/// 404 unknown operation, 500 handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {msg}")]
pub struct RemoteError {
    pub code: i64,
    pub msg: String,
}

impl RemoteError {
    pub fn new(code: i64, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(400, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(403, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(404, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(500, msg)
    }
}

/// Errors surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("remote error {code}: {msg}")]
    Remote { code: i64, msg: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed by server: {0}")]
    ConnectionClosedByServer(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("usage error: {0}")]
    Usage(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl RpcError {
    /// The remote error code, if this is a [`RpcError::Remote`].
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote {
            code: err.code,
            msg: err.msg,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}
