//! Error types for cluster registration.

use skein_rpc::RpcError;
use skein_state::StateError;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The register server refuses the request; the text is sent as the
    /// close frame message.
    #[error("registration conflict: {0}")]
    RegistrationConflict(String),

    /// The register server closed the registration connection.
    #[error("registration rejected ({code}): {msg}")]
    Rejected { code: i64, msg: String },

    #[error("registration client stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("random source failed: {0}")]
    Random(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl ClusterError {
    /// Close code sent to the peer when registration fails with this error.
    pub fn close_code(&self) -> i64 {
        match self {
            ClusterError::RegistrationConflict(_) => 409,
            ClusterError::Rejected { code, .. } => *code,
            _ => 500,
        }
    }
}
