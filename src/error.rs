use thiserror::Error;
use vault_client::VaultError;

use crate::cache::StorageError;
use crate::crypto::CryptoError;

/// Top-level error of the agent; every component's `run` ends in one of these.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("persistent cache error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("exec error: {0}")]
    Exec(String),

    #[error("child process exited with code {code}")]
    ProcessExit { code: i32 },

    #[error("auth method failed permanently: {0}")]
    AuthFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Process exit status to report for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::ProcessExit { code } => *code,
            _ => 1,
        }
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
