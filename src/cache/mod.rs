//! Encrypted persistent cache.

pub mod bolt;
pub mod index;
pub mod keymanager;

pub use bolt::{database_path, BoltStorage};
pub use index::{token_id, Index, IndexType};
pub use keymanager::KeyManager;

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to decrypt record '{id}': {source}")]
    Decrypt { id: String, source: CryptoError },
    #[error("unsupported storage version '{0}'")]
    UnsupportedVersion(String),
    #[error("no retrieval token material in {0}")]
    MissingRetrievalToken(String),
}
