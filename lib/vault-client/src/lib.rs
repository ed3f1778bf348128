//! vault-client - minimal client for the Vault HTTP API
//!
//! Provides a cloneable [`VaultClient`], the response models and the
//! [`auth::AuthMethod`] capability implemented by each login method:
//! token file, AppRole, Kubernetes, TLS certificate, Cloud Foundry
//! instance identity and AWS IAM.

pub mod auth;
mod client;
mod error;
mod models;

pub use client::{VaultClient, VaultClientBuilder, WRAPPING_WRAP_PATH};
pub use error::{ErrorKind, INVALID_TOKEN_MARKER, VaultError};
pub use models::{Secret, SecretAuth, SecretWrapInfo};
pub use reqwest::header::HeaderMap;
