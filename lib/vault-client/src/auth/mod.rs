mod approle;
mod aws;
mod cert;
mod cf;
mod kubernetes;
mod token_file;
mod token_info;

pub use approle::AppRoleAuth;
pub use aws::AwsAuth;
pub use cert::CertAuth;
pub use cf::CfAuth;
pub use kubernetes::KubernetesAuth;
pub use token_file::TokenFileAuth;
pub use token_info::TokenInfo;

use crate::{VaultClient, VaultError};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Path used by methods that hand over an existing token instead of logging in.
pub const TOKEN_LOOKUP_SELF_PATH: &str = "auth/token/lookup-self";

/// A login call the handler should perform on behalf of a method
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub path: String,
    pub data: Value,
    pub headers: Option<HeaderMap>,
}

impl AuthRequest {
    pub fn login(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: path.into(),
            data,
            headers: None,
        }
    }

    /// Request that validates `token` through `lookup-self` and adopts it
    pub fn token_lookup(token: impl Into<String>) -> Self {
        Self {
            path: TOKEN_LOOKUP_SELF_PATH.to_string(),
            data: serde_json::json!({ "token": token.into() }),
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn is_token_lookup(&self) -> bool {
        self.path == TOKEN_LOOKUP_SELF_PATH
    }

    /// Token carried by a [`AuthRequest::token_lookup`] request
    pub fn lookup_token(&self) -> Option<&str> {
        if !self.is_token_lookup() {
            return None;
        }
        self.data.get("token").and_then(Value::as_str)
    }
}

/// Settings handed to a method factory
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mount_path: String,
    pub namespace: Option<String>,
    pub config: Map<String, Value>,
}

impl AuthConfig {
    pub fn new(mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            ..Default::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn login_path(&self) -> String {
        format!("{}/login", self.mount_path.trim_end_matches('/'))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn require_str(&self, key: &str) -> Result<String, VaultError> {
        self.get_str(key)
            .map(str::to_string)
            .ok_or_else(|| VaultError::Config(format!("missing '{}' value", key)))
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get_str(key).map(PathBuf::from)
    }

    /// Booleans may be written as `true` or as the string `"true"`
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, VaultError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| VaultError::Config(format!("could not parse '{}' as bool", key))),
            Some(_) => Err(VaultError::Config(format!("'{}' must be a bool", key))),
        }
    }

    /// Durations may be integer seconds or humantime strings such as `"30s"`
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, VaultError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|s| Some(Duration::from_secs(s)))
                .ok_or_else(|| VaultError::Config(format!("'{}' must be positive", key))),
            Some(Value::String(s)) => humantime::parse_duration(s)
                .map(Some)
                .map_err(|e| VaultError::Config(format!("could not parse '{}': {}", key, e))),
            Some(_) => Err(VaultError::Config(format!("'{}' must be a duration", key))),
        }
    }
}

/// Capability implemented by every login method.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the login request. Fails with [`VaultError::MethodUnavailable`]
    /// when credential material is missing.
    async fn authenticate(&self, client: &VaultClient) -> Result<AuthRequest, VaultError>;

    /// Signalled when the underlying credential material changes
    fn new_creds_notifier(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Invoked once after each successful login
    fn credential_success(&self) {}

    async fn shutdown(&self) {}

    /// Dedicated client the login must go through, if any
    fn auth_client(&self, _client: &VaultClient) -> Result<Option<VaultClient>, VaultError> {
        Ok(None)
    }
}

/// Build a method from its configured type name.
pub fn new_auth_method(
    method_type: &str,
    config: AuthConfig,
) -> Result<Arc<dyn AuthMethod>, VaultError> {
    let method: Arc<dyn AuthMethod> = match method_type {
        "token_file" => Arc::new(TokenFileAuth::new(&config)?),
        "approle" => Arc::new(AppRoleAuth::new(&config)?),
        "kubernetes" => Arc::new(KubernetesAuth::new(&config)?),
        "cert" => Arc::new(CertAuth::new(&config)?),
        "cf" => Arc::new(CfAuth::new(&config)?),
        "aws" => Arc::new(AwsAuth::new(&config)?),
        other => {
            return Err(VaultError::Config(format!(
                "unknown auth method type '{}'",
                other
            )));
        }
    };
    Ok(method)
}

pub(crate) fn read_trimmed(path: &std::path::Path) -> std::io::Result<String> {
    std::fs::read_to_string(path).map(|s| s.trim().to_string())
}
