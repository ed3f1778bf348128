use super::{AuthConfig, AuthMethod, AuthRequest, read_trimmed};
use crate::{VaultClient, VaultError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

/// Adopts a token written to a file by some other process
pub struct TokenFileAuth {
    path: PathBuf,
    remove_after_reading: bool,
    cached: Mutex<Option<String>>,
}

impl TokenFileAuth {
    pub fn new(config: &AuthConfig) -> Result<Self, VaultError> {
        let path = config
            .get_path("token_file_path")
            .ok_or_else(|| VaultError::Config("missing 'token_file_path' value".to_string()))?;
        Ok(Self {
            path,
            remove_after_reading: config.get_bool("remove_token_file_after_reading", false)?,
            cached: Mutex::new(None),
        })
    }

    fn cached_token(&self) -> Option<String> {
        self.cached.lock().ok().and_then(|c| c.clone())
    }

    fn read_token(&self) -> Result<String, VaultError> {
        match read_trimmed(&self.path) {
            Ok(token) if !token.is_empty() => {
                if let Ok(mut cached) = self.cached.lock() {
                    *cached = Some(token.clone());
                }
                Ok(token)
            }
            Ok(_) => self.cached_token().ok_or_else(|| {
                VaultError::MethodUnavailable(format!(
                    "token file {} is empty",
                    self.path.display()
                ))
            }),
            Err(e) => self.cached_token().ok_or_else(|| {
                VaultError::MethodUnavailable(format!(
                    "failed to read token file {}: {}",
                    self.path.display(),
                    e
                ))
            }),
        }
    }
}

#[async_trait]
impl AuthMethod for TokenFileAuth {
    fn name(&self) -> &'static str {
        "token_file"
    }

    async fn authenticate(&self, _client: &VaultClient) -> Result<AuthRequest, VaultError> {
        tracing::trace!(path = %self.path.display(), "reading token file");
        Ok(AuthRequest::token_lookup(self.read_token()?))
    }

    fn credential_success(&self) {
        if !self.remove_after_reading {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove token file");
            }
        }
    }
}
