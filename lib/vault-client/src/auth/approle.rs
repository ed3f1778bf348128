use super::{AuthConfig, AuthMethod, AuthRequest, read_trimmed};
use crate::{VaultClient, VaultError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

/// AppRole login: role id plus a (possibly single-use, possibly wrapped) secret id
pub struct AppRoleAuth {
    login_path: String,
    role_id_file_path: PathBuf,
    secret_id_file_path: Option<PathBuf>,
    remove_secret_id_file_after_reading: bool,
    secret_id_response_wrapping_path: Option<String>,
    cached_role_id: Mutex<Option<String>>,
    cached_secret_id: Mutex<Option<String>>,
}

impl AppRoleAuth {
    pub fn new(config: &AuthConfig) -> Result<Self, VaultError> {
        let role_id_file_path = config
            .get_path("role_id_file_path")
            .ok_or_else(|| VaultError::Config("missing 'role_id_file_path' value".to_string()))?;

        Ok(Self {
            login_path: config.login_path(),
            role_id_file_path,
            secret_id_file_path: config.get_path("secret_id_file_path"),
            remove_secret_id_file_after_reading: config
                .get_bool("remove_secret_id_file_after_reading", true)?,
            secret_id_response_wrapping_path: config
                .get_str("secret_id_response_wrapping_path")
                .map(|p| p.trim_matches('/').to_string()),
            cached_role_id: Mutex::new(None),
            cached_secret_id: Mutex::new(None),
        })
    }

    fn read_cached(
        path: &std::path::Path,
        cache: &Mutex<Option<String>>,
        what: &str,
    ) -> Result<Option<String>, VaultError> {
        let cached = cache.lock().ok().and_then(|c| c.clone());
        match read_trimmed(path) {
            Ok(value) if !value.is_empty() => {
                if let Ok(mut c) = cache.lock() {
                    *c = Some(value.clone());
                }
                Ok(Some(value))
            }
            Ok(_) => Ok(cached),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(cached),
            Err(e) => Err(VaultError::MethodUnavailable(format!(
                "failed to read {} file {}: {}",
                what,
                path.display(),
                e
            ))),
        }
    }

    async fn unwrap_secret_id(
        &self,
        client: &VaultClient,
        wrapping_token: &str,
        expected_path: &str,
    ) -> Result<String, VaultError> {
        let lookup = client.wrapping_lookup(wrapping_token).await?;
        let creation_path = lookup
            .data_str("creation_path")
            .unwrap_or_default()
            .trim_matches('/');
        if creation_path != expected_path {
            return Err(VaultError::AuthError(format!(
                "secret id wrapping token creation path '{}' does not match '{}'",
                creation_path, expected_path
            )));
        }

        let secret = client
            .unwrap(wrapping_token)
            .await?
            .ok_or_else(|| VaultError::AuthError("empty unwrap response".to_string()))?;
        secret
            .data_str("secret_id")
            .map(str::to_string)
            .ok_or_else(|| VaultError::AuthError("unwrapped response had no secret_id".to_string()))
    }
}

#[async_trait]
impl AuthMethod for AppRoleAuth {
    fn name(&self) -> &'static str {
        "approle"
    }

    async fn authenticate(&self, client: &VaultClient) -> Result<AuthRequest, VaultError> {
        let role_id = Self::read_cached(&self.role_id_file_path, &self.cached_role_id, "role id")?
            .ok_or_else(|| {
                VaultError::MethodUnavailable(format!(
                    "role id file {} is empty",
                    self.role_id_file_path.display()
                ))
            })?;

        let mut data = serde_json::json!({ "role_id": role_id });

        if let Some(ref path) = self.secret_id_file_path {
            let stored = Self::read_cached(path, &self.cached_secret_id, "secret id")?
                .ok_or_else(|| {
                    VaultError::MethodUnavailable(format!(
                        "secret id file {} is empty",
                        path.display()
                    ))
                })?;

            let secret_id = match self.secret_id_response_wrapping_path {
                Some(ref expected) => self.unwrap_secret_id(client, &stored, expected).await?,
                None => stored,
            };
            data["secret_id"] = serde_json::Value::String(secret_id);
        }

        Ok(AuthRequest::login(self.login_path.clone(), data))
    }

    fn credential_success(&self) {
        if !self.remove_secret_id_file_after_reading {
            return;
        }
        let Some(ref path) = self.secret_id_file_path else {
            return;
        };
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove secret id file");
            }
        }
        // a wrapped secret id is single use
        if self.secret_id_response_wrapping_path.is_some() {
            if let Ok(mut c) = self.cached_secret_id.lock() {
                *c = None;
            }
        }
    }
}
