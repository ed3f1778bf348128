use super::{AuthConfig, AuthMethod, AuthRequest, read_trimmed};
use crate::{VaultClient, VaultError};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;

const DEFAULT_JWT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Kubernetes authentication
pub struct KubernetesAuth {
    login_path: String,
    role: String,
    jwt_path: PathBuf,
}

#[derive(Serialize)]
struct LoginRequest {
    jwt: String,
    role: String,
}

impl KubernetesAuth {
    pub fn new(config: &AuthConfig) -> Result<Self, VaultError> {
        Ok(Self {
            login_path: config.login_path(),
            role: config.require_str("role")?,
            jwt_path: config
                .get_path("token_path")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_JWT_PATH)),
        })
    }

    pub fn with_jwt_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.jwt_path = path.into();
        self
    }

    fn read_jwt(&self) -> Result<String, VaultError> {
        let jwt = read_trimmed(&self.jwt_path).map_err(|e| {
            VaultError::MethodUnavailable(format!(
                "Failed to read JWT from {}: {}",
                self.jwt_path.display(),
                e
            ))
        })?;
        if jwt.is_empty() {
            return Err(VaultError::MethodUnavailable(format!(
                "JWT file {} is empty",
                self.jwt_path.display()
            )));
        }
        Ok(jwt)
    }
}

#[async_trait]
impl AuthMethod for KubernetesAuth {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn authenticate(&self, _client: &VaultClient) -> Result<AuthRequest, VaultError> {
        let body = LoginRequest {
            jwt: self.read_jwt()?,
            role: self.role.clone(),
        };
        Ok(AuthRequest::login(
            self.login_path.clone(),
            serde_json::to_value(body)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn auth() -> KubernetesAuth {
        KubernetesAuth::new(&AuthConfig::new("auth/kubernetes").with("role", "app")).unwrap()
    }

    #[test]
    fn test_read_jwt_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "my-jwt-token").unwrap();

        let auth = auth().with_jwt_path(file.path());
        assert_eq!(auth.read_jwt().unwrap(), "my-jwt-token");
    }

    #[test]
    fn test_read_jwt_missing_file() {
        let auth = auth().with_jwt_path("/nonexistent/path");
        assert!(matches!(auth.read_jwt(), Err(VaultError::MethodUnavailable(_))));
    }

    #[tokio::test]
    async fn test_login_request() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "jwt").unwrap();
        let auth = auth().with_jwt_path(file.path());
        let client = VaultClient::builder().base_url("http://vault:8200").build().unwrap();

        let req = auth.authenticate(&client).await.unwrap();
        assert_eq!(req.path, "auth/kubernetes/login");
        assert_eq!(req.data["role"], "app");
        assert_eq!(req.data["jwt"], "jwt");
    }

    #[test]
    fn test_role_required() {
        assert!(KubernetesAuth::new(&AuthConfig::new("auth/kubernetes")).is_err());
    }
}
