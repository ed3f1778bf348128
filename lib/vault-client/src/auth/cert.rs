use super::{AuthConfig, AuthMethod, AuthRequest};
use crate::{VaultClient, VaultError};
use async_trait::async_trait;
use std::path::PathBuf;

/// TLS certificate login. The identity is either the one configured on the
/// main client or a dedicated one from this method's settings.
pub struct CertAuth {
    login_path: String,
    name: Option<String>,
    client_cert: Option<PathBuf>,
    client_key: Option<PathBuf>,
    ca_cert: Option<PathBuf>,
}

impl CertAuth {
    pub fn new(config: &AuthConfig) -> Result<Self, VaultError> {
        let client_cert = config.get_path("client_cert");
        let client_key = config.get_path("client_key");
        if client_cert.is_some() != client_key.is_some() {
            return Err(VaultError::Config(
                "cert auth requires both 'client_cert' and 'client_key'".to_string(),
            ));
        }
        Ok(Self {
            login_path: config.login_path(),
            name: config.get_str("name").map(str::to_string),
            client_cert,
            client_key,
            ca_cert: config.get_path("ca_cert"),
        })
    }

    fn read(path: &PathBuf) -> Result<Vec<u8>, VaultError> {
        std::fs::read(path).map_err(|e| {
            VaultError::MethodUnavailable(format!("failed to read {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl AuthMethod for CertAuth {
    fn name(&self) -> &'static str {
        "cert"
    }

    async fn authenticate(&self, _client: &VaultClient) -> Result<AuthRequest, VaultError> {
        let mut data = serde_json::json!({});
        if let Some(ref name) = self.name {
            data["name"] = serde_json::Value::String(name.clone());
        }
        Ok(AuthRequest::login(self.login_path.clone(), data))
    }

    fn auth_client(&self, client: &VaultClient) -> Result<Option<VaultClient>, VaultError> {
        let (Some(cert), Some(key)) = (&self.client_cert, &self.client_key) else {
            return Ok(None);
        };
        let mut dedicated = client.with_client_identity(&Self::read(cert)?, &Self::read(key)?)?;
        if let Some(ref ca) = self.ca_cert {
            dedicated = dedicated.with_ca_cert(&Self::read(ca)?)?;
        }
        Ok(Some(dedicated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_login_with_role_name() {
        let auth = CertAuth::new(&AuthConfig::new("auth/cert").with("name", "web")).unwrap();
        let client = VaultClient::builder().base_url("http://vault:8200").build().unwrap();

        let req = auth.authenticate(&client).await.unwrap();
        assert_eq!(req.path, "auth/cert/login");
        assert_eq!(req.data["name"], "web");
        assert!(auth.auth_client(&client).unwrap().is_none());
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let conf = AuthConfig::new("auth/cert").with("client_cert", "/tmp/cert.pem");
        assert!(matches!(CertAuth::new(&conf), Err(VaultError::Config(_))));
    }

    #[test]
    fn test_unreadable_identity_is_unavailable() {
        let conf = AuthConfig::new("auth/cert")
            .with("client_cert", "/nonexistent/cert.pem")
            .with("client_key", "/nonexistent/key.pem");
        let auth = CertAuth::new(&conf).unwrap();
        let client = VaultClient::builder().base_url("http://vault:8200").build().unwrap();

        let result = auth.auth_client(&client);
        assert!(matches!(result, Err(VaultError::MethodUnavailable(_))));
    }
}
