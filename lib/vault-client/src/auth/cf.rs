use super::{AuthConfig, AuthMethod, AuthRequest};
use crate::{VaultClient, VaultError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use sha2::Sha256;
use std::path::PathBuf;

const INSTANCE_CERT_ENV: &str = "CF_INSTANCE_CERT";
const INSTANCE_KEY_ENV: &str = "CF_INSTANCE_KEY";
const SIGNING_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Cloud Foundry instance identity login.
///
/// The platform drops an instance certificate and key on disk and exports
/// their paths; the login proves possession of the key by signing
/// `signing_time || certificate || role`.
pub struct CfAuth {
    login_path: String,
    role: String,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl CfAuth {
    pub fn new(config: &AuthConfig) -> Result<Self, VaultError> {
        Ok(Self {
            login_path: config.login_path(),
            role: config.require_str("role")?,
            cert_path: None,
            key_path: None,
        })
    }

    /// Use fixed instance paths instead of the platform environment
    pub fn with_instance_paths(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert.into());
        self.key_path = Some(key.into());
        self
    }

    fn instance_path(fixed: &Option<PathBuf>, env: &str) -> Result<PathBuf, VaultError> {
        if let Some(path) = fixed {
            return Ok(path.clone());
        }
        std::env::var(env)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| VaultError::MethodUnavailable(format!("{} is not set", env)))
    }

    fn read(path: &PathBuf) -> Result<String, VaultError> {
        std::fs::read_to_string(path).map_err(|e| {
            VaultError::MethodUnavailable(format!("failed to read {}: {}", path.display(), e))
        })
    }

    fn parse_key(pem: &str) -> Result<RsaPrivateKey, VaultError> {
        RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| VaultError::AuthError(format!("invalid instance key: {}", e)))
    }

    fn sign(key: RsaPrivateKey, signing_time: &str, cert: &str, role: &str) -> String {
        let message = format!("{}{}{}", signing_time, cert, role);
        let signing_key = BlindedSigningKey::<Sha256>::new(key);
        let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), message.as_bytes());
        format!("v1:{}", URL_SAFE.encode(signature.to_vec()))
    }

    fn login_data(&self, now: DateTime<Utc>) -> Result<serde_json::Value, VaultError> {
        let cert = Self::read(&Self::instance_path(&self.cert_path, INSTANCE_CERT_ENV)?)?;
        let key = Self::parse_key(&Self::read(&Self::instance_path(
            &self.key_path,
            INSTANCE_KEY_ENV,
        )?)?)?;

        let signing_time = now.format(SIGNING_TIME_FORMAT).to_string();
        let signature = Self::sign(key, &signing_time, &cert, &self.role);

        Ok(serde_json::json!({
            "role": self.role,
            "cf_instance_cert": cert,
            "signing_time": signing_time,
            "signature": signature,
        }))
    }
}

#[async_trait]
impl AuthMethod for CfAuth {
    fn name(&self) -> &'static str {
        "cf"
    }

    async fn authenticate(&self, _client: &VaultClient) -> Result<AuthRequest, VaultError> {
        Ok(AuthRequest::login(
            self.login_path.clone(),
            self.login_data(Utc::now())?,
        ))
    }
}
