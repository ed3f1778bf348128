use crate::error::VaultError;
use crate::models::{Secret, SecretWrapInfo};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";
const WRAP_TTL_HEADER: &str = "X-Vault-Wrap-TTL";
const REQUEST_HEADER: &str = "X-Vault-Request";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub const WRAPPING_WRAP_PATH: &str = "sys/wrapping/wrap";

/// TLS material kept around so a client can be rebuilt with another identity
#[derive(Clone, Default)]
struct TlsSettings {
    ca_certs: Vec<Vec<u8>>,
    identity: Option<Vec<u8>>,
    skip_verify: bool,
}

impl TlsSettings {
    fn http_client(&self, timeout: Duration) -> Result<reqwest::Client, VaultError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(self.skip_verify);

        for pem in &self.ca_certs {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| VaultError::Config(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(ref pem) = self.identity {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| VaultError::Config(format!("Invalid client certificate: {}", e)))?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| VaultError::Config(format!("Failed to build HTTP client: {}", e)))
    }
}

pub struct VaultClientBuilder {
    base_url: Option<String>,
    token: Option<String>,
    namespace: Option<String>,
    ca_cert: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    client_cert: Option<PathBuf>,
    client_key: Option<PathBuf>,
    tls_skip_verify: Option<bool>,
    tls_server_name: Option<String>,
    timeout: Duration,
    user_agent: Option<String>,
}

impl Default for VaultClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            token: None,
            namespace: None,
            ca_cert: None,
            ca_path: None,
            client_cert: None,
            client_key: None,
            tls_skip_verify: None,
            tls_server_name: None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key = Some(path.into());
        self
    }

    pub fn tls_skip_verify(mut self, skip: bool) -> Self {
        self.tls_skip_verify = Some(skip);
        self
    }

    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn env_path(name: &str) -> Option<PathBuf> {
        std::env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
    }

    fn resolve_tls(&self) -> Result<TlsSettings, VaultError> {
        let mut tls = TlsSettings {
            skip_verify: self
                .tls_skip_verify
                .or_else(|| {
                    std::env::var("VAULT_SKIP_VERIFY")
                        .ok()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(false),
            ..Default::default()
        };

        if let Some(path) = self.ca_cert.clone().or_else(|| Self::env_path("VAULT_CACERT")) {
            tls.ca_certs.push(read_file(&path)?);
        }

        if let Some(dir) = self.ca_path.clone().or_else(|| Self::env_path("VAULT_CAPATH")) {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            for path in entries {
                tls.ca_certs.push(read_file(&path)?);
            }
        }

        let client_cert = self
            .client_cert
            .clone()
            .or_else(|| Self::env_path("VAULT_CLIENT_CERT"));
        let client_key = self
            .client_key
            .clone()
            .or_else(|| Self::env_path("VAULT_CLIENT_KEY"));

        match (client_cert, client_key) {
            (Some(cert), Some(key)) => {
                tls.identity = Some(identity_pem(&read_file(&cert)?, &read_file(&key)?));
            }
            (None, None) => {}
            _ => {
                return Err(VaultError::Config(
                    "client_cert and client_key must be set together".to_string(),
                ));
            }
        }

        Ok(tls)
    }

    pub fn build(self) -> Result<VaultClient, VaultError> {
        let base_url = self
            .base_url
            .clone()
            .or_else(|| std::env::var("VAULT_ADDR").ok())
            .ok_or(VaultError::VaultNotDetected)?;

        let token = self
            .token
            .clone()
            .or_else(|| std::env::var("VAULT_TOKEN").ok())
            .filter(|t| !t.is_empty());

        let namespace = self
            .namespace
            .clone()
            .or_else(|| std::env::var("VAULT_NAMESPACE").ok())
            .filter(|n| !n.is_empty());

        if let Some(ref name) = self.tls_server_name {
            tracing::warn!(
                tls_server_name = %name,
                "TLS server name override is not supported by the HTTP transport, using the address host"
            );
        }

        let tls = self.resolve_tls()?;
        let http = tls.http_client(self.timeout)?;

        let mut headers = HeaderMap::new();
        if let Some(ref agent) = self.user_agent {
            let value = HeaderValue::from_str(agent)
                .map_err(|e| VaultError::Config(format!("Invalid user agent: {}", e)))?;
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        Ok(VaultClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            namespace,
            headers,
            tls,
            timeout: self.timeout,
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, VaultError> {
    std::fs::read(path).map_err(|e| {
        VaultError::Config(format!("Failed to read {}: {}", path.display(), e))
    })
}

fn identity_pem(cert: &[u8], key: &[u8]) -> Vec<u8> {
    let mut pem = Vec::with_capacity(cert.len() + key.len() + 1);
    pem.extend_from_slice(key);
    if !key.ends_with(b"\n") {
        pem.push(b'\n');
    }
    pem.extend_from_slice(cert);
    pem
}

/// Client for the secret service HTTP API.
///
/// Cloning is cheap; every component of the agent works on its own clone so
/// that token and namespace changes stay local to it.
#[derive(Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    namespace: Option<String>,
    headers: HeaderMap,
    tls: TlsSettings,
    timeout: Duration,
}

impl VaultClient {
    pub fn from_env() -> Result<Self, VaultError> {
        VaultClientBuilder::new().build()
    }

    pub fn builder() -> VaultClientBuilder {
        VaultClientBuilder::new()
    }

    pub fn address(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    pub fn clear_token(&mut self) {
        self.token = None;
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() { None } else { Some(namespace) };
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), VaultError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| VaultError::Config(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| VaultError::Config(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Copy of this client with the same address, namespace, headers and TLS
    /// settings but without a token.
    pub fn clone_with_headers(&self) -> Self {
        let mut client = self.clone();
        client.token = None;
        client
    }

    /// Copy of this client presenting the given PEM client certificate.
    pub fn with_client_identity(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, VaultError> {
        let mut tls = self.tls.clone();
        tls.identity = Some(identity_pem(cert_pem, key_pem));
        let http = tls.http_client(self.timeout)?;
        Ok(Self {
            http,
            tls,
            ..self.clone_with_headers()
        })
    }

    /// Copy of this client trusting an extra CA certificate.
    pub fn with_ca_cert(&self, ca_pem: &[u8]) -> Result<Self, VaultError> {
        let mut tls = self.tls.clone();
        tls.ca_certs.push(ca_pem.to_vec());
        let http = tls.http_client(self.timeout)?;
        Ok(Self {
            http,
            tls,
            ..self.clone()
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        extra_headers: Option<&HeaderMap>,
        wrap_ttl: Option<Duration>,
    ) -> Result<Option<Secret>, VaultError> {
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .headers(self.headers.clone())
            .header(REQUEST_HEADER, "true");

        if let Some(ref token) = self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(ref namespace) = self.namespace {
            request = request.header(NAMESPACE_HEADER, namespace);
        }
        if let Some(ttl) = wrap_ttl {
            request = request.header(WRAP_TTL_HEADER, format!("{}s", ttl.as_secs()));
        }
        if let Some(extra) = extra_headers {
            request = request.headers(extra.clone());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VaultError::RequestError(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| VaultError::RequestError(e.to_string()))?;

        if status == 204 {
            return Ok(None);
        }

        if status == 404 && (method == Method::GET || method.as_str() == "LIST") {
            let err = VaultError::from_response(status, &text);
            if let VaultError::ClientError { ref errors, .. } = err {
                if errors.is_empty() {
                    return Ok(None);
                }
            }
            return Err(VaultError::SecretNotFound {
                path: path.to_string(),
            });
        }

        if !(200..300).contains(&status) {
            return Err(VaultError::from_response(status, &text));
        }

        if text.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Read a logical path; `None` when the path holds nothing
    pub async fn read(&self, path: &str) -> Result<Option<Secret>, VaultError> {
        self.request(Method::GET, path, None, None, None).await
    }

    pub async fn write(
        &self,
        path: &str,
        data: &serde_json::Value,
    ) -> Result<Option<Secret>, VaultError> {
        self.request(Method::PUT, path, Some(data), None, None).await
    }

    pub async fn write_with_headers(
        &self,
        path: &str,
        data: &serde_json::Value,
        headers: &HeaderMap,
    ) -> Result<Option<Secret>, VaultError> {
        self.request(Method::PUT, path, Some(data), Some(headers), None)
            .await
    }

    /// List keys under `path`; `None` when there are none
    pub async fn list(&self, path: &str) -> Result<Option<Secret>, VaultError> {
        let method = Method::from_bytes(b"LIST")
            .map_err(|e| VaultError::RequestError(format!("invalid method: {}", e)))?;
        self.request(method, path, None, None, None).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), VaultError> {
        self.request(Method::DELETE, path, None, None, None).await?;
        Ok(())
    }

    pub async fn lookup_self(&self) -> Result<Secret, VaultError> {
        self.request(Method::GET, "auth/token/lookup-self", None, None, None)
            .await?
            .ok_or_else(|| VaultError::AuthError("empty lookup-self response".to_string()))
    }

    /// Look up an arbitrary token using the client's own token
    pub async fn lookup_token(&self, token: &str) -> Result<Secret, VaultError> {
        let body = serde_json::json!({ "token": token });
        self.request(Method::PUT, "auth/token/lookup", Some(&body), None, None)
            .await?
            .ok_or_else(|| VaultError::AuthError("empty token lookup response".to_string()))
    }

    pub async fn renew_self(&self, increment: Option<Duration>) -> Result<Secret, VaultError> {
        let body = match increment {
            Some(inc) => serde_json::json!({ "increment": inc.as_secs() }),
            None => serde_json::json!({}),
        };
        self.request(Method::PUT, "auth/token/renew-self", Some(&body), None, None)
            .await?
            .ok_or_else(|| VaultError::AuthError("empty renew-self response".to_string()))
    }

    /// Exchange `data` for a single-use wrapping token valid for `ttl`
    pub async fn wrap(
        &self,
        data: &serde_json::Value,
        ttl: Duration,
    ) -> Result<SecretWrapInfo, VaultError> {
        let secret = self
            .request(Method::PUT, WRAPPING_WRAP_PATH, Some(data), None, Some(ttl))
            .await?
            .ok_or_else(|| VaultError::RequestError("empty wrap response".to_string()))?;

        secret
            .wrap_info
            .ok_or_else(|| VaultError::RequestError("wrap response had no wrap_info".to_string()))
    }

    pub async fn unwrap(&self, wrapping_token: &str) -> Result<Option<Secret>, VaultError> {
        let mut client = self.clone_with_headers();
        client.set_token(wrapping_token);
        client
            .request(Method::PUT, "sys/wrapping/unwrap", None, None, None)
            .await
    }

    pub async fn wrapping_lookup(&self, wrapping_token: &str) -> Result<Secret, VaultError> {
        let body = serde_json::json!({ "token": wrapping_token });
        self.clone_with_headers()
            .request(Method::PUT, "sys/wrapping/lookup", Some(&body), None, None)
            .await?
            .ok_or_else(|| VaultError::RequestError("empty wrapping lookup response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = VaultClientBuilder::new();
        assert!(builder.base_url.is_none());
        assert!(builder.token.is_none());
        assert_eq!(builder.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_builder_chain() {
        let builder = VaultClientBuilder::new()
            .base_url("http://vault:8200")
            .token("my-token")
            .namespace("team-a");

        assert_eq!(builder.base_url, Some("http://vault:8200".to_string()));
        assert_eq!(builder.token, Some("my-token".to_string()));
        assert_eq!(builder.namespace, Some("team-a".to_string()));
    }

    #[test]
    fn test_clone_with_headers_drops_token() {
        let mut client = VaultClient::builder()
            .base_url("http://vault:8200/")
            .token("root")
            .build()
            .unwrap();
        client.set_namespace("ns1");

        let clone = client.clone_with_headers();
        assert!(clone.token().is_none());
        assert_eq!(clone.namespace(), Some("ns1"));
        assert_eq!(clone.address(), "http://vault:8200");
        assert_eq!(client.token(), Some("root"));
    }

    #[test]
    fn test_url_join() {
        let client = VaultClient::builder()
            .base_url("http://vault:8200")
            .build()
            .unwrap();
        assert_eq!(
            client.url("/auth/token/lookup-self"),
            "http://vault:8200/v1/auth/token/lookup-self"
        );
    }

    #[test]
    fn test_mismatched_client_identity_rejected() {
        let result = VaultClient::builder()
            .base_url("http://vault:8200")
            .client_cert("/tmp/only-cert.pem")
            .build();
        assert!(result.is_err());
    }
}
