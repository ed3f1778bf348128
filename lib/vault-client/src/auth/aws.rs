use super::{AuthConfig, AuthMethod, AuthRequest};
use crate::{VaultClient, VaultError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const STS_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";
const STS_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const SERVER_ID_HEADER: &str = "x-vault-aws-iam-server-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl Credentials {
    fn from_env() -> Option<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty())?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self {
            access_key,
            secret_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty()),
        })
    }
}

/// AWS IAM login: a SigV4-signed `sts:GetCallerIdentity` request the server
/// replays to establish the caller's identity.
///
/// When credentials come from the environment a background poller watches
/// for rotation and fires the new-credentials notifier.
pub struct AwsAuth {
    login_path: String,
    role: Option<String>,
    region: String,
    header_value: Option<String>,
    static_credentials: Option<Credentials>,
    poll_interval: Duration,
    notify: Arc<Notify>,
    poller: Mutex<Option<CancellationToken>>,
}

impl AwsAuth {
    pub fn new(config: &AuthConfig) -> Result<Self, VaultError> {
        let static_credentials = match (config.get_str("access_key"), config.get_str("secret_key")) {
            (Some(ak), Some(sk)) => Some(Credentials {
                access_key: ak.to_string(),
                secret_key: sk.to_string(),
                session_token: config.get_str("session_token").map(str::to_string),
            }),
            (None, None) => None,
            _ => {
                return Err(VaultError::Config(
                    "'access_key' and 'secret_key' must be set together".to_string(),
                ));
            }
        };

        if let Some(t) = config.get_str("type") {
            if t != "iam" {
                return Err(VaultError::Config(format!(
                    "unsupported aws auth type '{}', only 'iam' is available",
                    t
                )));
            }
        }

        Ok(Self {
            login_path: config.login_path(),
            role: config.get_str("role").map(str::to_string),
            region: config.get_str("region").unwrap_or(DEFAULT_REGION).to_string(),
            header_value: config.get_str("header_value").map(str::to_string),
            static_credentials,
            poll_interval: config
                .get_duration("credential_poll_interval")?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            notify: Arc::new(Notify::new()),
            poller: Mutex::new(None),
        })
    }

    fn credentials(&self) -> Result<Credentials, VaultError> {
        self.static_credentials
            .clone()
            .or_else(Credentials::from_env)
            .ok_or_else(|| VaultError::MethodUnavailable("no AWS credentials found".to_string()))
    }

    fn sts_host(&self) -> String {
        if self.region == DEFAULT_REGION {
            "sts.amazonaws.com".to_string()
        } else {
            format!("sts.{}.amazonaws.com", self.region)
        }
    }

    fn login_data(&self, creds: &Credentials, now: DateTime<Utc>) -> serde_json::Value {
        let host = self.sts_host();
        let url = format!("https://{}/", host);
        let headers = sign_request(
            creds,
            &self.region,
            &host,
            self.header_value.as_deref(),
            now,
        );

        // the server expects Go's http.Header shape: name -> [values]
        let header_json: BTreeMap<String, Vec<String>> = headers
            .into_iter()
            .map(|(k, v)| (canonical_header_name(&k), vec![v]))
            .collect();
        let header_json = serde_json::to_string(&header_json).unwrap_or_default();

        let mut data = serde_json::json!({
            "iam_http_request_method": "POST",
            "iam_request_url": STANDARD.encode(url),
            "iam_request_body": STANDARD.encode(STS_BODY),
            "iam_request_headers": STANDARD.encode(header_json),
        });
        if let Some(ref role) = self.role {
            data["role"] = serde_json::Value::String(role.clone());
        }
        data
    }

    fn start_poller(&self) {
        let Ok(mut guard) = self.poller.lock() else {
            return;
        };
        if guard.is_some() || self.static_credentials.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let cancel = CancellationToken::new();
        let notify = Arc::clone(&self.notify);
        let interval = self.poll_interval;
        let task_cancel = cancel.clone();
        handle.spawn(async move {
            let mut last = Credentials::from_env();
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let current = Credentials::from_env();
                if current.is_some() && current != last {
                    tracing::debug!("aws credentials changed, notifying");
                    notify.notify_one();
                }
                last = current;
            }
        });
        *guard = Some(cancel);
    }
}

#[async_trait]
impl AuthMethod for AwsAuth {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn authenticate(&self, _client: &VaultClient) -> Result<AuthRequest, VaultError> {
        let creds = self.credentials()?;
        Ok(AuthRequest::login(
            self.login_path.clone(),
            self.login_data(&creds, Utc::now()),
        ))
    }

    fn new_creds_notifier(&self) -> Option<Arc<Notify>> {
        self.start_poller();
        Some(Arc::clone(&self.notify))
    }

    async fn shutdown(&self) {
        if let Ok(mut guard) = self.poller.lock() {
            if let Some(cancel) = guard.take() {
                cancel.cancel();
            }
        }
    }
}

fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

/// Returns the lowercase header set of a SigV4-signed STS request,
/// `authorization` included.
fn sign_request(
    creds: &Credentials,
    region: &str,
    host: &str,
    server_id: Option<&str>,
    now: DateTime<Utc>,
) -> BTreeMap<String, String> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), STS_CONTENT_TYPE.to_string());
    headers.insert("host".to_string(), host.to_string());
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    if let Some(ref token) = creds.session_token {
        headers.insert("x-amz-security-token".to_string(), token.clone());
    }
    if let Some(id) = server_id {
        headers.insert(SERVER_ID_HEADER.to_string(), id.to_string());
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
    let payload_hash = hex::encode(Sha256::digest(STS_BODY.as_bytes()));

    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/sts/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&creds.secret_key, &date_stamp, region, "sts");
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    headers.insert(
        "authorization".to_string(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key, scope, signed_headers, signature
        ),
    );
    headers
}
