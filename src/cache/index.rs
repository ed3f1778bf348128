use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vault_client::auth::TokenInfo;

/// Bucket an index record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexType {
    Token,
    AuthLease,
    SecretLease,
}

impl IndexType {
    pub const ALL: [IndexType; 3] = [IndexType::Token, IndexType::AuthLease, IndexType::SecretLease];

    pub fn bucket(&self) -> &'static str {
        match self {
            IndexType::Token => "token",
            IndexType::AuthLease => "auth-lease",
            IndexType::SecretLease => "secret-lease",
        }
    }
}

/// Persisted record describing a token or lease the agent holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub token_accessor: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub request_path: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(rename = "type")]
    pub index_type: IndexType,
    pub last_renewed: DateTime<Utc>,
}

/// Stable id for a token: hex SHA-256 of its value
pub fn token_id(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl Index {
    /// Record for the auto-auth token
    pub fn auto_auth(info: &TokenInfo, namespace: Option<&str>) -> Self {
        Self {
            id: token_id(&info.token),
            token: info.token.clone(),
            token_accessor: info.accessor.clone(),
            namespace: namespace.unwrap_or_default().to_string(),
            request_path: "auth/token/lookup-self".to_string(),
            lease_duration: info.lease_duration.as_secs(),
            renewable: info.renewable,
            index_type: IndexType::Token,
            last_renewed: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
