use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generic response envelope returned by every logical endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
    #[serde(default)]
    pub auth: Option<SecretAuth>,
    #[serde(default)]
    pub wrap_info: Option<SecretWrapInfo>,
}

impl Secret {
    /// Look up a string field in `data`
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }
}

/// Authentication block returned by login and renew endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretAuth {
    pub client_token: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub token_policies: Vec<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

/// Response-wrapping envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretWrapInfo {
    pub token: String,
    #[serde(default)]
    pub accessor: String,
    pub ttl: u64,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub creation_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wrapped_accessor: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_response_deserialize() {
        let json = r#"{
            "request_id": "abc",
            "lease_id": "",
            "renewable": false,
            "lease_duration": 0,
            "data": null,
            "auth": {
                "client_token": "s.token",
                "accessor": "acc",
                "policies": ["default", "app"],
                "lease_duration": 3600,
                "renewable": true
            }
        }"#;
        let secret: Secret = serde_json::from_str(json).unwrap();
        let auth = secret.auth.unwrap();
        assert_eq!(auth.client_token, "s.token");
        assert_eq!(auth.lease_duration, 3600);
        assert!(auth.renewable);
        assert!(secret.wrap_info.is_none());
    }

    #[test]
    fn test_wrap_info_optional_fields() {
        let json = r#"{
            "token": "wrapping",
            "ttl": 10,
            "creation_time": "2024-01-01T00:00:00Z",
            "creation_path": "sys/wrapping/wrap"
        }"#;
        let info: SecretWrapInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.ttl, 10);
        assert_eq!(info.creation_path, "sys/wrapping/wrap");
        assert!(info.accessor.is_empty());
    }

    #[test]
    fn test_data_str() {
        let json = r#"{"data": {"id": "s.abc", "ttl": 20}}"#;
        let secret: Secret = serde_json::from_str(json).unwrap();
        assert_eq!(secret.data_str("id"), Some("s.abc"));
        assert_eq!(secret.data_str("ttl"), None);
        assert_eq!(secret.data_str("missing"), None);
    }
}
