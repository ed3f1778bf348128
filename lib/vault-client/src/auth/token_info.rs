use crate::models::{Secret, SecretAuth};
use chrono::{DateTime, TimeZone, Utc};
use std::time::{Duration, Instant};

/// Token information from authentication
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub accessor: String,
    pub lease_duration: Duration,
    pub renewable: bool,
    pub policies: Vec<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub obtained_at: Instant,
}

impl TokenInfo {
    pub fn new(token: String, lease_duration: Duration, renewable: bool) -> Self {
        Self {
            token,
            accessor: String::new(),
            lease_duration,
            renewable,
            policies: Vec::new(),
            creation_time: None,
            obtained_at: Instant::now(),
        }
    }

    /// Token from the `auth` block of a login or renew response
    pub fn from_auth(auth: &SecretAuth) -> Self {
        let mut policies = auth.token_policies.clone();
        if policies.is_empty() {
            policies = auth.policies.clone();
        }
        Self {
            token: auth.client_token.clone(),
            accessor: auth.accessor.clone(),
            lease_duration: Duration::from_secs(auth.lease_duration),
            renewable: auth.renewable,
            policies,
            creation_time: Some(Utc::now()),
            obtained_at: Instant::now(),
        }
    }

    /// Token described by a `lookup-self` response; `None` without an id
    pub fn from_lookup(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let token = data.get("id")?.as_str()?.to_string();
        let ttl = data.get("ttl").and_then(|v| v.as_u64()).unwrap_or(0);
        let renewable = data
            .get("renewable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let policies = data
            .get("policies")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let creation_time = data
            .get("creation_time")
            .and_then(|v| v.as_i64())
            .and_then(|t| Utc.timestamp_opt(t, 0).single());

        Some(Self {
            token,
            accessor: secret.data_str("accessor").unwrap_or_default().to_string(),
            lease_duration: Duration::from_secs(ttl),
            renewable,
            policies,
            creation_time,
            obtained_at: Instant::now(),
        })
    }

    /// Token without lease (never expires)
    pub fn static_token(token: String) -> Self {
        Self::new(token, Duration::ZERO, false)
    }

    /// Time after `obtained_at` at which `fraction` of the lease has elapsed
    pub fn renew_at(&self, fraction: f64) -> Duration {
        Duration::from_secs_f64(self.lease_duration.as_secs_f64() * fraction)
    }

    /// Check if token is expired
    pub fn is_expired(&self) -> bool {
        if self.lease_duration.is_zero() {
            return false;
        }
        self.obtained_at.elapsed() >= self.lease_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token_never_expires() {
        let token = TokenInfo::static_token("test".to_string());
        assert!(!token.is_expired());
    }

    #[test]
    fn test_renew_at_fraction_of_lease() {
        let token = TokenInfo::new("test".to_string(), Duration::from_secs(100), true);
        assert_eq!(token.renew_at(0.5), Duration::from_secs(50));
    }

    #[test]
    fn test_token_not_expired_before_lease() {
        let mut token = TokenInfo::new("test".to_string(), Duration::from_secs(100), true);
        token.obtained_at = Instant::now() - Duration::from_secs(50);
        assert!(!token.is_expired());
    }

    #[test]
    fn test_from_lookup() {
        let secret: Secret = serde_json::from_str(
            r#"{"data": {
                "id": "s.lookup",
                "accessor": "acc",
                "ttl": 600,
                "renewable": true,
                "policies": ["default", "web"],
                "creation_time": 1700000000
            }}"#,
        )
        .unwrap();
        let info = TokenInfo::from_lookup(&secret).unwrap();
        assert_eq!(info.token, "s.lookup");
        assert_eq!(info.accessor, "acc");
        assert_eq!(info.lease_duration, Duration::from_secs(600));
        assert!(info.renewable);
        assert_eq!(info.policies, vec!["default", "web"]);
        assert!(info.creation_time.is_some());

        assert!(TokenInfo::from_lookup(&Secret::default()).is_none());
    }

    #[test]
    fn test_from_auth_prefers_token_policies() {
        let auth = SecretAuth {
            client_token: "s.x".to_string(),
            policies: vec!["default".to_string(), "identity".to_string()],
            token_policies: vec!["default".to_string()],
            lease_duration: 30,
            renewable: true,
            ..Default::default()
        };
        let info = TokenInfo::from_auth(&auth);
        assert_eq!(info.policies, vec!["default"]);
        assert_eq!(info.lease_duration, Duration::from_secs(30));
    }
}
