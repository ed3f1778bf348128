use thiserror::Error;

/// Marker the server puts into 403 responses when the token itself is no
/// longer usable (revoked, expired or unknown).
pub const INVALID_TOKEN_MARKER: &str = "invalid token";
const PERMISSION_DENIED_MARKER: &str = "permission denied";
const TOKEN_NOT_FOUND_MARKER: &str = "token not found";
const BAD_TOKEN_MARKER: &str = "bad token";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Vault not detected: VAULT_ADDR not set")]
    VaultNotDetected,

    #[error("Secret not found: {path}")]
    SecretNotFound { path: String },

    #[error("Vault client error ({status}): {message}")]
    ClientError {
        status: u16,
        message: String,
        errors: Vec<String>,
    },

    #[error("Vault request error: {0}")]
    RequestError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Auth method unavailable: {0}")]
    MethodUnavailable(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Behavioural classification used by the agent's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failures and 5xx: retry with backoff until cancelled.
    Transient,
    /// Credential material is missing: back off and retry.
    MethodUnavailable,
    /// Configuration and non-retryable 4xx.
    Permanent,
}

impl VaultError {
    pub(crate) fn from_response(status: u16, body: &str) -> Self {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            errors: Vec<String>,
        }

        let errors = serde_json::from_str::<ErrorBody>(body)
            .map(|b| b.errors)
            .unwrap_or_default();
        let message = if errors.is_empty() {
            body.trim().to_string()
        } else {
            errors.join("; ")
        };

        VaultError::ClientError {
            status,
            message,
            errors,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::RequestError(_) | VaultError::Io(_) => ErrorKind::Transient,
            VaultError::ClientError { status, .. } if *status >= 500 || *status == 429 => {
                ErrorKind::Transient
            }
            VaultError::MethodUnavailable(_) => ErrorKind::MethodUnavailable,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            VaultError::ClientError { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn mentions(&self, marker: &str) -> bool {
        match self {
            VaultError::ClientError {
                message, errors, ..
            } => {
                message.to_lowercase().contains(marker)
                    || errors.iter().any(|e| e.to_lowercase().contains(marker))
            }
            _ => false,
        }
    }

    /// The token was rejected as a whole: the caller must re-authenticate.
    pub fn is_invalid_token(&self) -> bool {
        self.status() == Some(403) && self.mentions(INVALID_TOKEN_MARKER)
    }

    /// The token is fine but lacks a policy for the requested resource.
    pub fn is_permission_denied(&self) -> bool {
        self.status() == Some(403)
            && self.mentions(PERMISSION_DENIED_MARKER)
            && !self.mentions(INVALID_TOKEN_MARKER)
    }

    /// Failure returned by a token endpoint (renew-self, lookup-self) for a
    /// token that no longer exists on the server.
    pub fn is_token_revoked(&self) -> bool {
        matches!(self.status(), Some(400) | Some(403))
            && (self.mentions(PERMISSION_DENIED_MARKER)
                || self.mentions(TOKEN_NOT_FOUND_MARKER)
                || self.mentions(BAD_TOKEN_MARKER)
                || self.mentions(INVALID_TOKEN_MARKER))
    }
}
