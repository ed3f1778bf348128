//! Agent configuration.
//!
//! The file is JSON5; durations are integer seconds or humantime strings
//! (`"10s"`, `"5m"`), file modes are octal strings (`"0640"`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TEMPLATE_RETRIES: u32 = 12;
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SINK_MODE: u32 = 0o640;
pub const DEFAULT_TEMPLATE_PERMS: u32 = 0o644;

mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Float(f64),
        Text(String),
    }

    fn parse<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Secs(s) => Ok(Duration::from_secs(s)),
            Raw::Float(f) if f >= 0.0 => Ok(Duration::from_secs_f64(f)),
            Raw::Float(f) => Err(E::custom(format!("negative duration {}", f))),
            Raw::Text(s) => match s.trim().parse::<u64>() {
                Ok(secs) => Ok(Duration::from_secs(secs)),
                Err(_) => humantime::parse_duration(s.trim()).map_err(E::custom),
            },
        }
    }

    pub fn option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<Raw>::deserialize(d)?.map(parse).transpose()
    }
}

mod mode {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Text(String),
    }

    fn octal<E: serde::de::Error>(digits: &str) -> Result<u32, E> {
        u32::from_str_radix(digits.trim_start_matches("0o"), 8)
            .map_err(|_| E::custom(format!("invalid file mode '{}'", digits)))
    }

    /// Modes are octal whether written as `"0640"` or `640`
    pub fn option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Num(n)) => octal(&n.to_string()).map(Some),
            Some(Raw::Text(s)) => octal(s.trim()).map(Some),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auto_auth: Option<AutoAuthConfig>,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub template: Vec<TemplateConfig>,
    #[serde(default)]
    pub env_template: Vec<EnvTemplateConfig>,
    #[serde(default)]
    pub exec: Option<ExecConfig>,
    #[serde(default)]
    pub template_config: TemplateSettings,
    #[serde(default)]
    pub exit_after_auth: bool,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoAuthConfig {
    pub method: MethodConfig,
    #[serde(default, alias = "sinks")]
    pub sink: Vec<SinkConfig>,
    #[serde(default)]
    pub enable_reauth_on_new_credentials: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MethodConfig {
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub mount_path: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, deserialize_with = "duration::option")]
    pub wrap_ttl: Option<Duration>,
    #[serde(default, deserialize_with = "duration::option")]
    pub min_backoff: Option<Duration>,
    #[serde(default, deserialize_with = "duration::option")]
    pub max_backoff: Option<Duration>,
    #[serde(default)]
    pub exit_on_err: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl MethodConfig {
    pub fn wraps(&self) -> bool {
        self.wrap_ttl.is_some_and(|t| !t.is_zero())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub sink_type: String,
    #[serde(default, deserialize_with = "duration::option")]
    pub wrap_ttl: Option<Duration>,
    #[serde(default)]
    pub dh_type: Option<String>,
    #[serde(default)]
    pub dh_path: Option<PathBuf>,
    #[serde(default)]
    pub aad: Option<String>,
    #[serde(default)]
    pub aad_env_var: Option<String>,
    #[serde(default)]
    pub derive_key: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub num_retries: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub tls_skip_verify: Option<bool>,
    #[serde(default)]
    pub tls_server_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub use_auto_auth_token: bool,
    #[serde(default)]
    pub persist: Option<PersistConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistConfig {
    #[serde(rename = "type", default = "PersistConfig::default_type")]
    pub persist_type: String,
    pub path: PathBuf,
    #[serde(default)]
    pub keep_after_import: bool,
    #[serde(default = "default_true")]
    pub exit_on_err: bool,
    /// base64 encoded 32 byte key; generated when absent
    #[serde(default)]
    pub key: Option<String>,
}

impl PersistConfig {
    fn default_type() -> String {
        "file".to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub contents: Option<String>,
    #[serde(default)]
    pub destination: PathBuf,
    #[serde(default)]
    pub error_on_missing_key: bool,
    #[serde(default, deserialize_with = "mode::option")]
    pub perms: Option<u32>,
    /// Group owner of the destination file
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub create_dest_dirs: bool,
    #[serde(default, deserialize_with = "duration::option")]
    pub render_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvTemplateConfig {
    pub name: String,
    #[serde(default)]
    pub contents: Option<String>,
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub error_on_missing_key: bool,
    /// Label used in logs
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    Always,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "ExecConfig::default_restart")]
    pub restart_on_secret_changes: String,
    #[serde(default, alias = "restart_kill_signal")]
    pub restart_stop_signal: Option<String>,
    #[serde(default, deserialize_with = "duration::option")]
    pub restart_kill_timeout: Option<Duration>,
}

impl ExecConfig {
    fn default_restart() -> String {
        "always".to_string()
    }

    /// `always`, `never`, or a signal name meaning `always` with that signal
    pub fn restart_policy(&self) -> Result<RestartPolicy> {
        match self.restart_on_secret_changes.as_str() {
            "always" => Ok(RestartPolicy::Always),
            "never" => Ok(RestartPolicy::Never),
            other if crate::exec::parse_signal(other).is_ok() => Ok(RestartPolicy::Always),
            other => Err(AgentError::Config(format!(
                "exec.restart_on_secret_changes must be 'always', 'never' or a signal name, got '{}'",
                other
            ))),
        }
    }

    /// Signal that stops the child before a restart, if one is configured
    pub fn stop_signal(&self) -> Option<&str> {
        match self.restart_stop_signal.as_deref() {
            Some(name) if !name.is_empty() => Some(name),
            _ => match self.restart_on_secret_changes.as_str() {
                "always" | "never" => None,
                other => Some(other),
            },
        }
    }

    pub fn kill_timeout(&self) -> Duration {
        self.restart_kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateSettings {
    #[serde(default, deserialize_with = "duration::option")]
    pub static_secret_render_interval: Option<Duration>,
    #[serde(default)]
    pub exit_on_retry_failure: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TemplateSettings {
    pub fn render_interval(&self) -> Duration {
        self.static_secret_render_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_RENDER_INTERVAL)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_TEMPLATE_RETRIES)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        json5::from_str(raw).map_err(|e| AgentError::Config(format!("failed to parse config: {}", e)))
    }

    /// Apply `VAULT_*` environment variables on top of the `vault` stanza
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(addr) = get("VAULT_ADDR") {
            self.vault.address = Some(addr);
        }
        if let Some(ca) = get("VAULT_CACERT") {
            self.vault.ca_cert = Some(PathBuf::from(ca));
        }
        if let Some(ca) = get("VAULT_CAPATH") {
            self.vault.ca_path = Some(PathBuf::from(ca));
        }
        if let Some(cert) = get("VAULT_CLIENT_CERT") {
            self.vault.client_cert = Some(PathBuf::from(cert));
        }
        if let Some(key) = get("VAULT_CLIENT_KEY") {
            self.vault.client_key = Some(PathBuf::from(key));
        }
        if let Some(skip) = get("VAULT_SKIP_VERIFY").and_then(|v| v.parse().ok()) {
            self.vault.tls_skip_verify = Some(skip);
        }
        if let Some(ns) = get("VAULT_NAMESPACE") {
            self.vault.namespace = Some(ns);
        }
    }

    /// Check cross-field rules and fill in derived defaults.
    pub fn validate(&mut self) -> Result<()> {
        self.validate_templates()?;
        self.validate_exec()?;

        let use_auto_auth_token = self.cache.as_ref().is_some_and(|c| c.use_auto_auth_token);

        if let Some(ref mut auto_auth) = self.auto_auth {
            let method = &mut auto_auth.method;
            if method.method_type.is_empty() {
                return Err(AgentError::Config("auto_auth.method.type is required".to_string()));
            }
            let mount = method
                .mount_path
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("auth/{}", method.method_type));
            method.mount_path = Some(mount.trim_end_matches('/').to_string());

            if let (Some(min), Some(max)) = (method.min_backoff, method.max_backoff) {
                if min > max {
                    return Err(AgentError::Config(
                        "auto_auth.method.min_backoff cannot exceed max_backoff".to_string(),
                    ));
                }
            }

            if auto_auth.sink.is_empty()
                && self.template.is_empty()
                && self.env_template.is_empty()
                && !use_auto_auth_token
            {
                return Err(AgentError::Config(
                    "auto_auth requires at least one sink, template or env_template, or cache.use_auto_auth_token=true".to_string(),
                ));
            }

            let method_wraps = auto_auth.method.wraps();
            for sink in auto_auth.sink.iter_mut() {
                validate_sink(sink)?;
                if method_wraps && sink.wrap_ttl.is_some_and(|t| !t.is_zero()) {
                    tracing::warn!(
                        sink_type = %sink.sink_type,
                        "auto_auth.method.wrap_ttl is set, ignoring the sink's wrap_ttl"
                    );
                    sink.wrap_ttl = None;
                }
            }

            if use_auto_auth_token && method_wraps {
                return Err(AgentError::Config(
                    "cache.use_auto_auth_token cannot be used with auto_auth.method.wrap_ttl".to_string(),
                ));
            }
        } else {
            if use_auto_auth_token {
                return Err(AgentError::Config(
                    "cache.use_auto_auth_token requires an auto_auth stanza".to_string(),
                ));
            }
            if !self.template.is_empty() || !self.env_template.is_empty() {
                return Err(AgentError::Config(
                    "templates require an auto_auth stanza".to_string(),
                ));
            }
        }

        if let Some(persist) = self.cache.as_ref().and_then(|c| c.persist.as_ref()) {
            if persist.persist_type != "file" {
                return Err(AgentError::Config(format!(
                    "unsupported cache.persist type '{}'",
                    persist.persist_type
                )));
            }
            if persist.path.as_os_str().is_empty() {
                return Err(AgentError::Config("cache.persist.path is required".to_string()));
            }
            if self.auto_auth.is_none() {
                return Err(AgentError::Config(
                    "cache.persist requires an auto_auth stanza".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_templates(&self) -> Result<()> {
        for t in &self.template {
            if t.source.is_some() == t.contents.is_some() {
                return Err(AgentError::Config(
                    "each template needs exactly one of 'source' or 'contents'".to_string(),
                ));
            }
            if t.destination.as_os_str().is_empty() {
                return Err(AgentError::Config("template destination is required".to_string()));
            }
        }
        Ok(())
    }

    fn validate_exec(&self) -> Result<()> {
        match (&self.exec, self.env_template.is_empty()) {
            (None, true) => return Ok(()),
            (None, false) => {
                return Err(AgentError::Config("env_template requires an exec stanza".to_string()));
            }
            (Some(_), true) => {
                return Err(AgentError::Config("exec requires at least one env_template".to_string()));
            }
            (Some(_), false) => {}
        }

        if !self.template.is_empty() {
            return Err(AgentError::Config(
                "template and env_template cannot be used together".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for t in &self.env_template {
            if t.name.is_empty() {
                return Err(AgentError::Config("env_template name is required".to_string()));
            }
            if !names.insert(t.name.as_str()) {
                return Err(AgentError::Config(format!(
                    "duplicate env_template name '{}'",
                    t.name
                )));
            }
            if t.source.is_some() == t.contents.is_some() {
                return Err(AgentError::Config(format!(
                    "env_template '{}' needs exactly one of 'source' or 'contents'",
                    t.name
                )));
            }
        }

        if let Some(ref exec) = self.exec {
            if exec.command.is_empty() || exec.command[0].is_empty() {
                return Err(AgentError::Config("exec.command is required".to_string()));
            }
            exec.restart_policy()?;
        }
        Ok(())
    }

    pub fn persist(&self) -> Option<&PersistConfig> {
        self.cache.as_ref().and_then(|c| c.persist.as_ref())
    }
}

fn validate_sink(sink: &SinkConfig) -> Result<()> {
    if sink.sink_type.is_empty() {
        return Err(AgentError::Config("sink type is required".to_string()));
    }
    match sink.dh_type.as_deref() {
        None | Some("") => {
            if sink.aad.is_some() || sink.aad_env_var.is_some() || sink.derive_key {
                return Err(AgentError::Config(
                    "sink aad and derive_key require dh_type".to_string(),
                ));
            }
        }
        Some("curve25519") => {
            if sink.dh_path.is_none() {
                return Err(AgentError::Config("sink dh_type requires dh_path".to_string()));
            }
        }
        Some(other) => {
            return Err(AgentError::Config(format!("unsupported dh_type '{}'", other)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        // comments are allowed
        auto_auth: {
            method: {
                type: "approle",
                wrap_ttl: "5m",
                min_backoff: 2,
                config: { role_id_file_path: "/tmp/role", secret_id_file_path: "/tmp/secret" },
            },
            sink: [
                { type: "file", wrap_ttl: "10s", config: { path: "/tmp/out", mode: "0600" } },
                { type: "file", dh_type: "curve25519", dh_path: "/tmp/dh.pub", derive_key: true, config: { path: "/tmp/dh-out" } },
            ],
        },
        vault: { address: "https://vault:8200", tls_skip_verify: true },
        template: [{ contents: "{{ .Data }}", destination: "/tmp/tmpl", perms: "0600" }],
        template_config: { static_secret_render_interval: "30s", exit_on_retry_failure: true },
        exit_after_auth: true,
    }"#;

    #[test]
    fn test_parse_full_config() {
        let mut config = Config::parse(FULL).unwrap();
        config.validate().unwrap();

        let auto_auth = config.auto_auth.as_ref().unwrap();
        assert_eq!(auto_auth.method.mount_path.as_deref(), Some("auth/approle"));
        assert_eq!(auto_auth.method.wrap_ttl, Some(Duration::from_secs(300)));
        assert_eq!(auto_auth.method.min_backoff, Some(Duration::from_secs(2)));
        assert_eq!(auto_auth.sink.len(), 2);
        // method wrapping supersedes the sink's
        assert!(auto_auth.sink[0].wrap_ttl.is_none());
        assert!(auto_auth.sink[1].derive_key);

        assert_eq!(config.template[0].perms, Some(0o600));
        assert_eq!(
            config.template_config.render_interval(),
            Duration::from_secs(30)
        );
        assert_eq!(config.template_config.max_retries(), DEFAULT_TEMPLATE_RETRIES);
        assert!(config.exit_after_auth);
    }

    #[test]
    fn test_auto_auth_needs_output() {
        let mut config = Config::parse(r#"{ auto_auth: { method: { type: "token_file" } } }"#).unwrap();
        assert!(config.validate().is_err());

        let mut config = Config::parse(
            r#"{ auto_auth: { method: { type: "token_file" } }, cache: { use_auto_auth_token: true } }"#,
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_auto_auth_token_conflicts_with_wrapping() {
        let mut config = Config::parse(
            r#"{ auto_auth: { method: { type: "token_file", wrap_ttl: 10 } }, cache: { use_auto_auth_token: true } }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_template_requires_exec() {
        let base = r#"{
            auto_auth: { method: { type: "token_file" } },
            env_template: [{ name: "DB_PASS", contents: "x" }],
        }"#;
        let mut config = Config::parse(base).unwrap();
        assert!(config.validate().is_err());

        let with_exec = r#"{
            auto_auth: { method: { type: "token_file" } },
            env_template: [{ name: "DB_PASS", contents: "x" }, { name: "DB_PASS", contents: "y" }],
            exec: { command: ["env"] },
        }"#;
        let mut config = Config::parse(with_exec).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_exec_restart_policy() {
        let raw = r#"{
            auto_auth: { method: { type: "token_file" } },
            env_template: [{ name: "A", contents: "x" }],
            exec: { command: ["env"], restart_on_secret_changes: "sometimes" },
        }"#;
        let mut config = Config::parse(raw).unwrap();
        assert!(config.validate().is_err());

        let exec: ExecConfig = json5::from_str(r#"{ command: ["env"], restart_kill_signal: "SIGINT" }"#).unwrap();
        assert_eq!(exec.restart_policy().unwrap(), RestartPolicy::Always);
        assert_eq!(exec.restart_stop_signal.as_deref(), Some("SIGINT"));
        assert_eq!(exec.kill_timeout(), DEFAULT_KILL_TIMEOUT);
    }

    #[test]
    fn test_template_and_env_template_exclusive() {
        let raw = r#"{
            auto_auth: { method: { type: "token_file" } },
            template: [{ contents: "x", destination: "/tmp/x" }],
            env_template: [{ name: "A", contents: "x" }],
            exec: { command: ["env"] },
        }"#;
        let mut config = Config::parse(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sink_dh_validation() {
        let sink = SinkConfig {
            sink_type: "file".to_string(),
            aad: Some("x".to_string()),
            ..Default::default()
        };
        assert!(validate_sink(&sink).is_err());

        let sink = SinkConfig {
            sink_type: "file".to_string(),
            dh_type: Some("curve25519".to_string()),
            ..Default::default()
        };
        assert!(validate_sink(&sink).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::parse(r#"{ vault: { address: "http://file:8200" } }"#).unwrap();
        config.apply_env(|name| match name {
            "VAULT_ADDR" => Some("http://env:8200".to_string()),
            "VAULT_SKIP_VERIFY" => Some("true".to_string()),
            "VAULT_NAMESPACE" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.vault.address.as_deref(), Some("http://env:8200"));
        assert_eq!(config.vault.tls_skip_verify, Some(true));
        assert!(config.vault.namespace.is_none());
    }

    #[test]
    fn test_numeric_mode_is_octal() {
        let t: TemplateConfig = json5::from_str(r#"{ contents: "x", destination: "/x", perms: 640 }"#).unwrap();
        assert_eq!(t.perms, Some(0o640));
    }
}
