use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::Gid;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use vault_client::{Secret, VaultClient, VaultError};

use super::engine::{SecretRequest, Template};
use crate::auth::Backoff;
use crate::config::{EnvTemplateConfig, TemplateConfig, TemplateSettings, DEFAULT_TEMPLATE_PERMS};
use crate::error::{AgentError, Result};
use crate::fsutil;

const RETRY_MIN: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(60);

/// Where a rendered template goes
#[derive(Debug, Clone)]
pub enum Output {
    File {
        path: PathBuf,
        perms: u32,
        group: Option<Gid>,
        create_dirs: bool,
    },
    Env {
        name: String,
    },
}

/// One template and the last content it produced
pub struct RenderTarget {
    template: Template,
    output: Output,
    contents: Option<String>,
}

fn load_source(contents: &Option<String>, source: &Option<PathBuf>) -> Result<String> {
    match (contents, source) {
        (Some(c), _) => Ok(c.clone()),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            AgentError::Template(format!("reading template {}: {}", path.display(), e))
        }),
        (None, None) => Err(AgentError::Config(
            "template needs 'source' or 'contents'".to_string(),
        )),
    }
}

impl RenderTarget {
    pub fn new(template: Template, output: Output) -> Self {
        Self {
            template,
            output,
            contents: None,
        }
    }

    pub fn file(config: &TemplateConfig) -> Result<Self> {
        let src = load_source(&config.contents, &config.source)?;
        let name = config.destination.display().to_string();
        let template = Template::parse(&name, &src, config.error_on_missing_key)?;
        let group = config
            .group
            .as_deref()
            .map(fsutil::resolve_group)
            .transpose()
            .map_err(|e| AgentError::Config(format!("template group: {}", e)))?;

        Ok(Self::new(
            template,
            Output::File {
                path: config.destination.clone(),
                perms: config.perms.unwrap_or(DEFAULT_TEMPLATE_PERMS),
                group,
                create_dirs: config.create_dest_dirs,
            },
        ))
    }

    pub fn env(config: &EnvTemplateConfig) -> Result<Self> {
        let src = load_source(&config.contents, &config.source)?;
        let template = Template::parse(&config.name, &src, config.error_on_missing_key)?;
        Ok(Self::new(
            template,
            Output::Env {
                name: config.name.clone(),
            },
        ))
    }

    pub fn name(&self) -> &str {
        self.template.name()
    }

    pub fn rendered(&self) -> bool {
        self.contents.is_some()
    }

    /// Store `contents`; returns whether anything changed
    async fn commit(&mut self, contents: String) -> Result<bool> {
        if self.contents.as_deref() == Some(contents.as_str()) {
            return Ok(false);
        }

        if let Output::File {
            ref path,
            perms,
            group,
            create_dirs,
        } = self.output
        {
            let path = path.clone();
            let bytes = contents.clone().into_bytes();
            let written = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
                if std::fs::read(&path).is_ok_and(|existing| existing == bytes) {
                    return Ok(false);
                }
                if create_dirs {
                    if let Some(dir) = path.parent() {
                        std::fs::create_dir_all(dir)?;
                    }
                }
                fsutil::atomic_write(&path, &bytes, perms, group)?;
                Ok(true)
            })
            .await
            .map_err(|e| AgentError::Template(format!("render task failed: {}", e)))?
            .map_err(|e| AgentError::Template(format!("writing {}: {}", self.name(), e)))?;

            if written {
                tracing::info!(destination = %self.name(), "rendered template");
            } else {
                tracing::debug!(destination = %self.name(), "template unchanged on disk");
            }
        }

        let changed = self.contents.is_some();
        self.contents = Some(contents);
        Ok(changed)
    }
}

/// Result of one render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Rendered {
        /// every template has rendered at least once
        complete: bool,
        /// a previously rendered template produced new content
        changed: bool,
    },
    /// The server rejected the token; nothing more can render with it
    TokenInvalid,
}

enum FetchFailure {
    Denied(VaultError),
    InvalidToken,
    Failed(VaultError),
    Cancelled,
}

/// Turn a response into the value templates see as `.`
fn secret_value(secret: Secret) -> Value {
    let mut obj = Map::new();
    obj.insert("LeaseID".to_string(), Value::from(secret.lease_id));
    obj.insert("LeaseDuration".to_string(), Value::from(secret.lease_duration));
    obj.insert("Renewable".to_string(), Value::from(secret.renewable));
    obj.insert(
        "Data".to_string(),
        secret.data.map(Value::Object).unwrap_or_else(|| Value::Object(Map::new())),
    );
    obj.insert(
        "Warnings".to_string(),
        Value::from(secret.warnings.unwrap_or_default()),
    );
    if let Some(auth) = secret.auth {
        obj.insert(
            "Auth".to_string(),
            serde_json::to_value(auth).unwrap_or(Value::Null),
        );
    }
    Value::Object(obj)
}

/// Fetches template secrets with the current token and renders every target
pub struct Renderer {
    client: VaultClient,
    targets: Vec<RenderTarget>,
    max_retries: u32,
    exit_on_retry_failure: bool,
    /// secret paths whose permission errors were logged with this token
    denied: HashSet<String>,
}

impl Renderer {
    pub fn new(client: &VaultClient, targets: Vec<RenderTarget>, settings: &TemplateSettings) -> Self {
        Self {
            client: client.clone_with_headers(),
            targets,
            max_retries: settings.max_retries(),
            exit_on_retry_failure: settings.exit_on_retry_failure,
            denied: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Start a new token epoch
    pub fn set_token(&mut self, token: &str) {
        self.client.set_token(token);
        self.denied.clear();
    }

    pub fn token(&self) -> Option<&str> {
        self.client.token()
    }

    /// Rendered environment variables, in template order
    pub fn env_values(&self) -> Vec<(String, String)> {
        self.targets
            .iter()
            .filter_map(|t| match (&t.output, &t.contents) {
                (Output::Env { name }, Some(value)) => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    async fn fetch_once(&self, request: &SecretRequest) -> std::result::Result<Secret, VaultError> {
        let response = if request.is_write() {
            self.client.write(&request.path, &request.body()).await?
        } else {
            self.client.read(&request.path).await?
        };
        response.ok_or_else(|| VaultError::SecretNotFound {
            path: request.path.clone(),
        })
    }

    async fn fetch(
        &self,
        request: &SecretRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<Value, FetchFailure> {
        let mut backoff = Backoff::new(RETRY_MIN, RETRY_MAX);
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchFailure::Cancelled),
                r = self.fetch_once(request) => r,
            };
            let err = match result {
                Ok(secret) => return Ok(secret_value(secret)),
                Err(e) if e.is_invalid_token() => return Err(FetchFailure::InvalidToken),
                Err(e) if e.is_permission_denied() => return Err(FetchFailure::Denied(e)),
                Err(e) => e,
            };
            if attempt >= self.max_retries {
                return Err(FetchFailure::Failed(err));
            }
            attempt += 1;
            let wait = backoff.next_wait();
            tracing::warn!(
                path = %request.path,
                error = %err,
                attempt,
                max_retries = self.max_retries,
                backoff = ?wait,
                "fetching secret failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchFailure::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Fetch every secret once, then render each target whose secrets were
    /// all available.
    pub async fn render_pass(&mut self, cancel: &CancellationToken) -> Result<PassOutcome> {
        let requests: Vec<SecretRequest> = {
            let mut seen = HashSet::new();
            self.targets
                .iter()
                .flat_map(|t| t.template.secrets())
                .filter(|r| seen.insert((*r).clone()))
                .cloned()
                .collect()
        };

        let mut secrets = HashMap::new();
        let mut unavailable = HashSet::new();
        for request in requests {
            match self.fetch(&request, cancel).await {
                Ok(value) => {
                    secrets.insert(request, value);
                }
                Err(FetchFailure::InvalidToken) => {
                    tracing::warn!(path = %request.path, "token was rejected while fetching a secret");
                    return Ok(PassOutcome::TokenInvalid);
                }
                Err(FetchFailure::Denied(e)) => {
                    if self.denied.insert(request.path.clone()) {
                        tracing::error!(path = %request.path, error = %e, "permission denied reading secret");
                    }
                    unavailable.insert(request);
                }
                Err(FetchFailure::Failed(e)) => {
                    tracing::error!(path = %request.path, error = %e, "fetching secret failed after retries");
                    if self.exit_on_retry_failure {
                        return Err(AgentError::Template(format!(
                            "fetching {} failed after {} retries: {}",
                            request.path, self.max_retries, e
                        )));
                    }
                    unavailable.insert(request);
                }
                Err(FetchFailure::Cancelled) => {
                    return Ok(PassOutcome::Rendered {
                        complete: self.targets.iter().all(RenderTarget::rendered),
                        changed: false,
                    });
                }
            }
        }

        let env = |name: &str| std::env::var(name).ok();
        let mut changed = false;
        for target in self.targets.iter_mut() {
            if target.template.secrets().any(|r| unavailable.contains(r)) {
                continue;
            }
            let contents = match target.template.render(&secrets, &env) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(template = %target.name(), error = %e, "template render failed");
                    if self.exit_on_retry_failure {
                        return Err(e.into());
                    }
                    continue;
                }
            };
            changed |= target.commit(contents).await?;
        }

        Ok(PassOutcome::Rendered {
            complete: self.targets.iter().all(RenderTarget::rendered),
            changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(max_retries: u32) -> TemplateSettings {
        TemplateSettings {
            max_retries: Some(max_retries),
            ..Default::default()
        }
    }

    fn file_target(dest: PathBuf, src: &str) -> RenderTarget {
        RenderTarget::file(&TemplateConfig {
            contents: Some(src.to_string()),
            destination: dest,
            create_dest_dirs: true,
            ..Default::default()
        })
        .unwrap()
    }

    async fn client(server: &MockServer) -> VaultClient {
        VaultClient::builder().base_url(server.uri()).build().unwrap()
    }

    #[tokio::test]
    async fn test_renders_file_once_per_change() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/app"))
            .and(header("X-Vault-Token", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"data": {"password": "hunter2"}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("app.conf");
        let target = file_target(
            dest.clone(),
            r#"{{ with secret "secret/data/app" }}pw={{ .Data.data.password }}{{ end }}"#,
        );
        let mut renderer = Renderer::new(&client(&server).await, vec![target], &settings(0));
        renderer.set_token("t1");
        let cancel = CancellationToken::new();

        let outcome = renderer.render_pass(&cancel).await.unwrap();
        assert_eq!(outcome, PassOutcome::Rendered { complete: true, changed: false });
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "pw=hunter2");

        let outcome = renderer.render_pass(&cancel).await.unwrap();
        assert_eq!(outcome, PassOutcome::Rendered { complete: true, changed: false });
    }

    #[tokio::test]
    async fn test_permission_denied_skips_only_affected_template() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/otherapp"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({"errors": ["1 error occurred:\n\t* permission denied\n\n"]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"data": {"k": "v"}}})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let denied = file_target(
            dir.path().join("denied"),
            r#"{{ with secret "secret/data/otherapp" }}{{ .Data.data.k }}{{ end }}"#,
        );
        let allowed = file_target(
            dir.path().join("allowed"),
            r#"{{ with secret "secret/data/app" }}{{ .Data.data.k }}{{ end }}"#,
        );
        let mut renderer = Renderer::new(&client(&server).await, vec![denied, allowed], &settings(0));
        renderer.set_token("t1");

        let outcome = renderer.render_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PassOutcome::Rendered { complete: false, changed: false });
        assert!(!dir.path().join("denied").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("allowed")).unwrap(), "v");
        assert!(renderer.denied.contains("secret/data/otherapp"));
    }

    #[tokio::test]
    async fn test_invalid_token_stops_pass() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/auth/token/lookup-self"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(json!({"errors": ["permission denied", "invalid token"]})),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = file_target(
            dir.path().join("out"),
            r#"{{ with secret "auth/token/lookup-self" }}{{ .Data.id }}{{ end }}"#,
        );
        let mut renderer = Renderer::new(&client(&server).await, vec![target], &settings(3));
        renderer.set_token("revoked");

        let outcome = renderer.render_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PassOutcome::TokenInvalid);
    }

    #[tokio::test]
    async fn test_retries_exhausted_with_exit_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = file_target(dir.path().join("out"), r#"{{ with secret "kv/flaky" }}x{{ end }}"#);
        let mut settings = settings(1);
        settings.exit_on_retry_failure = true;
        let mut renderer = Renderer::new(&client(&server).await, vec![target], &settings);
        renderer.set_token("t");

        let result = renderer.render_pass(&CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::Template(_))));
    }

    #[tokio::test]
    async fn test_env_values() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/db"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"data": {"user": "app"}}})))
            .mount(&server)
            .await;

        let target = RenderTarget::env(&EnvTemplateConfig {
            name: "DB_USER".to_string(),
            contents: Some(r#"{{ with secret "secret/data/db" }}{{ .Data.data.user }}{{ end }}"#.to_string()),
            ..Default::default()
        })
        .unwrap();
        let mut renderer = Renderer::new(&client(&server).await, vec![target], &settings(0));
        renderer.set_token("t");

        renderer.render_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(renderer.env_values(), vec![("DB_USER".to_string(), "app".to_string())]);
    }
}
