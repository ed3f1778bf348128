//! `generate-config`: bootstrap an exec configuration from existing KV secrets.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use vault_client::VaultClient;

use crate::error::{AgentError, Result};

/// Where a KV secret lives
#[derive(Debug, Clone, PartialEq, Eq)]
struct KvLocation {
    mount: String,
    /// path below the mount, without leading or trailing slashes
    path: String,
    v2: bool,
}

impl KvLocation {
    fn read_path(&self) -> String {
        if self.v2 {
            format!("{}/data/{}", self.mount, self.path)
        } else {
            format!("{}/{}", self.mount, self.path)
        }
    }

    fn list_path(&self) -> String {
        if self.v2 {
            format!("{}/metadata/{}", self.mount, self.path)
        } else {
            format!("{}/{}", self.mount, self.path)
        }
    }

    fn child(&self, key: &str) -> Self {
        let path = if self.path.is_empty() {
            key.trim_end_matches('/').to_string()
        } else {
            format!("{}/{}", self.path, key.trim_end_matches('/'))
        };
        Self { path, ..self.clone() }
    }
}

/// Resolve the mount of `path`, falling back to its first segment as a KV v2
/// mount when the server does not expose mount information.
async fn locate(client: &VaultClient, path: &str) -> Result<KvLocation> {
    let path = path.trim_matches('/');
    let lookup = client
        .read(&format!("sys/internal/ui/mounts/{}", path))
        .await;

    let (mount, v2) = match lookup {
        Ok(Some(secret)) => {
            let mount = secret
                .data_str("path")
                .unwrap_or_default()
                .trim_matches('/')
                .to_string();
            let version = secret
                .data
                .as_ref()
                .and_then(|d| d.get("options"))
                .and_then(|o| o.get("version"))
                .and_then(Value::as_str)
                .unwrap_or("1")
                .to_string();
            (mount, version == "2")
        }
        Ok(None) | Err(_) => {
            let mount = path.split('/').next().unwrap_or_default().to_string();
            tracing::debug!(mount = %mount, "mount lookup unavailable, assuming KV v2");
            (mount, true)
        }
    };
    if mount.is_empty() {
        return Err(AgentError::Config(format!("cannot determine the mount of '{}'", path)));
    }
    let rest = path
        .strip_prefix(mount.as_str())
        .unwrap_or(path)
        .trim_matches('/')
        .to_string();
    Ok(KvLocation {
        mount,
        path: rest,
        v2,
    })
}

/// `secret/app/db` + `user` -> `SECRET_APP_DB_USER`
pub fn env_var_name(path: &str, key: &str) -> String {
    path.split(|c: char| !c.is_alphanumeric())
        .chain(key.split(|c: char| !c.is_alphanumeric()))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

async fn collect_secrets(
    client: &VaultClient,
    location: KvLocation,
    recurse: bool,
    out: &mut Vec<KvLocation>,
) -> Result<()> {
    if !recurse {
        out.push(location);
        return Ok(());
    }
    let mut pending = vec![location];
    while let Some(dir) = pending.pop() {
        let Some(listing) = client.list(&dir.list_path()).await? else {
            continue;
        };
        let keys = listing
            .data
            .as_ref()
            .and_then(|d| d.get("keys"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for key in keys.iter().filter_map(Value::as_str) {
            if key.ends_with('/') {
                pending.push(dir.child(key));
            } else {
                out.push(dir.child(key));
            }
        }
    }
    Ok(())
}

/// Build the env_template entries for one secret
async fn env_templates(client: &VaultClient, location: &KvLocation) -> Result<Vec<Value>> {
    let secret = client
        .read(&location.read_path())
        .await?
        .ok_or_else(|| AgentError::Config(format!("no secret at '{}'", location.read_path())))?;

    let data = secret.data.unwrap_or_default();
    let fields = if location.v2 {
        data.get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    } else {
        data
    };

    let location_path = format!("{}/{}", location.mount, location.path);
    let mut keys = BTreeSet::new();
    for key in fields.keys() {
        if key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            keys.insert(key);
        } else {
            tracing::warn!(path = %location_path, key = %key, "skipping key that cannot be addressed as a field");
        }
    }
    let accessor = if location.v2 { ".Data.data" } else { ".Data" };
    Ok(keys
        .into_iter()
        .map(|key| {
            json!({
                "name": env_var_name(&location_path, key),
                "contents": format!(
                    "{{{{ with secret \"{}\" }}}}{{{{ {}.{} }}}}{{{{ end }}}}",
                    location.read_path(),
                    accessor,
                    key
                ),
                "error_on_missing_key": true,
            })
        })
        .collect())
}

/// Render a JSON5 agent configuration that runs `exec` with one environment
/// variable per key of the secrets at `paths`. A path ending in `/*` includes
/// every secret below it.
pub async fn generate_config(client: &VaultClient, paths: &[String], exec: &[String]) -> Result<String> {
    if paths.is_empty() {
        return Err(AgentError::Config("at least one secret path is required".to_string()));
    }
    if exec.is_empty() {
        return Err(AgentError::Config("an exec command is required".to_string()));
    }

    let mut locations = Vec::new();
    for raw in paths {
        let (path, recurse) = match raw.strip_suffix("/*") {
            Some(p) => (p, true),
            None => (raw.as_str(), false),
        };
        let location = locate(client, path).await?;
        collect_secrets(client, location, recurse, &mut locations).await?;
    }

    let mut templates = Vec::new();
    for location in &locations {
        templates.extend(env_templates(client, location).await?);
    }
    tracing::info!(secrets = locations.len(), variables = templates.len(), "generated env templates");

    let token_file = std::env::var("HOME")
        .map(|home| format!("{}/.vault-token", home.trim_end_matches('/')))
        .unwrap_or_else(|_| ".vault-token".to_string());
    let config = json!({
        "auto_auth": {
            "method": {
                "type": "token_file",
                "config": { "token_file_path": token_file },
            },
        },
        "template_config": {
            "static_secret_render_interval": "5m",
            "exit_on_retry_failure": true,
        },
        "vault": { "address": client.address() },
        "env_template": templates,
        "exec": {
            "command": exec,
            "restart_on_secret_changes": "always",
            "restart_stop_signal": "SIGTERM",
        },
    });

    let body = serde_json::to_string_pretty(&config)?;
    Ok(format!("// generated by vault-agent generate-config\n{}\n", body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("secret/app-db", "user"), "SECRET_APP_DB_USER");
        assert_eq!(env_var_name("kv/nested/path", "api.key"), "KV_NESTED_PATH_API_KEY");
    }

    #[tokio::test]
    async fn test_generates_loadable_config() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/internal/ui/mounts/secret/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"path": "secret/", "type": "kv", "options": {"version": "2"}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "data": {"user": "admin", "password": "pw", "api-key": "k"},
                    "metadata": {"version": 1}
                }
            })))
            .mount(&server)
            .await;

        let client = VaultClient::builder().base_url(server.uri()).token("t").build().unwrap();
        let out = generate_config(&client, &["secret/app".to_string()], &["./app".to_string()])
            .await
            .unwrap();

        let mut config = Config::parse(&out).unwrap();
        config.validate().unwrap();
        // "api-key" cannot be written as a template field and is skipped
        let names: Vec<_> = config.env_template.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["SECRET_APP_PASSWORD", "SECRET_APP_USER"]);
        assert_eq!(
            config.env_template[1].contents.as_deref(),
            Some(r#"{{ with secret "secret/data/app" }}{{ .Data.data.user }}{{ end }}"#)
        );
        assert_eq!(config.exec.unwrap().command, vec!["./app"]);
    }

    #[tokio::test]
    async fn test_recursive_listing() {
        let server = MockServer::start().await;
        Mock::given(method("LIST"))
            .and(path("/v1/kv/metadata/team"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"keys": ["a", "sub/"]}})))
            .mount(&server)
            .await;
        Mock::given(method("LIST"))
            .and(path("/v1/kv/metadata/team/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"keys": ["b"]}})))
            .mount(&server)
            .await;

        let client = VaultClient::builder().base_url(server.uri()).build().unwrap();
        let root = KvLocation {
            mount: "kv".to_string(),
            path: "team".to_string(),
            v2: true,
        };
        let mut found = Vec::new();
        collect_secrets(&client, root, true, &mut found).await.unwrap();
        let mut paths: Vec<_> = found.iter().map(|l| l.read_path()).collect();
        paths.sort();
        assert_eq!(paths, vec!["kv/data/team/a", "kv/data/team/sub/b"]);
    }
}
