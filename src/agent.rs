//! Supervisor: wires the configured components together and runs them as
//! one group. The first component to fail cancels the others.

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vault_client::auth::{new_auth_method, AuthConfig};
use vault_client::{VaultClient, VaultClientBuilder};

use crate::auth::{AuthHandler, AuthHandlerConfig};
use crate::cache::{database_path, BoltStorage, Index, KeyManager, StorageError};
use crate::config::{Config, PersistConfig, VaultConfig};
use crate::error::{AgentError, Result};
use crate::exec::ExecServer;
use crate::sink::server::{ConfiguredSink, SinkServer};
use crate::template::{file_targets, RenderTarget, Renderer, TemplateServer};

const USER_AGENT: &str = concat!("vault-agent/", env!("CARGO_PKG_VERSION"));

/// Build the API client from the `vault` stanza
pub fn build_client(config: &VaultConfig) -> Result<VaultClient> {
    let mut builder = VaultClientBuilder::new().user_agent(USER_AGENT);
    if let Some(ref address) = config.address {
        builder = builder.base_url(address);
    }
    if let Some(ref ns) = config.namespace {
        builder = builder.namespace(ns);
    }
    if let Some(ref ca) = config.ca_cert {
        builder = builder.ca_cert(ca);
    }
    if let Some(ref ca) = config.ca_path {
        builder = builder.ca_path(ca);
    }
    if let Some(ref cert) = config.client_cert {
        builder = builder.client_cert(cert);
    }
    if let Some(ref key) = config.client_key {
        builder = builder.client_key(key);
    }
    if let Some(skip) = config.tls_skip_verify {
        builder = builder.tls_skip_verify(skip);
    }
    if let Some(ref name) = config.tls_server_name {
        builder = builder.tls_server_name(name);
    }
    Ok(builder.build()?)
}

/// Persistent cache state recovered at start-up
#[derive(Default)]
pub struct RestoredCache {
    pub storage: Option<Arc<BoltStorage>>,
    pub token: Option<String>,
}

fn import(path: &Path) -> Result<(BoltStorage, Option<String>), StorageError> {
    let material = BoltStorage::read_retrieval_token(path)?
        .ok_or_else(|| StorageError::MissingRetrievalToken(path.display().to_string()))?;
    let key_manager = KeyManager::from_material(&material)?;
    let storage = BoltStorage::open(path, Arc::new(key_manager))?;
    let token = match storage.get_auto_auth_token()? {
        Some(bytes) => Some(Index::from_bytes(&bytes)?.token),
        None => None,
    };
    Ok((storage, token))
}

fn fresh_store(path: &Path, persist: &PersistConfig) -> Result<BoltStorage> {
    let key_manager = match persist.key.as_deref().filter(|k| !k.is_empty()) {
        Some(encoded) => {
            let raw = BASE64
                .decode(encoded.trim())
                .map_err(|e| AgentError::Config(format!("cache.persist.key is not base64: {}", e)))?;
            KeyManager::from_material(&raw)?
        }
        None => KeyManager::generate(),
    };
    let storage = BoltStorage::open(path, Arc::new(key_manager))?;
    storage.store_retrieval_token(storage.key_manager().retrieval_material())?;
    Ok(storage)
}

/// Import the auto-auth token of an existing cache file, then hand back the
/// store the agent keeps writing to.
///
/// Unless `keep_after_import` is set, the imported file is replaced by a
/// fresh one under a new key. Failures abort when `exit_on_err` is set;
/// otherwise the agent carries on with whatever could be recovered.
pub fn restore_cache(persist: &PersistConfig) -> Result<RestoredCache> {
    let path = database_path(&persist.path);
    let mut restored = RestoredCache::default();
    let mut kept = None;

    if path.exists() {
        match import(&path) {
            Ok((storage, token)) => {
                tracing::info!(
                    path = %path.display(),
                    token_found = token.is_some(),
                    "imported persistent cache"
                );
                restored.token = token;
                if persist.keep_after_import {
                    kept = Some(storage);
                }
            }
            Err(e) if persist.exit_on_err => return Err(e.into()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to import persistent cache, starting fresh");
            }
        }
    }

    let storage = match kept {
        Some(storage) => storage,
        None => {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    if persist.exit_on_err {
                        return Err(e.into());
                    }
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove imported cache file");
                }
            }
            match fresh_store(&path, persist) {
                Ok(storage) => storage,
                Err(e) if persist.exit_on_err => return Err(e),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "persistent cache unavailable, continuing in memory");
                    return Ok(restored);
                }
            }
        }
    };
    restored.storage = Some(Arc::new(storage));
    Ok(restored)
}

/// Resolves once every component that reports completion has done so
async fn auth_complete(
    mut token: watch::Receiver<Option<String>>,
    written: Option<watch::Receiver<bool>>,
    rendered: Option<watch::Receiver<bool>>,
) -> bool {
    if token.wait_for(|t| t.is_some()).await.is_err() {
        return false;
    }
    for mut rx in written.into_iter().chain(rendered) {
        if rx.wait_for(|done| *done).await.is_err() {
            return false;
        }
    }
    true
}

/// A configured agent, ready to run
pub struct Agent {
    config: Config,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run every configured component until `cancel` fires, exit-after-auth
    /// is satisfied or a component fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut config = self.config;
        let auto_auth = config
            .auto_auth
            .take()
            .ok_or_else(|| AgentError::Config("an auto_auth stanza is required".to_string()))?;

        if config.template_config.max_retries.is_none() {
            config.template_config.max_retries = config
                .vault
                .retry
                .as_ref()
                .and_then(|r| r.num_retries)
                .and_then(|n| u32::try_from(n).ok());
        }

        let client = build_client(&config.vault)?;
        tracing::info!(address = %client.address(), "starting agent");

        let restored = match config.persist() {
            Some(persist) => restore_cache(persist)?,
            None => RestoredCache::default(),
        };

        let method_config = &auto_auth.method;
        let mount_path = method_config
            .mount_path
            .clone()
            .unwrap_or_else(|| format!("auth/{}", method_config.method_type));
        let method = new_auth_method(
            &method_config.method_type,
            AuthConfig {
                mount_path,
                namespace: method_config.namespace.clone(),
                config: method_config.config.clone(),
            },
        )?;

        let mut handler_config = AuthHandlerConfig::new(client.clone());
        handler_config.namespace = method_config.namespace.clone();
        handler_config.wrap_ttl = method_config.wrap_ttl.filter(|t| !t.is_zero());
        if let Some(min) = method_config.min_backoff {
            handler_config.min_backoff = min;
        }
        if let Some(max) = method_config.max_backoff {
            handler_config.max_backoff = max;
        }
        handler_config.enable_reauth_on_new_credentials = auto_auth.enable_reauth_on_new_credentials;
        handler_config.exit_on_error = method_config.exit_on_err;
        handler_config.preloaded_token = restored.token;
        handler_config.storage = restored.storage.clone();
        let handler = AuthHandler::new(handler_config);

        let group = cancel.child_token();
        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
        let render_interval = config.template_config.render_interval();

        let mut written = None;
        if !auto_auth.sink.is_empty() {
            let sinks = auto_auth
                .sink
                .iter()
                .map(ConfiguredSink::from_config)
                .collect::<Result<Vec<_>>>()?;
            let server = SinkServer::new(client.clone(), sinks);
            written = Some(server.token_written());
            let tokens = handler.sink_tokens();
            let cancel = group.clone();
            tasks.spawn(async move { ("sink server", server.run(cancel, tokens).await) });
        }

        let mut rendered = None;
        if !config.template.is_empty() {
            let renderer = Renderer::new(&client, file_targets(&config.template)?, &config.template_config);
            let server = TemplateServer::new(
                renderer,
                render_interval,
                handler.invalid_token_signal(),
                handler.auth_in_progress(),
            )
            .with_exit_after_auth(config.exit_after_auth);
            rendered = Some(server.done());
            let tokens = handler.template_tokens();
            let cancel = group.clone();
            tasks.spawn(async move { ("template server", server.run(cancel, tokens).await) });
        }

        if let Some(ref exec) = config.exec {
            if config.exit_after_auth {
                tracing::warn!("exit_after_auth has no effect while an exec child is supervised");
            }
            let targets = config
                .env_template
                .iter()
                .map(RenderTarget::env)
                .collect::<Result<Vec<_>>>()?;
            let renderer = Renderer::new(&client, targets, &config.template_config);
            let server = ExecServer::new(
                exec,
                renderer,
                render_interval,
                handler.invalid_token_signal(),
                handler.auth_in_progress(),
            )?;
            let tokens = handler.exec_tokens();
            let cancel = group.clone();
            tasks.spawn(async move { ("exec server", server.run(cancel, tokens).await) });
        }

        if config.exit_after_auth && config.exec.is_none() {
            let token = handler.sink_tokens();
            let cancel = group.clone();
            tasks.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    complete = auth_complete(token, written, rendered) => {
                        if complete {
                            tracing::info!("exit_after_auth satisfied, shutting down");
                            cancel.cancel();
                        }
                    }
                }
                ("exit-after-auth", Ok(()))
            });
        }

        {
            let cancel = group.clone();
            tasks.spawn(async move { ("auth handler", handler.run(cancel, method).await) });
        }

        let mut first_error: Option<AgentError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => tracing::debug!(component = name, "component stopped"),
                Ok((name, Err(e))) => {
                    if let AgentError::ProcessExit { code } = e {
                        tracing::info!(component = name, code, "supervised process exited, shutting down");
                    } else {
                        tracing::error!(component = name, error = %e, "component failed, shutting down");
                    }
                    group.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "component task panicked, shutting down");
                    group.cancel();
                    first_error.get_or_insert(AgentError::Exec(format!("component task failed: {}", e)));
                }
            }
        }

        tracing::info!("agent stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
