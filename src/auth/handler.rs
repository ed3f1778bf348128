use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use vault_client::auth::{AuthMethod, AuthRequest, TokenInfo};
use vault_client::{ErrorKind, SecretWrapInfo, VaultClient, VaultError};

use super::backoff::Backoff;
use crate::cache::{BoltStorage, Index, IndexType, StorageError};
use crate::error::{AgentError, Result};

/// Token stream shared with a consumer; `None` until the first login
pub type TokenReceiver = watch::Receiver<Option<String>>;

/// Fraction of the lease to wait before renewing, plus up to `RENEW_JITTER`
const RENEW_FRACTION: f64 = 0.5;
const RENEW_JITTER: f64 = 0.2;

/// Handle consumers use to report that a token was rejected by the server.
///
/// Signals carry the rejected token; the handler ignores signals for tokens it
/// no longer holds, so one rejection yields at most one re-authentication.
#[derive(Clone)]
pub struct InvalidTokenSignal {
    tx: mpsc::Sender<String>,
}

impl InvalidTokenSignal {
    pub fn signal(&self, token: &str) {
        // a pending signal already covers this one
        let _ = self.tx.try_send(token.to_string());
    }
}

pub struct AuthHandlerConfig {
    pub client: VaultClient,
    pub namespace: Option<String>,
    pub wrap_ttl: Option<Duration>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub enable_reauth_on_new_credentials: bool,
    pub exit_on_error: bool,
    /// Token restored from the persistent cache, validated before use
    pub preloaded_token: Option<String>,
    pub storage: Option<Arc<BoltStorage>>,
}

impl AuthHandlerConfig {
    pub fn new(client: VaultClient) -> Self {
        Self {
            client,
            namespace: None,
            wrap_ttl: None,
            min_backoff: crate::config::DEFAULT_MIN_BACKOFF,
            max_backoff: crate::config::DEFAULT_MAX_BACKOFF,
            enable_reauth_on_new_credentials: false,
            exit_on_error: false,
            preloaded_token: None,
            storage: None,
        }
    }
}

enum Login {
    Token(TokenInfo),
    Wrapped(SecretWrapInfo),
}

enum Wake {
    Cancelled,
    Reauth(&'static str),
    Renew,
}

/// Owns the agent's token: logs in, renews, re-authenticates on revocation
/// and publishes each new token to sinks, templates and exec in that order.
pub struct AuthHandler {
    config: AuthHandlerConfig,
    sink_tx: watch::Sender<Option<String>>,
    template_tx: watch::Sender<Option<String>>,
    exec_tx: watch::Sender<Option<String>>,
    invalid_tx: mpsc::Sender<String>,
    invalid_rx: mpsc::Receiver<String>,
    auth_in_progress: Arc<AtomicBool>,
}

impl AuthHandler {
    pub fn new(config: AuthHandlerConfig) -> Self {
        let (sink_tx, _) = watch::channel(None);
        let (template_tx, _) = watch::channel(None);
        let (exec_tx, _) = watch::channel(None);
        let (invalid_tx, invalid_rx) = mpsc::channel(1);
        Self {
            config,
            sink_tx,
            template_tx,
            exec_tx,
            invalid_tx,
            invalid_rx,
            auth_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sink_tokens(&self) -> TokenReceiver {
        self.sink_tx.subscribe()
    }

    pub fn template_tokens(&self) -> TokenReceiver {
        self.template_tx.subscribe()
    }

    pub fn exec_tokens(&self) -> TokenReceiver {
        self.exec_tx.subscribe()
    }

    pub fn invalid_token_signal(&self) -> InvalidTokenSignal {
        InvalidTokenSignal {
            tx: self.invalid_tx.clone(),
        }
    }

    /// True while a login call is in flight
    pub fn auth_in_progress(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.auth_in_progress)
    }

    fn login_client(&self, method: &dyn AuthMethod) -> std::result::Result<VaultClient, VaultError> {
        let mut client = match method.auth_client(&self.config.client)? {
            Some(c) => c,
            None => self.config.client.clone_with_headers(),
        };
        if let Some(ref ns) = self.config.namespace {
            client.set_namespace(ns.clone());
        }
        Ok(client)
    }

    async fn lookup(client: &VaultClient, token: &str) -> std::result::Result<TokenInfo, VaultError> {
        let mut client = client.clone();
        client.set_token(token);
        let secret = client.lookup_self().await?;
        TokenInfo::from_lookup(&secret)
            .ok_or_else(|| VaultError::AuthError("lookup-self response had no token id".to_string()))
    }

    async fn login(
        &self,
        method: &dyn AuthMethod,
        preloaded: Option<String>,
    ) -> std::result::Result<Login, VaultError> {
        let client = self.login_client(method)?;

        let info = match preloaded {
            Some(token) => Self::lookup(&client, &token).await?,
            None => {
                let request: AuthRequest = method.authenticate(&client).await?;
                match request.lookup_token() {
                    Some(token) => Self::lookup(&client, token).await?,
                    None => {
                        let secret = match request.headers {
                            Some(ref headers) => {
                                client
                                    .write_with_headers(&request.path, &request.data, headers)
                                    .await?
                            }
                            None => client.write(&request.path, &request.data).await?,
                        };
                        let auth = secret.and_then(|s| s.auth).ok_or_else(|| {
                            VaultError::AuthError("login response had no auth data".to_string())
                        })?;
                        TokenInfo::from_auth(&auth)
                    }
                }
            }
        };

        match self.config.wrap_ttl.filter(|t| !t.is_zero()) {
            Some(ttl) => {
                let mut wrapper = client.clone();
                wrapper.set_token(info.token.clone());
                let wrap_info = wrapper
                    .wrap(&serde_json::json!({ "token": info.token }), ttl)
                    .await?;
                Ok(Login::Wrapped(wrap_info))
            }
            None => Ok(Login::Token(info)),
        }
    }

    fn publish(&self, token: &str) {
        for tx in [&self.sink_tx, &self.template_tx, &self.exec_tx] {
            tx.send_replace(Some(token.to_string()));
        }
    }

    async fn persist(&self, info: &TokenInfo) {
        let Some(storage) = self.config.storage.clone() else {
            return;
        };
        let index = Index::auto_auth(info, self.config.namespace.as_deref());
        let result = tokio::task::spawn_blocking(move || {
            let bytes = index.to_bytes().map_err(StorageError::from)?;
            storage.set(&index.id, &bytes, IndexType::Token)
        })
        .await;

        match result {
            Ok(Ok(())) => tracing::debug!("persisted auto-auth token"),
            Ok(Err(e)) => tracing::error!(error = %e, "failed to persist auto-auth token"),
            Err(e) => tracing::error!(error = %e, "persist task failed"),
        }
    }

    fn renewal_wait(info: &TokenInfo) -> Option<Duration> {
        if info.lease_duration.is_zero() {
            return None;
        }
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=RENEW_JITTER);
        let elapsed = info.obtained_at.elapsed();
        Some(info.renew_at(RENEW_FRACTION + jitter).saturating_sub(elapsed))
    }

    /// Block until something requires action on the current token
    async fn wait_for_event(
        &mut self,
        cancel: &CancellationToken,
        current: Option<&str>,
        renew_in: Option<Duration>,
        creds: Option<&Arc<Notify>>,
    ) -> Wake {
        let sleep = async {
            match renew_in {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        let new_creds = async {
            match creds {
                Some(n) => n.notified().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(sleep);
        tokio::pin!(new_creds);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Wake::Cancelled,
                signal = self.invalid_rx.recv() => match signal {
                    Some(token) if current.is_none() || current == Some(token.as_str()) => {
                        return Wake::Reauth("invalid token signalled");
                    }
                    Some(_) => tracing::debug!("ignoring invalid-token signal for a previous token"),
                    None => return Wake::Cancelled,
                },
                _ = &mut new_creds => return Wake::Reauth("auth method reported new credentials"),
                _ = &mut sleep => return Wake::Renew,
            }
        }
    }

    /// Keep `info` alive until it must be replaced. Returns `true` when a new
    /// login is needed, `false` on cancellation.
    async fn watch_lifetime(
        &mut self,
        cancel: &CancellationToken,
        mut info: TokenInfo,
        creds: Option<&Arc<Notify>>,
    ) -> bool {
        let mut client = self.config.client.clone_with_headers();
        if let Some(ref ns) = self.config.namespace {
            client.set_namespace(ns.clone());
        }
        client.set_token(info.token.clone());

        let mut retry = Backoff::new(self.config.min_backoff, self.config.max_backoff);
        let mut renew_in = Self::renewal_wait(&info);

        loop {
            match self
                .wait_for_event(cancel, Some(&info.token), renew_in, creds)
                .await
            {
                Wake::Cancelled => return false,
                Wake::Reauth(reason) => {
                    tracing::info!(reason, "re-authenticating");
                    return true;
                }
                Wake::Renew => {}
            }

            if !info.renewable {
                tracing::info!("token is not renewable, re-authenticating");
                return true;
            }

            tracing::debug!("renewing token");
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                r = client.renew_self(None) => r,
            };

            match result {
                Ok(secret) => {
                    retry.reset();
                    let Some(auth) = secret.auth else {
                        tracing::warn!("renew response had no auth data, re-authenticating");
                        return true;
                    };
                    let renewed = TokenInfo::from_auth(&auth);
                    if renewed.lease_duration.is_zero() {
                        tracing::info!("lease can no longer be extended, re-authenticating");
                        return true;
                    }
                    if renewed.lease_duration < info.lease_duration {
                        tracing::warn!(
                            previous = ?info.lease_duration,
                            granted = ?renewed.lease_duration,
                            "renewal granted a shorter lease than requested"
                        );
                    }
                    info.lease_duration = renewed.lease_duration;
                    info.renewable = renewed.renewable;
                    info.obtained_at = renewed.obtained_at;
                    self.persist(&info).await;
                    renew_in = Self::renewal_wait(&info);
                }
                Err(e) if e.is_token_revoked() => {
                    tracing::warn!(error = %e, "token was revoked, re-authenticating");
                    return true;
                }
                Err(e) => {
                    if info.is_expired() {
                        tracing::warn!(error = %e, "renewal failed and lease expired, re-authenticating");
                        return true;
                    }
                    let wait = retry.next_wait();
                    tracing::warn!(error = %e, backoff = ?wait, "renewal failed, retrying");
                    renew_in = Some(wait);
                }
            }
        }
    }

    /// Run until `cancel` fires. Returns an error only when `exit_on_error`
    /// is set and the method fails permanently.
    pub async fn run(mut self, cancel: CancellationToken, method: Arc<dyn AuthMethod>) -> Result<()> {
        tracing::info!(method = method.name(), "starting auth handler");

        let creds = if self.config.enable_reauth_on_new_credentials {
            method.new_creds_notifier()
        } else {
            None
        };
        let mut backoff = Backoff::new(self.config.min_backoff, self.config.max_backoff);
        let mut preloaded = self.config.preloaded_token.take();

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let from_cache = preloaded.is_some();
            self.auth_in_progress.store(true, Ordering::SeqCst);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.auth_in_progress.store(false, Ordering::SeqCst);
                    break Ok(());
                }
                r = self.login(method.as_ref(), preloaded.take()) => r,
            };

            let login = match outcome {
                Ok(login) => login,
                Err(e) if from_cache => {
                    self.auth_in_progress.store(false, Ordering::SeqCst);
                    tracing::warn!(error = %e, "cached token is not usable, authenticating with the method");
                    continue;
                }
                Err(e) => {
                    self.auth_in_progress.store(false, Ordering::SeqCst);
                    if self.config.exit_on_error && e.kind() == ErrorKind::Permanent {
                        tracing::error!(error = %e, "authentication failed, exiting");
                        break Err(AgentError::AuthFailed(e.to_string()));
                    }
                    let wait = backoff.next_wait();
                    tracing::error!(error = %e, backoff = ?wait, "authentication failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(wait) => continue,
                    }
                }
            };

            backoff.reset();
            if !from_cache {
                method.credential_success();
            }

            match login {
                Login::Wrapped(wrap_info) => {
                    let payload = match serde_json::to_string(&wrap_info) {
                        Ok(p) => p,
                        Err(e) => {
                            self.auth_in_progress.store(false, Ordering::SeqCst);
                            tracing::error!(error = %e, "failed to encode wrapped token");
                            continue;
                        }
                    };
                    self.sink_tx.send_replace(Some(payload));
                    self.auth_in_progress.store(false, Ordering::SeqCst);
                    tracing::info!("authentication successful, sending wrapped token to sinks");

                    // the wrapped token is opaque to us: nothing to renew
                    match self.wait_for_event(&cancel, None, None, creds.as_ref()).await {
                        Wake::Cancelled => break Ok(()),
                        Wake::Reauth(reason) => tracing::info!(reason, "re-authenticating"),
                        Wake::Renew => {}
                    }
                }
                Login::Token(info) => {
                    self.publish(&info.token);
                    self.auth_in_progress.store(false, Ordering::SeqCst);
                    tracing::info!(
                        renewable = info.renewable,
                        lease = ?info.lease_duration,
                        cached = from_cache,
                        "authentication successful, sending token to sinks"
                    );
                    self.persist(&info).await;

                    if !self.watch_lifetime(&cancel, info, creds.as_ref()).await {
                        break Ok(());
                    }
                }
            }
        };

        method.shutdown().await;
        tracing::info!("auth handler stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_renewal_wait_window() {
        let info = TokenInfo::new("t".to_string(), Duration::from_secs(100), true);
        for _ in 0..50 {
            let wait = AuthHandler::renewal_wait(&info).unwrap();
            assert!(wait <= Duration::from_secs(70));
            assert!(wait >= Duration::from_secs(49));
        }
        assert!(AuthHandler::renewal_wait(&TokenInfo::static_token("t".to_string())).is_none());
    }

    #[tokio::test]
    async fn test_invalid_token_signal_coalesces() {
        let client = VaultClient::builder().base_url("http://vault:8200").build().unwrap();
        let mut handler = AuthHandler::new(AuthHandlerConfig::new(client));
        let signal = handler.invalid_token_signal();

        signal.signal("t1");
        signal.signal("t1");
        signal.signal("t1");

        assert_eq!(handler.invalid_rx.recv().await.as_deref(), Some("t1"));
        assert!(handler.invalid_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_signal_ignored() {
        let client = VaultClient::builder().base_url("http://vault:8200").build().unwrap();
        let mut handler = AuthHandler::new(AuthHandlerConfig::new(client));
        let signal = handler.invalid_token_signal();
        let cancel = CancellationToken::new();

        signal.signal("old");
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let wake = handler
            .wait_for_event(&cancel, Some("new"), None, None)
            .await;
        assert!(matches!(wake, Wake::Cancelled));
    }

    struct StaticLogin {
        creds: Option<Arc<Notify>>,
    }

    #[async_trait::async_trait]
    impl AuthMethod for StaticLogin {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn authenticate(&self, _client: &VaultClient) -> std::result::Result<AuthRequest, VaultError> {
            Ok(AuthRequest::login("auth/test/login", json!({ "role": "agent" })))
        }

        fn new_creds_notifier(&self) -> Option<Arc<Notify>> {
            self.creds.clone()
        }
    }

    fn auth_body(token: &str, lease: u64) -> serde_json::Value {
        json!({
            "auth": {
                "client_token": token,
                "accessor": format!("acc-{}", token),
                "lease_duration": lease,
                "renewable": lease > 0,
                "policies": ["default"],
            }
        })
    }

    async fn mount_login(server: &MockServer, token: &str, lease: u64, times: Option<u64>) {
        let mock = Mock::given(method("PUT"))
            .and(path("/v1/auth/test/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body(token, lease)));
        let mock = match times {
            Some(n) => mock.up_to_n_times(n),
            None => mock,
        };
        mock.mount(server).await;
    }

    fn handler_config(server: &MockServer) -> AuthHandlerConfig {
        let client = VaultClient::builder().base_url(server.uri()).build().unwrap();
        let mut config = AuthHandlerConfig::new(client);
        config.min_backoff = Duration::from_millis(50);
        config.max_backoff = Duration::from_millis(200);
        config
    }

    async fn wait_for_token(rx: &mut TokenReceiver, expected: &str) {
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|t| t.as_deref() == Some(expected)),
        )
        .await
        .unwrap_or_else(|_| panic!("token {} never published", expected))
        .unwrap();
    }

    fn start(
        handler: AuthHandler,
        method: StaticLogin,
    ) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run(cancel.clone(), Arc::new(method)));
        (cancel, task)
    }

    #[tokio::test]
    async fn test_renewal_keeps_token_and_reschedules() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/auth/test/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("T1", 2)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/auth/token/renew-self"))
            .and(header("X-Vault-Token", "T1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("T1", 1)))
            .expect(2..)
            .mount(&server)
            .await;

        let handler = AuthHandler::new(handler_config(&server));
        let mut sink = handler.sink_tokens();
        let (cancel, task) = start(handler, StaticLogin { creds: None });

        wait_for_token(&mut sink, "T1").await;
        // The first renewal lands after 1 to 1.4s and shortens the lease to 1s,
        // so later ones follow every 0.5 to 0.7s.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(sink.borrow().as_deref(), Some("T1"));

        cancel.cancel();
        task.await.unwrap().unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_renewal_denied_triggers_reauth() {
        let server = MockServer::start().await;
        mount_login(&server, "T1", 2, Some(1)).await;
        mount_login(&server, "T2", 0, None).await;
        Mock::given(method("PUT"))
            .and(path("/v1/auth/token/renew-self"))
            .and(header("X-Vault-Token", "T1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "errors": ["1 error occurred:\n\t* permission denied\n\n"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let handler = AuthHandler::new(handler_config(&server));
        let mut sink = handler.sink_tokens();
        let mut templates = handler.template_tokens();
        let (cancel, task) = start(handler, StaticLogin { creds: None });

        wait_for_token(&mut sink, "T1").await;
        wait_for_token(&mut sink, "T2").await;
        wait_for_token(&mut templates, "T2").await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_exit_on_error_stops_on_permanent_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/auth/test/login"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errors": ["invalid role ID"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = handler_config(&server);
        config.exit_on_error = true;
        let handler = AuthHandler::new(config);
        let in_progress = handler.auth_in_progress();
        let (_cancel, task) = start(handler, StaticLogin { creds: None });

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("handler kept retrying")
            .unwrap();
        assert!(matches!(result, Err(AgentError::AuthFailed(_))));
        assert!(!in_progress.load(Ordering::SeqCst));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_wrapped_login_only_reaches_sinks() {
        let server = MockServer::start().await;
        mount_login(&server, "T1", 0, None).await;
        Mock::given(method("PUT"))
            .and(path("/v1/sys/wrapping/wrap"))
            .and(header("X-Vault-Token", "T1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "wrap_info": {
                    "token": "hvs.wrapping",
                    "accessor": "wrap-acc",
                    "ttl": 30,
                    "creation_path": "sys/wrapping/wrap",
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = handler_config(&server);
        config.wrap_ttl = Some(Duration::from_secs(30));
        let handler = AuthHandler::new(config);
        let mut sink = handler.sink_tokens();
        let templates = handler.template_tokens();
        let exec = handler.exec_tokens();
        let (cancel, task) = start(handler, StaticLogin { creds: None });

        tokio::time::timeout(Duration::from_secs(5), sink.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();
        let payload = sink.borrow().clone().unwrap();
        let wrap_info: SecretWrapInfo = serde_json::from_str(&payload).unwrap();
        assert_eq!(wrap_info.token, "hvs.wrapping");
        assert_eq!(wrap_info.ttl, 30);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(templates.borrow().is_none());
        assert!(exec.borrow().is_none());

        cancel.cancel();
        task.await.unwrap().unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_new_credentials_trigger_reauth() {
        let server = MockServer::start().await;
        mount_login(&server, "T1", 0, Some(1)).await;
        mount_login(&server, "T2", 0, None).await;

        let mut config = handler_config(&server);
        config.enable_reauth_on_new_credentials = true;
        let handler = AuthHandler::new(config);
        let mut sink = handler.sink_tokens();
        let notify = Arc::new(Notify::new());
        let (cancel, task) = start(
            handler,
            StaticLogin {
                creds: Some(Arc::clone(&notify)),
            },
        );

        wait_for_token(&mut sink, "T1").await;
        notify.notify_one();
        wait_for_token(&mut sink, "T2").await;

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
