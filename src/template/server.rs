use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::runner::{PassOutcome, RenderTarget, Renderer};
use crate::auth::{InvalidTokenSignal, TokenReceiver};
use crate::error::Result;

/// Delay between checks of the auth flag while a login is in flight
const AUTH_WAIT_POLL: Duration = Duration::from_millis(100);

/// Keeps file templates rendered with the latest token.
///
/// A rejected token suspends rendering until the auth handler publishes a
/// replacement; permission errors on individual secrets never do.
pub struct TemplateServer {
    renderer: Renderer,
    render_interval: Duration,
    exit_after_auth: bool,
    invalid_token: InvalidTokenSignal,
    auth_in_progress: Arc<AtomicBool>,
    done_tx: watch::Sender<bool>,
}

impl TemplateServer {
    pub fn new(
        renderer: Renderer,
        render_interval: Duration,
        invalid_token: InvalidTokenSignal,
        auth_in_progress: Arc<AtomicBool>,
    ) -> Self {
        let (done_tx, _) = watch::channel(renderer.is_empty());
        Self {
            renderer,
            render_interval,
            exit_after_auth: false,
            invalid_token,
            auth_in_progress,
            done_tx,
        }
    }

    pub fn with_exit_after_auth(mut self, exit: bool) -> Self {
        self.exit_after_auth = exit;
        self
    }

    /// Becomes `true` once every template has rendered at least once
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub async fn run(mut self, cancel: CancellationToken, mut tokens: TokenReceiver) -> Result<()> {
        tracing::info!(templates = self.renderer.len(), "starting template server");

        let mut suspended = false;
        let mut next_render: Option<Instant> = None;

        loop {
            let render_at = next_render.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = tokens.changed() => {
                    if changed.is_err() {
                        tracing::debug!("token stream closed");
                        break;
                    }
                    let Some(token) = tokens.borrow_and_update().clone() else {
                        continue;
                    };
                    if self.renderer.token() == Some(token.as_str()) && !suspended {
                        continue;
                    }
                    tracing::info!("new token, restarting renders");
                    self.renderer.set_token(&token);
                    suspended = false;
                    next_render = Some(Instant::now());
                }
                _ = tokio::time::sleep_until(render_at), if next_render.is_some() && !suspended => {
                    if self.auth_in_progress.load(Ordering::SeqCst) {
                        next_render = Some(Instant::now() + AUTH_WAIT_POLL);
                        continue;
                    }
                    match self.renderer.render_pass(&cancel).await? {
                        PassOutcome::Rendered { complete, .. } => {
                            if complete && !*self.done_tx.borrow() {
                                tracing::info!("all templates rendered");
                                self.done_tx.send_replace(true);
                                if self.exit_after_auth {
                                    break;
                                }
                            }
                            next_render = Some(Instant::now() + self.render_interval);
                        }
                        PassOutcome::TokenInvalid => {
                            if let Some(token) = self.renderer.token() {
                                self.invalid_token.signal(token);
                            }
                            tracing::warn!("token rejected, suspending renders until re-authentication");
                            suspended = true;
                            next_render = None;
                        }
                    }
                }
            }
        }

        tracing::info!("template server stopped");
        Ok(())
    }
}

/// Build render targets for every `template` stanza
pub fn file_targets(configs: &[crate::config::TemplateConfig]) -> Result<Vec<RenderTarget>> {
    configs.iter().map(RenderTarget::file).collect()
}
