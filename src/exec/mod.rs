//! Runs a child process with secrets rendered into its environment.

mod child;

pub use child::{exit_code, parse_signal, ChildProcess};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{InvalidTokenSignal, TokenReceiver};
use crate::config::{ExecConfig, RestartPolicy};
use crate::error::{AgentError, Result};
use crate::template::{PassOutcome, Renderer};

const AUTH_WAIT_POLL: Duration = Duration::from_millis(100);

enum Event {
    Cancelled,
    TokensClosed,
    Token(Option<String>),
    Render,
    ChildExited(std::io::Result<std::process::ExitStatus>),
}

/// Renders `env_template`s and keeps `exec.command` running with them.
///
/// The child starts once every variable has rendered and is restarted on
/// changes per the restart policy. Its exit ends the agent with its code.
pub struct ExecServer {
    renderer: Renderer,
    command: Vec<String>,
    policy: RestartPolicy,
    stop_signal: Signal,
    kill_timeout: Duration,
    render_interval: Duration,
    invalid_token: InvalidTokenSignal,
    auth_in_progress: Arc<AtomicBool>,
}

impl ExecServer {
    pub fn new(
        config: &ExecConfig,
        renderer: Renderer,
        render_interval: Duration,
        invalid_token: InvalidTokenSignal,
        auth_in_progress: Arc<AtomicBool>,
    ) -> Result<Self> {
        let stop_signal = match config.stop_signal() {
            Some(name) => parse_signal(name)?,
            None => Signal::SIGTERM,
        };
        Ok(Self {
            renderer,
            command: config.command.clone(),
            policy: config.restart_policy()?,
            stop_signal,
            kill_timeout: config.kill_timeout(),
            render_interval,
            invalid_token,
            auth_in_progress,
        })
    }

    pub async fn run(mut self, cancel: CancellationToken, mut tokens: TokenReceiver) -> Result<()> {
        tracing::info!(command = ?self.command, "starting exec server");

        let mut child: Option<ChildProcess> = None;
        let mut suspended = false;
        let mut next_render: Option<Instant> = None;

        let result = loop {
            let render_at = next_render.unwrap_or_else(Instant::now);
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                status = async {
                    match child.as_mut() {
                        Some(c) => c.wait().await,
                        None => std::future::pending().await,
                    }
                } => Event::ChildExited(status),
                changed = tokens.changed() => match changed {
                    Ok(()) => Event::Token(tokens.borrow_and_update().clone()),
                    Err(_) => Event::TokensClosed,
                },
                _ = tokio::time::sleep_until(render_at), if next_render.is_some() && !suspended => Event::Render,
            };

            match event {
                Event::Cancelled => break Ok(()),
                Event::TokensClosed => {
                    tracing::debug!("token stream closed");
                    break Ok(());
                }
                Event::ChildExited(status) => {
                    child = None;
                    let code = exit_code(&status?);
                    tracing::info!(code, "child process exited");
                    break Err(AgentError::ProcessExit { code });
                }
                Event::Token(None) => {}
                Event::Token(Some(token)) => {
                    if self.renderer.token() == Some(token.as_str()) && !suspended {
                        continue;
                    }
                    self.renderer.set_token(&token);
                    suspended = false;
                    next_render = Some(Instant::now());
                }
                Event::Render => {
                    if self.auth_in_progress.load(Ordering::SeqCst) {
                        next_render = Some(Instant::now() + AUTH_WAIT_POLL);
                        continue;
                    }
                    match self.renderer.render_pass(&cancel).await {
                        Err(e) => break Err(e),
                        Ok(PassOutcome::TokenInvalid) => {
                            if let Some(token) = self.renderer.token() {
                                self.invalid_token.signal(token);
                            }
                            tracing::warn!("token rejected, suspending renders until re-authentication");
                            suspended = true;
                            next_render = None;
                        }
                        Ok(PassOutcome::Rendered { complete, changed }) => {
                            next_render = Some(Instant::now() + self.render_interval);
                            if !complete {
                                continue;
                            }
                            let restart = match child {
                                None => true,
                                Some(_) => changed && self.policy == RestartPolicy::Always,
                            };
                            if !restart {
                                continue;
                            }
                            if let Some(running) = child.take() {
                                tracing::info!("secrets changed, restarting child process");
                                running.stop(self.stop_signal, self.kill_timeout).await?;
                            }
                            match ChildProcess::spawn(&self.command, &self.renderer.env_values()) {
                                Ok(c) => child = Some(c),
                                Err(e) => break Err(e),
                            }
                        }
                    }
                }
            }
        };

        if let Some(running) = child.take() {
            if let Err(e) = running.stop(self.stop_signal, self.kill_timeout).await {
                tracing::warn!(error = %e, "failed to stop child process");
            }
        }
        tracing::info!("exec server stopped");
        result
    }
}
