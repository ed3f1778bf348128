use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::{AgentError, Result};

/// Parse `SIGTERM`, `TERM` or `sigterm`
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| AgentError::Config(format!("unknown signal '{}'", name)))
}

/// Exit status as a shell would report it: the code, or 128 + signal
pub fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

/// A running child process
pub struct ChildProcess {
    child: Child,
    pid: Option<Pid>,
}

impl ChildProcess {
    pub fn spawn(command: &[String], env: &[(String, String)]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AgentError::Config("exec.command is empty".to_string()))?;
        let child = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Exec(format!("starting '{}': {}", program, e)))?;
        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        tracing::info!(command = %program, pid = ?pid, "child process started");
        Ok(Self { child, pid })
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Send `signal`, then SIGKILL if the child outlives `timeout`
    pub async fn stop(mut self, signal: Signal, timeout: Duration) -> Result<()> {
        if let Some(pid) = self.pid {
            if let Err(e) = kill(pid, signal) {
                tracing::warn!(pid = %pid, error = %e, "failed to signal child process");
            }
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::info!(code = exit_code(&status), "child process stopped");
            }
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "child process ignored stop signal, killing");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}
