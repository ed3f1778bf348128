use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::unistd::Gid;
use serde_json::{Map, Value};

use super::{config_str, Sink};
use crate::config::DEFAULT_SINK_MODE;
use crate::error::{AgentError, Result};
use crate::fsutil;

/// Writes the token to a local file, replacing it atomically
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    mode: u32,
    group: Option<Gid>,
}

fn parse_mode(value: &Value) -> Result<u32> {
    let digits = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().trim_start_matches("0o").to_string(),
        _ => String::new(),
    };
    u32::from_str_radix(&digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| AgentError::Config(format!("invalid file sink mode '{}'", value)))
}

impl FileSink {
    /// Build from a sink `config` map; checks that the target directory is
    /// writable with the requested owner and mode.
    pub fn new(config: &Map<String, Value>) -> Result<Self> {
        let path = config_str(config, "path")
            .map(PathBuf::from)
            .ok_or_else(|| AgentError::Config("file sink requires 'path'".to_string()))?;
        let mode = match config.get("mode") {
            Some(v) => parse_mode(v)?,
            None => DEFAULT_SINK_MODE,
        };
        let group = config_str(config, "group")
            .map(fsutil::resolve_group)
            .transpose()
            .map_err(|e| AgentError::Config(format!("file sink group: {}", e)))?;

        let sink = Self { path, mode, group };
        fsutil::check_writable(&sink.path, sink.mode, sink.group).map_err(|e| {
            AgentError::Sink(format!("cannot write to {}: {}", sink.path.display(), e))
        })?;
        tracing::debug!(path = %sink.path.display(), mode = format!("{:o}", sink.mode), "file sink configured");
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for FileSink {
    fn sink_type(&self) -> &'static str {
        "file"
    }

    async fn write_token(&self, token: &str) -> Result<()> {
        let path = self.path.clone();
        let (mode, group) = (self.mode, self.group);
        let contents = token.as_bytes().to_vec();

        tokio::task::spawn_blocking(move || fsutil::atomic_write(&path, &contents, mode, group))
            .await
            .map_err(|e| AgentError::Sink(format!("file sink task failed: {}", e)))?
            .map_err(|e| AgentError::Sink(format!("writing {}: {}", self.path.display(), e)))?;

        tracing::info!(path = %self.path.display(), "token written");
        Ok(())
    }
}
