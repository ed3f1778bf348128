//! Token sinks and the server that fans tokens out to them.

mod channel;
mod file;
mod http;
mod inmem;
pub mod server;

pub use channel::ChannelSink;
pub use file::FileSink;
pub use http::HttpSink;
pub use inmem::InmemSink;
pub use server::{ConfiguredSink, DhSettings, SinkServer};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::SinkConfig;
use crate::error::{AgentError, Result};

/// Destination for the agent's token
#[async_trait]
pub trait Sink: Send + Sync {
    fn sink_type(&self) -> &'static str;

    /// Deliver `token`; an empty token is never passed here.
    async fn write_token(&self, token: &str) -> Result<()>;
}

/// Build the sink described by a `sink` stanza.
///
/// `channel` sinks are only available programmatically since they need the
/// receiving half of a channel.
pub fn new_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    match config.sink_type.as_str() {
        "file" => Ok(Arc::new(FileSink::new(&config.config)?)),
        "inmem" => Ok(Arc::new(InmemSink::new())),
        "http" => Ok(Arc::new(HttpSink::new(&config.config)?)),
        "channel" => Err(AgentError::Config(
            "channel sinks cannot be configured from a file".to_string(),
        )),
        other => Err(AgentError::Config(format!("unknown sink type '{}'", other))),
    }
}

fn config_str<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
