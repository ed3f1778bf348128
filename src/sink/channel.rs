use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Sink;
use crate::error::{AgentError, Result};

/// Hands tokens to an in-process consumer
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end, with room for `capacity` undelivered tokens
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn sink_type(&self) -> &'static str {
        "channel"
    }

    async fn write_token(&self, token: &str) -> Result<()> {
        self.tx
            .send(token.to_string())
            .await
            .map_err(|_| AgentError::Sink("channel receiver dropped".to_string()))
    }
}
