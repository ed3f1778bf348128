use async_trait::async_trait;
use tokio::sync::watch;

use super::Sink;
use crate::error::Result;

/// Keeps the latest token in process memory.
///
/// Persisting the token across restarts is the auth handler's job; this sink
/// never touches the cache.
pub struct InmemSink {
    token: watch::Sender<Option<String>>,
}

impl InmemSink {
    pub fn new() -> Self {
        let (token, _) = watch::channel(None);
        Self { token }
    }

    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token.subscribe()
    }
}

impl Default for InmemSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for InmemSink {
    fn sink_type(&self) -> &'static str {
        "inmem"
    }

    async fn write_token(&self, token: &str) -> Result<()> {
        self.token.send_replace(Some(token.to_string()));
        Ok(())
    }
}
