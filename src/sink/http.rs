use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{Map, Value};

use super::{config_str, Sink};
use crate::error::{AgentError, Result};

const HTTP_SINK_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs the token to an HTTP endpoint.
///
/// The token is the request body; with `header_name` it is also sent in that
/// header so receivers can ignore the body.
pub struct HttpSink {
    client: reqwest::Client,
    address: String,
    header_name: Option<HeaderName>,
}

impl HttpSink {
    pub fn new(config: &Map<String, Value>) -> Result<Self> {
        let address = config_str(config, "address")
            .ok_or_else(|| AgentError::Config("http sink requires 'address'".to_string()))?
            .to_string();
        let header_name = config_str(config, "header_name")
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes())
                    .map_err(|e| AgentError::Config(format!("invalid http sink header_name: {}", e)))
            })
            .transpose()?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_SINK_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Config(format!("http sink client: {}", e)))?;

        Ok(Self {
            client,
            address,
            header_name,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn sink_type(&self) -> &'static str {
        "http"
    }

    async fn write_token(&self, token: &str) -> Result<()> {
        let mut request = self.client.post(&self.address).body(token.to_string());
        if let Some(ref name) = self.header_name {
            let value = HeaderValue::from_str(token)
                .map_err(|e| AgentError::Sink(format!("token is not a valid header value: {}", e)))?;
            request = request.header(name.clone(), value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Sink(format!("POST {}: {}", self.address, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Sink(format!(
                "POST {} returned {}",
                self.address, status
            )));
        }
        tracing::info!(address = %self.address, "token delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(address: String, header_name: Option<&str>) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("address".to_string(), Value::from(address));
        if let Some(h) = header_name {
            config.insert("header_name".to_string(), Value::from(h));
        }
        config
    }

    #[tokio::test]
    async fn test_posts_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string("s.http"))
            .and(header("x-agent-token", "s.http"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(&config(format!("{}/token", server.uri()), Some("X-Agent-Token"))).unwrap();
        sink.write_token("s.http").await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = HttpSink::new(&config(server.uri(), None)).unwrap();
        assert!(matches!(sink.write_token("t").await, Err(AgentError::Sink(_))));
    }

    #[test]
    fn test_requires_address() {
        assert!(HttpSink::new(&Map::new()).is_err());
    }
}
