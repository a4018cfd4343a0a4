use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tmxed_core::EngineCommand;
use tmxed_core::EngineConfig;
use tmxed_core::StatusSnapshot;

use crate::contracts::decode_response;
use crate::contracts::encode_request;
use crate::error::ChannelError;

/// One JSON request in, one JSON response out. Implementations hold no
/// protocol state; ordering and single-flight live in the controller.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, command: &EngineCommand) -> Result<StatusSnapshot, ChannelError>;
}

/// Loopback HTTP transport: every command is a POST of a JSON object to the
/// engine endpoint.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpChannel {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let endpoint = endpoint.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ChannelError::Connect {
                endpoint: endpoint.clone(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ChannelError> {
        Self::new(config.endpoint(), config.request_timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify(&self, err: reqwest::Error) -> ChannelError {
        if err.is_timeout() {
            ChannelError::Timeout(self.timeout)
        } else if err.is_decode() {
            ChannelError::Decode(err.to_string())
        } else {
            ChannelError::Connect {
                endpoint: self.endpoint.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Channel for HttpChannel {
    async fn send(&self, command: &EngineCommand) -> Result<StatusSnapshot, ChannelError> {
        let body = encode_request(command)?;
        tracing::debug!(command = %command.name, "engine request");

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        let text = response.text().await.map_err(|err| self.classify(err))?;
        if !status.is_success() {
            tracing::warn!(command = %command.name, %status, "engine returned HTTP error");
            return Err(ChannelError::Http {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let snapshot = decode_response(&text)?;
        tracing::debug!(command = %command.name, status = %snapshot.status, "engine response");
        Ok(snapshot)
    }
}
