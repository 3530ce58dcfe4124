//! Completion backend port and its reqwest implementation.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{info, warn};

use crate::decoder::ByteStream;
use crate::error::ChatError;
use crate::providers::{error_detail, ChatRequest, EndpointTarget};

/// Opens one streaming chat-completions request.
///
/// Implementations return the response body as a byte stream once the
/// endpoint has answered with a success status; any other status is a
/// [`ChatError::Transport`] carrying the provider's error text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn open_stream(&self, target: &EndpointTarget, request: &ChatRequest) -> Result<ByteStream, ChatError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        HttpBackend { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        HttpBackend { client }
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn open_stream(&self, target: &EndpointTarget, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        info!(
            target: "streamchat::client",
            url = %target.url,
            model = %request.model,
            messages = request.messages.len(),
            "sending completion request"
        );

        let mut builder = self
            .client
            .post(&target.url)
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(credential) = &target.credential {
            builder = builder.header("Authorization", format!("Bearer {credential}"));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "streamchat::client", url = %target.url, status = status.as_u16(), body = %body, "completion request failed");
            return Err(ChatError::Transport {
                status: Some(status.as_u16()),
                message: error_detail(status.as_u16(), &body),
            });
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(ChatError::from))))
    }
}
