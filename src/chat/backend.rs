//! Chat endpoint client

use crate::conversation::HistoryEntry;
use crate::error::ChatError;
use anyhow::Context;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tracing::instrument;

/// Request body for the chat endpoint
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatRequest {
    pub(crate) message: String,
    pub(crate) history: Vec<HistoryEntry>,
}

/// Response body as it arrives, one read at a time
pub(crate) type ByteStream = BoxStream<'static, Result<Vec<u8>, ChatError>>;

/// A successful (2xx) response whose body has not been read yet
pub(crate) struct ChatReply {
    pub(crate) content_type: String,
    pub(crate) body: ByteStream,
}

/// The remote chat backend
#[async_trait::async_trait]
pub(crate) trait ChatBackend: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<ChatReply, ChatError>;
}

/// Chat endpoint reached over HTTP
pub(crate) struct HttpChatBackend {
    url: String,
    client: reqwest::Client,
}

impl HttpChatBackend {
    /// No overall timeout: streamed replies stay open until done or cancelled.
    pub(crate) fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client for HttpChatBackend")?;
        Ok(Self { url, client })
    }
}

#[async_trait::async_trait]
impl ChatBackend for HttpChatBackend {
    #[instrument(skip(self, request), fields(history_len = request.history.len()))]
    async fn send(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChatError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ChatError::from))
            .boxed();

        Ok(ChatReply { content_type, body })
    }
}
