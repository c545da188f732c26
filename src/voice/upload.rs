//! Incremental speech upload client
//!
//! Each upload posts raw little-endian 16-bit mono PCM to the speech
//! endpoint. Session id, sample rate and the finalize flag travel as
//! headers. The response carries the cumulative transcript for everything
//! uploaded in the session so far.

use crate::error::UploadError;
use crate::session::VoiceSession;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

const SESSION_HEADER: &str = "X-Session-Id";
const SAMPLE_RATE_HEADER: &str = "X-Sample-Rate";
const FINALIZE_HEADER: &str = "X-Finalize";

/// One flush worth of audio
#[derive(Debug, Clone)]
pub(crate) struct UploadRequest {
    pub(crate) session: VoiceSession,
    pub(crate) sample_rate: u32,
    pub(crate) finalize: bool,
    /// Little-endian PCM; empty only for a terminal finalize
    pub(crate) pcm: Vec<u8>,
}

/// Transcript returned by the speech endpoint
///
/// Only the cumulative text is read. Other fields the server adds are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct TranscriptUpdate {
    #[serde(default)]
    pub(crate) text: String,
}

/// The remote speech-to-text endpoint
#[async_trait::async_trait]
pub(crate) trait SpeechBackend: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> Result<TranscriptUpdate, UploadError>;
}

/// Speech endpoint reached over HTTP
pub(crate) struct HttpSpeechBackend {
    url: String,
    client: reqwest::Client,
}

impl HttpSpeechBackend {
    pub(crate) fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client for HttpSpeechBackend")?;
        Ok(Self { url, client })
    }
}

#[async_trait::async_trait]
impl SpeechBackend for HttpSpeechBackend {
    #[instrument(skip(self, request), fields(session = %request.session, bytes = request.pcm.len(), finalize = request.finalize))]
    async fn upload(&self, request: UploadRequest) -> Result<TranscriptUpdate, UploadError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .header(SESSION_HEADER, request.session.to_string())
            .header(SAMPLE_RATE_HEADER, request.sample_rate.to_string())
            .header(FINALIZE_HEADER, if request.finalize { "true" } else { "false" })
            .body(request.pcm)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UploadError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let update = parse_update(&body)?;
        debug!(text_len = update.text.len(), "Transcript update received");
        Ok(update)
    }
}

fn parse_update(body: &str) -> Result<TranscriptUpdate, UploadError> {
    serde_json::from_str(body).map_err(|e| {
        UploadError::InvalidResponse(format!("Failed to parse speech response: {}", e))
    })
}
