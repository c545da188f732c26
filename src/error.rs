use thiserror::Error;

use crate::audio::AudioCaptureError;

/// Settings resolution errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid API base URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Chat-level errors, surfaced through the transport coordinator's last error
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Cannot send while a reply is streaming or the microphone is on")]
    Busy,
}

/// Speech endpoint failures
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("STT request failed ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid transcription response: {0}")]
    InvalidResponse(String),
}

/// Recorder-level errors, surfaced through the voice coordinator's recorder error
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Capture device error: {0}")]
    Capture(#[from] AudioCaptureError),

    #[error("Transcription failed: {0}")]
    Upload(#[from] UploadError),

    #[error("Cannot start recording while a reply is streaming")]
    ChatActive,

    #[error("Recording is already running")]
    AlreadyRecording,
}

/// Reply audio hand-off errors
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Invalid base64 audio payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Failed to write audio file: {0}")]
    Io(#[from] std::io::Error),

    #[error("No cache directory available")]
    NoCacheDir,
}
