//! Playback of audio embedded in chat replies
//!
//! Replies may carry base64 audio with a mime type. The audio is written to
//! the user cache directory and handed to the system's default player.

use crate::error::PlaybackError;
use base64::Engine;
use chrono::Local;
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Something that can play a reply's audio
pub(crate) trait AudioPlayer: Send + Sync {
    fn play(&self, audio_base64: &str, mime_type: &str) -> Result<(), PlaybackError>;
}

/// Plays through whatever application the OS associates with the file type
pub(crate) struct SystemPlayer {
    dir: PathBuf,
}

impl SystemPlayer {
    pub(crate) fn new() -> Result<Self, PlaybackError> {
        let dir = dirs::cache_dir()
            .ok_or(PlaybackError::NoCacheDir)?
            .join("voicechat")
            .join("replies");
        Ok(Self { dir })
    }

    fn write_reply(&self, bytes: &[u8], mime_type: &str) -> Result<PathBuf, PlaybackError> {
        fs::create_dir_all(&self.dir)?;
        let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S-%3f");
        let path = self
            .dir
            .join(format!("reply-{}.{}", timestamp, extension_for(mime_type)));
        fs::write(&path, bytes)?;
        Ok(path)
    }
}

impl AudioPlayer for SystemPlayer {
    fn play(&self, audio_base64: &str, mime_type: &str) -> Result<(), PlaybackError> {
        let bytes = decode_audio(audio_base64)?;
        let path = self.write_reply(&bytes, mime_type)?;
        info!(path = ?path, bytes = bytes.len(), "Playing reply audio");
        open::that(&path)?;
        Ok(())
    }
}

pub(crate) fn decode_audio(audio_base64: &str) -> Result<Vec<u8>, PlaybackError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(audio_base64.trim())?)
}

/// File extension for an audio mime type, parameters ignored
pub(crate) fn extension_for(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    match essence.to_ascii_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/webm" => "webm",
        "audio/aac" => "aac",
        "audio/flac" => "flac",
        _ => "bin",
    }
}
