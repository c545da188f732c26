//! Settings resolution
//!
//! Settings are read once per process: `.env` first, then an optional
//! `config.toml` in the user's config directory, then `VOICECHAT_*`
//! environment overrides. The resolved API base URL is normalized so
//! endpoint paths can be appended with a single slash.

use crate::error::ConfigError;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Fallback API base used when nothing is configured
pub(crate) const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";

/// Default cadence of periodic audio flushes
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 750;

/// Default poll interval while a finalize waits for an in-flight upload
const DEFAULT_FINALIZE_POLL_MS: u64 = 25;

/// Default delay before a server-requested history clear fires
const DEFAULT_HISTORY_CLEAR_SECS: u64 = 10;

/// Sample rate reported when the capture device does not expose one
pub(crate) const FALLBACK_SAMPLE_RATE: u32 = 48000;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

/// On-disk representation, every field optional
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    flush_interval_ms: Option<u64>,
    finalize_poll_ms: Option<u64>,
    history_clear_secs: Option<u64>,
    log_events: Option<bool>,
}

/// Resolved application settings
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) api: ApiUrls,
    pub(crate) flush_interval: Duration,
    pub(crate) finalize_poll: Duration,
    pub(crate) history_clear_delay: Duration,
    /// Log every decoded frame and upload result at info level
    pub(crate) log_events: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api: ApiUrls {
                base: DEFAULT_API_BASE_URL.to_string(),
            },
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            finalize_poll: Duration::from_millis(DEFAULT_FINALIZE_POLL_MS),
            history_clear_delay: Duration::from_secs(DEFAULT_HISTORY_CLEAR_SECS),
            log_events: false,
        }
    }
}

/// Normalized API base plus endpoint builders
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ApiUrls {
    base: String,
}

impl ApiUrls {
    /// Validate and normalize a base URL (whitespace and trailing slashes stripped)
    pub(crate) fn new(raw: &str) -> Result<Self, ConfigError> {
        let base = sanitize_url(raw);
        url::Url::parse(&base).map_err(|e| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { base })
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    /// Full HTTP URL for an API path
    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base, normalize_path(path))
    }

    /// Streaming-socket URL for an API path (`http` -> `ws`, `https` -> `wss`)
    pub(crate) fn ws_url(&self, path: &str) -> String {
        let http_url = self.api_url(path);
        if let Some(rest) = http_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = http_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            http_url
        }
    }

    pub(crate) fn chat_url(&self) -> String {
        self.api_url("/chat")
    }

    pub(crate) fn speech_url(&self) -> String {
        self.api_url("/speech/stream")
    }
}

fn sanitize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Settings resolved on first use and shared for the rest of the process
pub(crate) fn settings() -> Result<&'static Settings, ConfigError> {
    SETTINGS.get_or_try_init(load_settings)
}

fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("voicechat").join("config.toml"))
}

fn load_settings() -> Result<Settings, ConfigError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!("Failed to load .env file: {}", e);
        }
    }

    let file = match config_file_path() {
        Some(path) if path.exists() => {
            info!("Loading settings from {:?}", path);
            toml::from_str(&fs::read_to_string(&path)?)?
        }
        _ => FileSettings::default(),
    };

    let settings = resolve(file, |key| std::env::var(key).ok())?;
    info!(
        api_base = %settings.api.base(),
        flush_interval_ms = settings.flush_interval.as_millis() as u64,
        "Settings resolved"
    );
    Ok(settings)
}

/// Merge file settings with environment overrides (`env` looks a key up)
fn resolve(
    file: FileSettings,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings, ConfigError> {
    let defaults = Settings::default();

    let base = env("VOICECHAT_API_BASE_URL")
        .filter(|v| !v.trim().is_empty())
        .or(file.api_base_url)
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

    let flush_ms = match env("VOICECHAT_FLUSH_INTERVAL_MS") {
        Some(v) => parse_u64("VOICECHAT_FLUSH_INTERVAL_MS", &v)?,
        None => file.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
    };
    let clear_secs = match env("VOICECHAT_HISTORY_CLEAR_SECS") {
        Some(v) => parse_u64("VOICECHAT_HISTORY_CLEAR_SECS", &v)?,
        None => file.history_clear_secs.unwrap_or(DEFAULT_HISTORY_CLEAR_SECS),
    };
    let log_events = match env("VOICECHAT_LOG_EVENTS") {
        Some(v) => matches!(v.trim(), "1" | "true" | "yes"),
        None => file.log_events.unwrap_or(defaults.log_events),
    };

    if flush_ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: "flush_interval_ms",
            value: "0".to_string(),
        });
    }

    Ok(Settings {
        api: ApiUrls::new(&base)?,
        flush_interval: Duration::from_millis(flush_ms),
        finalize_poll: file
            .finalize_poll_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.finalize_poll),
        history_clear_delay: Duration::from_secs(clear_secs),
        log_events,
    })
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}
