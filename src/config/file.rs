//! TOML configuration file loading
//!
//! Supports `~/.config/companion-relay/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CompanionConfigFile {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// API keys for upstream services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Realtime dialogue engine configuration
    #[serde(default)]
    pub realtime: RealtimeFileConfig,

    /// Speech synthesis configuration
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Conversation shaping
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Per-device configuration defaults
    #[serde(default)]
    pub devices: DevicesFileConfig,
}

/// Listener configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub fish: Option<String>,
}

/// Realtime dialogue engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeFileConfig {
    /// WebSocket base URL
    pub url: Option<String>,
    /// Dialogue model
    pub model: Option<String>,
    /// Input transcription model (e.g. "whisper-1")
    pub transcription_model: Option<String>,
    /// Recognition language hint (e.g. "ja")
    pub language: Option<String>,
    /// VAD activation threshold
    pub vad_threshold: Option<f32>,
    /// VAD pre-roll in milliseconds
    pub prefix_padding_ms: Option<u32>,
    /// Trailing silence that ends a turn, in milliseconds
    pub silence_duration_ms: Option<u32>,
    /// Wait before the single reconnect attempt, in milliseconds
    pub reconnect_delay_ms: Option<u64>,
    /// A reconnected link closing again within this many seconds is fatal
    pub stable_after_secs: Option<u64>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// TTS endpoint URL
    pub url: Option<String>,
    /// Latency hint ("normal" or "balanced")
    pub latency: Option<String>,
    /// Output sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Fetch policy ("sequential" or "pipelined")
    pub policy: Option<String>,
    /// Retries after a rate limit
    pub max_retries: Option<u32>,
    /// First backoff delay in milliseconds
    pub base_backoff_ms: Option<u64>,
    /// Backoff cap in milliseconds
    pub max_backoff_ms: Option<u64>,
    /// Largest audio frame sent to a device
    pub frame_bytes: Option<usize>,
    /// Frames between pacing pauses
    pub frames_per_yield: Option<usize>,
    /// Pacing pause in milliseconds
    pub yield_ms: Option<u64>,
}

/// Conversation shaping
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    /// Conversation items kept upstream
    pub max_items: Option<usize>,
    /// Marks that close a sentence segment
    pub sentence_terminals: Option<Vec<String>>,
    /// Filler phrases spoken when the user stops talking
    pub aizuchi: Option<Vec<String>>,
}

/// Per-device configuration defaults
#[derive(Debug, Default, Deserialize)]
pub struct DevicesFileConfig {
    /// Voice used when a device has none
    pub default_voice_id: Option<String>,
    /// Prompt used when a device has none
    pub default_system_prompt: Option<String>,
    /// Device lookup cache lifetime in seconds
    pub cache_ttl_secs: Option<u64>,
    /// TOML file mapping device ids to their configuration
    pub file: Option<String>,
}

/// Load the TOML config file
///
/// Uses `path` when given, otherwise the standard location. Returns
/// `CompanionConfigFile::default()` if the file doesn't exist or can't be
/// parsed.
pub fn load_config_file(path: Option<&Path>) -> CompanionConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return CompanionConfigFile::default();
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file");
        return CompanionConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CompanionConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CompanionConfigFile::default()
        }
    }
}

/// Parse config file content
///
/// # Errors
///
/// Returns error if the TOML is invalid
pub fn parse_config_file(content: &str) -> crate::Result<CompanionConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/companion-relay/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("companion-relay").join("config.toml"))
}
