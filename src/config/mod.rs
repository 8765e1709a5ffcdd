//! Configuration management for the companion relay
//!
//! Every value resolves as environment variable > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::device::{DEFAULT_CACHE_TTL, DEFAULT_VOICE_ID, DeviceConfig};
use crate::dialogue::{
    DEFAULT_MAX_ITEMS, DEFAULT_STABLE_AFTER, RealtimeEndpoint, SessionProfile, VadSettings,
};
use crate::voice::{
    DEFAULT_TERMINALS, FetchPolicy, FishAudioConfig, QueueSettings, RetryPolicy,
    SentenceSegmenter,
};
use crate::{Error, Result};
use file::CompanionConfigFile;

/// Prompt used when neither the device nor the config supplies one
pub const DEFAULT_SYSTEM_PROMPT: &str = "あなたは音声だけで会話する小さなコンパニオンロボットです。\
短く、やさしい日本語で、子どもに話しかけるように答えてください。\
絵文字や記号、箇条書きは使わないでください。";

/// Companion relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Realtime dialogue engine configuration
    pub realtime: RealtimeConfig,

    /// Speech synthesis configuration
    pub synthesis: SynthesisConfig,

    /// Conversation shaping
    pub conversation: ConversationConfig,

    /// Per-device configuration
    pub devices: DevicesConfig,
}

/// HTTP/WebSocket listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

/// API keys for upstream services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (realtime dialogue)
    pub openai: Option<SecretString>,

    /// Fish Audio API key (speech synthesis)
    pub fish: Option<SecretString>,
}

/// Realtime dialogue engine configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Engine endpoint
    pub endpoint: RealtimeEndpoint,

    /// Input transcription model
    pub transcription_model: String,

    /// Recognition language hint
    pub language: String,

    /// Turn detection tuning
    pub vad: VadSettings,

    /// Wait before the single reconnect attempt
    pub reconnect_delay: Duration,

    /// Uptime a reconnected link needs before another reconnect is allowed
    pub stable_after: Duration,
}

impl RealtimeConfig {
    /// Engine session settings for a device's system prompt
    #[must_use]
    pub fn profile(&self, instructions: &str) -> SessionProfile {
        SessionProfile {
            instructions: instructions.to_string(),
            transcription_model: self.transcription_model.clone(),
            language: self.language.clone(),
            vad: self.vad.clone(),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone, Default)]
pub struct SynthesisConfig {
    /// Provider settings
    pub fish: FishAudioConfig,

    /// Queue scheduling, retry and pacing
    pub queue: QueueSettings,
}

/// Conversation shaping
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Conversation items kept upstream
    pub max_items: usize,

    /// Marks that close a sentence segment
    pub sentence_terminals: Vec<String>,

    /// Filler phrases spoken when the user stops talking. Empty disables
    pub aizuchi: Vec<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            sentence_terminals: DEFAULT_TERMINALS.iter().map(|t| (*t).to_string()).collect(),
            aizuchi: Vec::new(),
        }
    }
}

/// Per-device configuration
#[derive(Debug, Clone)]
pub struct DevicesConfig {
    /// Fallback voice and prompt
    pub defaults: DeviceConfig,

    /// Device lookup cache lifetime
    pub cache_ttl: Duration,

    /// Optional devices file
    pub file: Option<PathBuf>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            defaults: DeviceConfig {
                voice_id: DEFAULT_VOICE_ID.to_string(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            },
            cache_ttl: DEFAULT_CACHE_TTL,
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_sources(CompanionConfigFile::default(), |_| None)
            .unwrap_or_else(|_| unreachable!("defaults are valid"))
    }
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// `config_path` overrides the config file location; otherwise
    /// `COMPANION_CONFIG` or the standard location is used.
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("COMPANION_CONFIG").ok().map(PathBuf::from);
        let fc = file::load_config_file(config_path.or(env_path.as_deref()));
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge an environment lookup over a parsed config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn from_sources<F>(fc: CompanionConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = ServerConfig {
            host: env("COMPANION_HOST")
                .or(fc.server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env(&env, "COMPANION_PORT")?
                .or(parse_env(&env, "PORT")?)
                .or(fc.server.port)
                .unwrap_or(8000),
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .map(SecretString::from),
            fish: env("FISH_API_KEY")
                .or(fc.api_keys.fish)
                .map(SecretString::from),
        };

        let endpoint_defaults = RealtimeEndpoint::default();
        let vad_defaults = VadSettings::default();
        let realtime = RealtimeConfig {
            endpoint: RealtimeEndpoint {
                url: env("COMPANION_REALTIME_URL")
                    .or(fc.realtime.url)
                    .unwrap_or(endpoint_defaults.url),
                model: env("COMPANION_REALTIME_MODEL")
                    .or(fc.realtime.model)
                    .unwrap_or(endpoint_defaults.model),
            },
            transcription_model: env("COMPANION_TRANSCRIPTION_MODEL")
                .or(fc.realtime.transcription_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            language: env("COMPANION_LANGUAGE")
                .or(fc.realtime.language)
                .unwrap_or_else(|| "ja".to_string()),
            vad: VadSettings {
                threshold: parse_env(&env, "COMPANION_VAD_THRESHOLD")?
                    .or(fc.realtime.vad_threshold)
                    .unwrap_or(vad_defaults.threshold),
                prefix_padding_ms: parse_env(&env, "COMPANION_VAD_PREFIX_MS")?
                    .or(fc.realtime.prefix_padding_ms)
                    .unwrap_or(vad_defaults.prefix_padding_ms),
                silence_duration_ms: parse_env(&env, "COMPANION_VAD_SILENCE_MS")?
                    .or(fc.realtime.silence_duration_ms)
                    .unwrap_or(vad_defaults.silence_duration_ms),
            },
            reconnect_delay: Duration::from_millis(
                parse_env(&env, "COMPANION_RECONNECT_DELAY_MS")?
                    .or(fc.realtime.reconnect_delay_ms)
                    .unwrap_or(500),
            ),
            stable_after: parse_env(&env, "COMPANION_RECONNECT_STABLE_SECS")?
                .or(fc.realtime.stable_after_secs)
                .map_or(DEFAULT_STABLE_AFTER, Duration::from_secs),
        };

        let fish_defaults = FishAudioConfig::default();
        let queue_defaults = QueueSettings::default();
        let retry_defaults = RetryPolicy::default();
        let policy = match env("COMPANION_SYNTHESIS_POLICY").or(fc.synthesis.policy) {
            Some(name) => FetchPolicy::from_str(&name)?,
            None => queue_defaults.policy,
        };
        let synthesis = SynthesisConfig {
            fish: FishAudioConfig {
                url: env("FISH_TTS_URL")
                    .or(fc.synthesis.url)
                    .unwrap_or(fish_defaults.url),
                latency: env("FISH_LATENCY")
                    .or(fc.synthesis.latency)
                    .unwrap_or(fish_defaults.latency),
                sample_rate: parse_env(&env, "FISH_SAMPLE_RATE")?
                    .or(fc.synthesis.sample_rate)
                    .unwrap_or(fish_defaults.sample_rate),
            },
            queue: QueueSettings {
                policy,
                retry: RetryPolicy {
                    max_retries: fc.synthesis.max_retries.unwrap_or(retry_defaults.max_retries),
                    base_delay: fc
                        .synthesis
                        .base_backoff_ms
                        .map_or(retry_defaults.base_delay, Duration::from_millis),
                    max_delay: fc
                        .synthesis
                        .max_backoff_ms
                        .map_or(retry_defaults.max_delay, Duration::from_millis),
                },
                frame_bytes: fc.synthesis.frame_bytes.unwrap_or(queue_defaults.frame_bytes),
                frames_per_yield: fc
                    .synthesis
                    .frames_per_yield
                    .unwrap_or(queue_defaults.frames_per_yield),
                yield_interval: fc
                    .synthesis
                    .yield_ms
                    .map_or(queue_defaults.yield_interval, Duration::from_millis),
            },
        };

        if synthesis.queue.frame_bytes == 0 || synthesis.queue.frame_bytes > 512 {
            return Err(Error::Config(format!(
                "synthesis frame_bytes must be between 1 and 512, got {}",
                synthesis.queue.frame_bytes
            )));
        }

        let conversation_defaults = ConversationConfig::default();
        let conversation = ConversationConfig {
            max_items: parse_env(&env, "COMPANION_MAX_ITEMS")?
                .or(fc.conversation.max_items)
                .unwrap_or(conversation_defaults.max_items),
            sentence_terminals: fc
                .conversation
                .sentence_terminals
                .unwrap_or(conversation_defaults.sentence_terminals),
            aizuchi: fc
                .conversation
                .aizuchi
                .unwrap_or_default()
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .collect(),
        };

        // Fail at load rather than on every device connection
        SentenceSegmenter::new(&conversation.sentence_terminals)?;

        let device_defaults = DevicesConfig::default();
        let devices = DevicesConfig {
            defaults: DeviceConfig {
                voice_id: env("FISH_VOICE_ID")
                    .or(fc.devices.default_voice_id)
                    .unwrap_or(device_defaults.defaults.voice_id),
                system_prompt: env("COMPANION_SYSTEM_PROMPT")
                    .or(fc.devices.default_system_prompt)
                    .unwrap_or(device_defaults.defaults.system_prompt),
            },
            cache_ttl: parse_env(&env, "COMPANION_DEVICE_CACHE_TTL")?
                .or(fc.devices.cache_ttl_secs)
                .map_or(device_defaults.cache_ttl, Duration::from_secs),
            file: env("COMPANION_DEVICES_FILE")
                .or(fc.devices.file)
                .map(PathBuf::from),
        };

        Ok(Self {
            server,
            api_keys,
            realtime,
            synthesis,
            conversation,
            devices,
        })
    }
}

/// Parse an environment value, treating a present-but-invalid value as an error
fn parse_env<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}
