//! Realtime dialogue engine wire types
//!
//! Client events are serialized to JSON text frames; server events are parsed
//! into the small set of [`LinkEvent`]s a session acts on. Everything else the
//! engine sends is ignored.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Voice-activity detection tuning used by the engine to find turn ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadSettings {
    /// Activation threshold, 0.0-1.0 (lower is more sensitive)
    pub threshold: f32,
    /// Audio kept from before speech was detected
    pub prefix_padding_ms: u32,
    /// Trailing silence that ends a turn
    pub silence_duration_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            prefix_padding_ms: 0,
            silence_duration_ms: 700,
        }
    }
}

/// Everything needed to configure an engine session
///
/// Rebuilt from the session's resolved configuration on every (re)connect.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProfile {
    /// System prompt sent as engine instructions
    pub instructions: String,
    /// Speech recognition model for the user's audio
    pub transcription_model: String,
    /// Recognition language hint
    pub language: String,
    /// Turn detection tuning
    pub vad: VadSettings,
}

impl SessionProfile {
    /// Build the `session.update` event for this profile
    ///
    /// Responses are text-only; speech is produced by the synthesis path.
    #[must_use]
    pub fn session_update(&self) -> ClientEvent {
        ClientEvent::SessionUpdate {
            session: SessionSettings {
                modalities: vec!["text".to_string()],
                instructions: self.instructions.clone(),
                input_audio_format: INPUT_AUDIO_FORMAT.to_string(),
                input_audio_transcription: TranscriptionSettings {
                    model: self.transcription_model.clone(),
                    language: self.language.clone(),
                },
                turn_detection: TurnDetection {
                    kind: "server_vad".to_string(),
                    threshold: self.vad.threshold,
                    prefix_padding_ms: self.vad.prefix_padding_ms,
                    silence_duration_ms: self.vad.silence_duration_ms,
                },
            },
        }
    }
}

/// Encoding of microphone audio appended to the engine's input buffer
pub const INPUT_AUDIO_FORMAT: &str = "pcm16";

/// Event sent to the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio {
        /// Base64 of raw PCM16 samples
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.clear")]
    ClearAudio,

    #[serde(rename = "conversation.item.delete")]
    DeleteItem { item_id: String },

    #[serde(rename = "response.cancel")]
    CancelResponse,
}

impl ClientEvent {
    /// Wrap raw PCM for `input_audio_buffer.append`
    #[must_use]
    pub fn append_audio(pcm: &[u8]) -> Self {
        Self::AppendAudio {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub input_audio_format: String,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: TurnDetection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Normalized engine event consumed by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// User began speaking
    SpeechStarted,
    /// User stopped speaking; a response will follow
    SpeechStopped,
    /// Engine began producing a response
    ResponseStarted,
    /// Incremental response text
    TranscriptDelta(String),
    /// Engine acknowledged a new conversation item
    ItemCreated(String),
    /// Response finished
    TurnDone,
    /// Completed transcription of the user's utterance
    Transcription(String),
    /// Engine-reported error
    Error(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded,

    #[serde(rename = "response.text.delta", alias = "response.output_text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "conversation.item.created")]
    ItemCreated { item: ItemRef },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ItemRef {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// Parse one server text frame
///
/// Returns `Ok(None)` for well-formed events the session does not act on.
///
/// # Errors
///
/// Returns `Protocol` if the frame is not a recognizable engine event
pub fn parse_server_event(frame: &str) -> Result<Option<LinkEvent>> {
    let event: ServerEvent =
        serde_json::from_str(frame).map_err(|e| Error::Protocol(e.to_string()))?;

    Ok(match event {
        ServerEvent::SpeechStarted => Some(LinkEvent::SpeechStarted),
        ServerEvent::SpeechStopped => Some(LinkEvent::SpeechStopped),
        ServerEvent::OutputItemAdded => Some(LinkEvent::ResponseStarted),
        ServerEvent::TextDelta { delta } => Some(LinkEvent::TranscriptDelta(delta)),
        ServerEvent::ItemCreated { item } => Some(LinkEvent::ItemCreated(item.id)),
        ServerEvent::ResponseDone => Some(LinkEvent::TurnDone),
        ServerEvent::TranscriptionCompleted { transcript } => {
            Some(LinkEvent::Transcription(transcript))
        }
        ServerEvent::Error { error } => Some(LinkEvent::Error(match error.code {
            Some(code) => format!("{code}: {}", error.message),
            None => error.message,
        })),
        ServerEvent::Other => None,
    })
}
