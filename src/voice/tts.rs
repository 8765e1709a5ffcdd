//! Text-to-speech (TTS) synthesis

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::retry::parse_retry_after;
use crate::{Error, Result};

/// Streamed synthesized audio body
pub type AudioStream = BoxStream<'static, std::result::Result<Bytes, SynthesisError>>;

/// Output audio encoding requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw little-endian 16-bit PCM
    Pcm,
}

impl AudioFormat {
    /// Wire name used in requests and control messages
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
        }
    }
}

/// One synthesis call: a segment of text in a given voice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
}

/// Why a synthesis call produced no audio
#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    /// Provider answered 429
    #[error("rate limited")]
    RateLimited {
        /// Server-suggested wait, if any
        retry_after: Option<Duration>,
    },

    /// Any other non-success status
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    /// Request or body stream failed below HTTP
    #[error("transport: {0}")]
    Transport(String),
}

/// Speech synthesis backend
///
/// `open` resolves once the provider has accepted the request and the
/// response body can be streamed; it does not wait for the whole body.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `request`, returning the audio body stream
    async fn open(
        &self,
        request: &SynthesisRequest,
    ) -> std::result::Result<AudioStream, SynthesisError>;
}

/// Fish Audio streaming TTS settings
#[derive(Debug, Clone)]
pub struct FishAudioConfig {
    /// Endpoint URL
    pub url: String,
    /// Latency mode hint ("normal" or "balanced")
    pub latency: String,
    /// Output sample rate in Hz
    pub sample_rate: u32,
}

impl Default for FishAudioConfig {
    fn default() -> Self {
        Self {
            url: "https://api.fish.audio/v1/tts".to_string(),
            latency: "balanced".to_string(),
            sample_rate: 44_100,
        }
    }
}

/// Synthesizes speech through the Fish Audio HTTP API
pub struct FishAudioTts {
    client: reqwest::Client,
    api_key: SecretString,
    config: FishAudioConfig,
}

impl FishAudioTts {
    /// Create a new Fish Audio client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: SecretString, config: FishAudioConfig) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "Fish Audio API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            config,
        })
    }
}

#[async_trait]
impl Synthesizer for FishAudioTts {
    async fn open(
        &self,
        request: &SynthesisRequest,
    ) -> std::result::Result<AudioStream, SynthesisError> {
        #[derive(Serialize)]
        struct FishRequest<'a> {
            text: &'a str,
            reference_id: &'a str,
            format: AudioFormat,
            sample_rate: u32,
            latency: &'a str,
        }

        let body = FishRequest {
            text: &request.text,
            reference_id: &request.voice_id,
            format: AudioFormat::Pcm,
            sample_rate: self.config.sample_rate,
            latency: &self.config.latency,
        };

        tracing::debug!(chars = request.text.chars().count(), "requesting Fish Audio TTS");

        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(SynthesisError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| SynthesisError::Transport(e.to_string())))
            .boxed())
    }
}
