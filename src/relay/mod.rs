//! Device transport relay
//!
//! The single point that talks to a device: structured control messages and
//! synthesized audio frames out, microphone PCM frames in.
//!
//! Audio frames are tagged with the turn epoch they were produced for. An
//! interruption advances the epoch while holding the sink lock, so once
//! [`DeviceRelay::interrupt`] returns no frame from the interrupted turn can
//! reach the device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

use crate::voice::AudioFormat;
use crate::{Error, Result};

/// Outgoing control message to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Synthesized audio follows
    AudioStart {
        sample_rate: u32,
        format: AudioFormat,
    },
    /// Audio for this turn is complete
    AudioEnd,
    /// Device may resume streaming microphone audio
    Listening,
    /// What the user was heard saying
    Transcription { text: String },
    /// Full reply text of a completed turn
    Response { text: String },
    /// Session-level failure notice
    Error { message: String },
}

/// Inbound traffic from a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInbound {
    /// Raw little-endian 16-bit PCM microphone samples
    Audio(Bytes),
    /// Device went away
    Closed,
}

/// Write half of a device connection
#[async_trait]
pub trait DeviceSink: Send {
    /// Send a text frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Send a binary frame
    async fn send_binary(&mut self, frame: Bytes) -> Result<()>;

    /// Close the connection
    async fn close(&mut self);
}

#[async_trait]
impl DeviceSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::DeviceTransport(e.to_string()))
    }

    async fn send_binary(&mut self, frame: Bytes) -> Result<()> {
        self.send(Message::Binary(frame))
            .await
            .map_err(|e| Error::DeviceTransport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

/// Serializes all device-bound traffic for one session
pub struct DeviceRelay {
    device_id: String,
    sink: Mutex<Box<dyn DeviceSink>>,
    epoch: AtomicU64,
    open: AtomicBool,
}

impl DeviceRelay {
    /// Wrap the write half of a device connection
    #[must_use]
    pub fn new(device_id: impl Into<String>, sink: Box<dyn DeviceSink>) -> Self {
        Self {
            device_id: device_id.into(),
            sink: Mutex::new(sink),
            epoch: AtomicU64::new(0),
            open: AtomicBool::new(true),
        }
    }

    /// Device this relay serves
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the device connection is still usable
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Current turn epoch; audio must be tagged with it to be delivered
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Send a control message
    ///
    /// # Errors
    ///
    /// Returns `DeviceTransport` if the device connection is closed
    pub async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut sink = self.sink.lock().await;
        self.ensure_open()?;
        let result = sink.send_text(text).await;
        self.note_failure(&result);
        result
    }

    /// Send one audio frame produced for `epoch`
    ///
    /// Returns `Ok(false)` without sending if the turn was interrupted.
    ///
    /// # Errors
    ///
    /// Returns `DeviceTransport` if the device connection is closed
    pub async fn send_audio(&self, epoch: u64, frame: Bytes) -> Result<bool> {
        let mut sink = self.sink.lock().await;
        if self.epoch.load(Ordering::Acquire) != epoch {
            return Ok(false);
        }
        self.ensure_open()?;
        let result = sink.send_binary(frame).await;
        self.note_failure(&result);
        result.map(|()| true)
    }

    /// Advance the turn epoch, fencing off all audio of the current turn
    pub async fn interrupt(&self) -> u64 {
        let _sink = self.sink.lock().await;
        let next = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(device_id = %self.device_id, epoch = next, "relay epoch advanced");
        next
    }

    /// Close the device connection
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if self.open.swap(false, Ordering::AcqRel) {
            sink.close().await;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::DeviceTransport(format!(
                "device {} disconnected",
                self.device_id
            )))
        }
    }

    fn note_failure(&self, result: &Result<()>) {
        if let Err(e) = result {
            if self.open.swap(false, Ordering::AcqRel) {
                tracing::info!(device_id = %self.device_id, error = %e, "device send failed, marking closed");
            }
        }
    }
}

/// Forward inbound device frames to `tx` until the socket closes
///
/// Text frames from the device carry nothing the relay acts on and are
/// ignored.
pub async fn pump_inbound(mut stream: SplitStream<WebSocket>, tx: mpsc::Sender<DeviceInbound>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                if tx.send(DeviceInbound::Audio(data)).await.is_err() {
                    return;
                }
            }
            Ok(Message::Text(text)) => {
                tracing::trace!(len = text.len(), "ignoring device text frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "device socket error");
                break;
            }
        }
    }
    let _ = tx.send(DeviceInbound::Closed).await;
}
