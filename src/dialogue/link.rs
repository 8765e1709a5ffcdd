//! Upstream dialogue link
//!
//! Owns the connection lifecycle to the dialogue engine:
//!
//! ```text
//! disconnected -> connecting -> connected -(unexpected close)-> reconnecting -> connected
//!                                                                           \-> failed
//! ```
//!
//! Every (re)connect is configured from the [`SessionProfile`] passed in by
//! the session, never from state captured on a previous connection.
//!
//! Each unexpected close gets one reconnect attempt, but a reconnected link
//! that closes again before it has been up for `stable_after` fails instead
//! of reconnecting. An engine that accepts and immediately drops
//! connections therefore ends the session rather than looping.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::connector::{DialogueChannel, DialogueConnector};
use super::protocol::{ClientEvent, LinkEvent, SessionProfile, parse_server_event};
use crate::{Error, Result};

/// Default uptime after which a reconnected link may reconnect again
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(10);

/// Connection state of a dialogue link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// One session's connection to the dialogue engine
pub struct DialogueLink {
    connector: Arc<dyn DialogueConnector>,
    channel: Option<DialogueChannel>,
    state: LinkState,
    reconnect_delay: Duration,
    stable_after: Duration,
    reconnects: u32,
    connected_at: Option<Instant>,
}

impl DialogueLink {
    /// Create a disconnected link
    #[must_use]
    pub fn new(connector: Arc<dyn DialogueConnector>, reconnect_delay: Duration) -> Self {
        Self {
            connector,
            channel: None,
            state: LinkState::Disconnected,
            reconnect_delay,
            stable_after: DEFAULT_STABLE_AFTER,
            reconnects: 0,
            connected_at: None,
        }
    }

    /// Set the uptime a reconnected link needs before it may reconnect again
    #[must_use]
    pub const fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Reconnects attempted over the link's lifetime
    #[must_use]
    pub const fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Connect and configure the engine session
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` if the engine cannot be reached; the link
    /// is then `Failed`
    pub async fn connect(&mut self, profile: &SessionProfile) -> Result<()> {
        self.state = LinkState::Connecting;
        if let Err(e) = self.open(profile).await {
            self.state = LinkState::Failed;
            return Err(e);
        }
        Ok(())
    }

    /// Make exactly one reconnect attempt after an unexpected close
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` if the attempt fails, or without trying if
    /// the previous reconnect did not stay up for `stable_after`; the link
    /// is then `Failed` and will not retry
    pub async fn reconnect(&mut self, profile: &SessionProfile) -> Result<()> {
        self.channel = None;

        if self.reconnects > 0 {
            if let Some(at) = self.connected_at {
                let uptime = at.elapsed();
                if uptime < self.stable_after {
                    self.state = LinkState::Failed;
                    tracing::warn!(
                        uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
                        reconnects = self.reconnects,
                        "dialogue engine dropped the reconnected link, giving up"
                    );
                    return Err(Error::UpstreamConnect(
                        "dialogue engine keeps closing the connection".to_string(),
                    ));
                }
            }
        }

        self.state = LinkState::Reconnecting;
        self.reconnects += 1;

        tracing::info!(
            attempt = self.reconnects,
            delay_ms = u64::try_from(self.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting to dialogue engine"
        );
        tokio::time::sleep(self.reconnect_delay).await;

        if let Err(e) = self.open(profile).await {
            self.state = LinkState::Failed;
            return Err(match e {
                Error::UpstreamConnect(_) => e,
                other => Error::UpstreamConnect(other.to_string()),
            });
        }
        Ok(())
    }

    async fn open(&mut self, profile: &SessionProfile) -> Result<()> {
        let channel = self.connector.connect().await.map_err(|e| match e {
            Error::UpstreamConnect(_) => e,
            other => Error::UpstreamConnect(other.to_string()),
        })?;

        let update = profile.session_update().to_frame()?;
        channel.outbound.send(update).await.map_err(|_| {
            Error::UpstreamConnect("connection closed before configuration".to_string())
        })?;

        self.channel = Some(channel);
        self.state = LinkState::Connected;
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    /// Wait for the next event the session acts on
    ///
    /// Returns `None` when the engine closes the connection. Malformed
    /// frames are logged and skipped. Pends forever while disconnected.
    /// Cancel safe.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        let Some(channel) = self.channel.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            let Some(frame) = channel.inbound.recv().await else {
                self.channel = None;
                self.state = LinkState::Disconnected;
                return None;
            };

            match parse_server_event(&frame) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "ignoring malformed engine event"),
            }
        }
    }

    /// Append microphone PCM to the engine's input buffer
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` if the link is down
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        self.send(&ClientEvent::append_audio(pcm)).await
    }

    /// Delete a conversation item upstream
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` if the link is down
    pub async fn delete_item(&self, item_id: &str) -> Result<()> {
        self.send(&ClientEvent::DeleteItem {
            item_id: item_id.to_string(),
        })
        .await
    }

    /// Clear the engine's input audio buffer
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` if the link is down
    pub async fn clear_input(&self) -> Result<()> {
        self.send(&ClientEvent::ClearAudio).await
    }

    /// Cancel the in-flight response
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` if the link is down
    pub async fn cancel_response(&self) -> Result<()> {
        self.send(&ClientEvent::CancelResponse).await
    }

    /// Close the connection
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            tracing::debug!("dialogue link closed");
        }
        self.state = LinkState::Disconnected;
    }

    async fn send(&self, event: &ClientEvent) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| Error::UpstreamConnect("dialogue link not connected".to_string()))?;

        channel
            .outbound
            .send(event.to_frame()?)
            .await
            .map_err(|_| Error::UpstreamConnect("dialogue link closed".to_string()))
    }
}
