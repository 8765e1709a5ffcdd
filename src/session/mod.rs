//! Per-device conversation session
//!
//! A [`Session`] owns everything one connected device needs: the dialogue
//! link, the synthesis queue, the sentence segmenter and the conversation
//! window. It runs as a single task that reacts to three sources in turn:
//! device audio, dialogue engine events and synthesis drain notifications.
//!
//! ```text
//! connecting --(link connected)--> listening --(response start)--> playing
//!                                      ^                              |
//!                                      +--(drained after turn done)---+
//!                                      +--(user speech, interrupt)----+
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::device::DeviceConfig;
use crate::dialogue::{
    ConversationWindow, DialogueConnector, DialogueLink, LinkEvent, SessionProfile,
};
use crate::relay::{ControlMessage, DeviceInbound, DeviceRelay};
use crate::voice::{AudioFormat, DrainEvent, SentenceSegmenter, SynthesisQueue, Synthesizer};
use crate::{Error, Result};

/// Session controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the dialogue link
    Connecting,
    /// Forwarding device audio upstream
    Listening,
    /// Streaming synthesized audio to the device
    Playing,
}

/// Shared collaborators every session is built from
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<Config>,
    pub connector: Arc<dyn DialogueConnector>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

enum Step {
    Device(Option<DeviceInbound>),
    Link(Option<LinkEvent>),
    Drain(Option<DrainEvent>),
}

/// One device's conversation
pub struct Session {
    config: Arc<Config>,
    device: DeviceConfig,
    state: SessionState,
    relay: Arc<DeviceRelay>,
    link: DialogueLink,
    queue: SynthesisQueue,
    drain_events: mpsc::UnboundedReceiver<DrainEvent>,
    segmenter: SentenceSegmenter,
    window: ConversationWindow,
    /// Current turn number, advanced when playback starts
    turn: u64,
    /// Engine response in progress (turn-done not yet seen)
    response_open: bool,
    /// Turn end queued; waiting for the queue to drain
    turn_ending: bool,
    /// Ignore response text until the cancelled response reports done
    suppress_until_done: bool,
    /// Reply text of the current turn, echoed once its audio has drained
    reply: String,
    next_aizuchi: usize,
}

impl Session {
    /// Build a session for a connected device
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the configured sentence terminals are unusable
    pub fn new(
        services: &SessionServices,
        device: DeviceConfig,
        relay: Arc<DeviceRelay>,
    ) -> Result<Self> {
        let config = Arc::clone(&services.config);
        let segmenter = SentenceSegmenter::new(&config.conversation.sentence_terminals)?;
        let (queue, drain_events) = SynthesisQueue::new(
            Arc::clone(&services.synthesizer),
            Arc::clone(&relay),
            config.synthesis.queue.clone(),
        );

        Ok(Self {
            link: DialogueLink::new(
                Arc::clone(&services.connector),
                config.realtime.reconnect_delay,
            )
            .with_stable_after(config.realtime.stable_after),
            window: ConversationWindow::new(config.conversation.max_items),
            config,
            device,
            state: SessionState::Connecting,
            relay,
            queue,
            drain_events,
            segmenter,
            turn: 0,
            response_open: false,
            turn_ending: false,
            suppress_until_done: false,
            reply: String::new(),
            next_aizuchi: 0,
        })
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Device this session serves
    #[must_use]
    pub fn device_id(&self) -> &str {
        self.relay.device_id()
    }

    /// Run until the device disconnects or the dialogue link fails
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` if the dialogue engine could not be
    /// (re)established; the device has been sent an error notice and closed
    pub async fn run(mut self, mut inbound: mpsc::Receiver<DeviceInbound>) -> Result<()> {
        tracing::info!(
            device_id = %self.device_id(),
            policy = ?self.queue.policy(),
            "session started"
        );

        let profile = self.profile();
        if let Err(e) = self.link.connect(&profile).await {
            return self.fail(e).await;
        }
        self.state = SessionState::Listening;
        tracing::info!(device_id = %self.device_id(), "dialogue link connected, listening");

        let outcome = loop {
            let step = tokio::select! {
                event = self.drain_events.recv() => Step::Drain(event),
                event = self.link.next_event() => Step::Link(event),
                frame = inbound.recv() => Step::Device(frame),
            };

            let result = match step {
                Step::Device(None | Some(DeviceInbound::Closed))
                | Step::Drain(Some(DrainEvent::DeviceClosed) | None) => break Ok(()),
                Step::Device(Some(DeviceInbound::Audio(pcm))) => {
                    self.on_device_audio(&pcm).await;
                    Ok(())
                }
                Step::Link(Some(event)) => self.on_link_event(event).await,
                Step::Link(None) => self.on_link_closed().await,
                Step::Drain(Some(DrainEvent::TurnComplete { turn })) => {
                    self.on_turn_drained(turn).await
                }
            };

            match result {
                Ok(()) => {}
                Err(Error::DeviceTransport(reason)) => {
                    tracing::debug!(device_id = %self.device_id(), %reason, "device send failed");
                    break Ok(());
                }
                Err(e @ Error::UpstreamConnect(_)) => break Err(e),
                Err(e) => {
                    tracing::warn!(device_id = %self.device_id(), error = %e, "session step failed");
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.shutdown().await;
                tracing::info!(device_id = %self.device_id(), "session ended");
                Ok(())
            }
            Err(e) => self.fail(e).await,
        }
    }

    fn profile(&self) -> SessionProfile {
        self.config.realtime.profile(&self.device.system_prompt)
    }

    async fn on_device_audio(&self, pcm: &[u8]) {
        if self.state != SessionState::Listening {
            tracing::trace!(bytes = pcm.len(), "dropping device audio while playing");
            return;
        }
        if let Err(e) = self.link.send_audio(pcm).await {
            tracing::debug!(device_id = %self.device_id(), error = %e, "audio not forwarded");
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) -> Result<()> {
        match event {
            LinkEvent::SpeechStarted => {
                if self.state == SessionState::Playing {
                    self.interrupt().await?;
                } else {
                    tracing::debug!(device_id = %self.device_id(), "speech started");
                }
            }
            LinkEvent::SpeechStopped => {
                tracing::debug!(device_id = %self.device_id(), "speech stopped");
                if self.state == SessionState::Listening && !self.config.conversation.aizuchi.is_empty() {
                    self.begin_playback().await?;
                    self.push_aizuchi();
                }
            }
            LinkEvent::ResponseStarted => {
                if self.suppress_until_done {
                    return Ok(());
                }
                self.open_response().await?;
            }
            LinkEvent::TranscriptDelta(delta) => {
                if self.suppress_until_done {
                    return Ok(());
                }
                if !self.response_open {
                    self.open_response().await?;
                }
                self.reply.push_str(&delta);
                for segment in self.segmenter.push(&delta) {
                    self.enqueue(segment);
                }
            }
            LinkEvent::ItemCreated(item_id) => {
                for evicted in self.window.track(item_id) {
                    tracing::debug!(device_id = %self.device_id(), item_id = %evicted, "evicting conversation item");
                    if let Err(e) = self.link.delete_item(&evicted).await {
                        tracing::debug!(error = %e, "item delete not sent");
                    }
                }
            }
            LinkEvent::TurnDone => self.on_turn_done().await,
            LinkEvent::Transcription(text) => {
                tracing::info!(device_id = %self.device_id(), transcript = %text, "user utterance");
                if let Err(e) = self.relay.send_control(&ControlMessage::Transcription { text }).await {
                    tracing::debug!(error = %e, "transcription not delivered");
                }
            }
            LinkEvent::Error(detail) => {
                tracing::warn!(device_id = %self.device_id(), %detail, "dialogue engine error");
            }
        }
        Ok(())
    }

    /// Start the device's playing turn
    async fn begin_playback(&mut self) -> Result<()> {
        self.turn += 1;
        self.turn_ending = false;
        self.segmenter.clear();
        self.reply.clear();
        self.state = SessionState::Playing;
        tracing::info!(device_id = %self.device_id(), turn = self.turn, "playback started");

        self.relay
            .send_control(&ControlMessage::AudioStart {
                sample_rate: self.config.synthesis.fish.sample_rate,
                format: AudioFormat::Pcm,
            })
            .await
    }

    /// Begin consuming an engine response, starting playback if needed
    async fn open_response(&mut self) -> Result<()> {
        if self.response_open {
            return Ok(());
        }
        if self.state == SessionState::Playing && !self.turn_ending {
            // Playback already started by a filler phrase
            self.segmenter.clear();
        } else {
            self.begin_playback().await?;
        }
        self.response_open = true;
        Ok(())
    }

    fn enqueue(&mut self, segment: String) {
        let seq = self.queue.push(segment, self.device.voice_id.clone());
        tracing::debug!(device_id = %self.device_id(), seq, turn = self.turn, "segment queued");
    }

    fn push_aizuchi(&mut self) {
        let phrases = &self.config.conversation.aizuchi;
        let phrase = phrases[self.next_aizuchi % phrases.len()].clone();
        self.next_aizuchi = self.next_aizuchi.wrapping_add(1);
        self.enqueue(phrase);
    }

    async fn on_turn_done(&mut self) {
        if self.suppress_until_done {
            self.suppress_until_done = false;
            tracing::debug!(device_id = %self.device_id(), "cancelled response finished");
        } else if self.state == SessionState::Playing && !self.turn_ending {
            self.close_turn();
        }
        self.response_open = false;

        if let Err(e) = self.link.clear_input().await {
            tracing::debug!(error = %e, "input clear not sent");
        }
    }

    /// Flush trailing text and mark the end of the current turn
    fn close_turn(&mut self) {
        if let Some(rest) = self.segmenter.finish() {
            self.enqueue(rest);
        }
        self.turn_ending = true;
        self.queue.end_turn(self.turn);
        tracing::debug!(device_id = %self.device_id(), turn = self.turn, "turn text complete");
    }

    async fn on_turn_drained(&mut self, turn: u64) -> Result<()> {
        if turn != self.turn || self.state != SessionState::Playing || !self.turn_ending {
            tracing::trace!(turn, current = self.turn, "ignoring stale turn completion");
            return Ok(());
        }

        let reply = std::mem::take(&mut self.reply);
        self.return_to_listening(Some(reply)).await?;
        tracing::info!(device_id = %self.device_id(), turn, "turn complete, listening");
        Ok(())
    }

    /// Tell the device playback is over, echoing `reply` first if non-empty
    async fn return_to_listening(&mut self, reply: Option<String>) -> Result<()> {
        self.state = SessionState::Listening;
        self.turn_ending = false;
        if !self.relay.is_open() {
            return Err(Error::DeviceTransport("device closed".to_string()));
        }
        self.relay.send_control(&ControlMessage::AudioEnd).await?;

        if let Some(text) = reply.filter(|r| !r.trim().is_empty()) {
            if let Err(e) = self.relay.send_control(&ControlMessage::Response { text }).await {
                tracing::debug!(error = %e, "reply text not delivered");
            }
        }

        self.relay.send_control(&ControlMessage::Listening).await
    }

    /// User spoke over playback: silence the turn and listen again
    async fn interrupt(&mut self) -> Result<()> {
        self.relay.interrupt().await;
        let discarded = self.queue.interrupt();
        self.segmenter.clear();
        self.reply.clear();

        if self.response_open {
            if let Err(e) = self.link.cancel_response().await {
                tracing::debug!(error = %e, "response cancel not sent");
            }
            self.suppress_until_done = true;
            self.response_open = false;
        }

        tracing::info!(
            device_id = %self.device_id(),
            turn = self.turn,
            discarded,
            "playback interrupted by user speech"
        );
        self.return_to_listening(None).await
    }

    /// Engine closed the connection while the device is still here
    async fn on_link_closed(&mut self) -> Result<()> {
        tracing::warn!(device_id = %self.device_id(), "dialogue link closed unexpectedly");

        let profile = self.profile();
        self.link.reconnect(&profile).await?;
        self.window.reset();
        self.suppress_until_done = false;

        // No turn-done will arrive for the old connection's turn, whether
        // it was a response or only a filler phrase
        self.response_open = false;
        if self.state == SessionState::Playing && !self.turn_ending {
            self.close_turn();
        }

        tracing::info!(
            device_id = %self.device_id(),
            reconnects = self.link.reconnects(),
            "dialogue link re-established"
        );
        Ok(())
    }

    async fn fail(mut self, error: Error) -> Result<()> {
        tracing::error!(device_id = %self.device_id(), error = %error, "session terminated");
        let notice = ControlMessage::Error {
            message: "dialogue service unavailable".to_string(),
        };
        if let Err(e) = self.relay.send_control(&notice).await {
            tracing::debug!(error = %e, "error notice not delivered");
        }
        self.shutdown().await;
        Err(error)
    }

    async fn shutdown(&mut self) {
        self.queue.interrupt();
        self.link.close();
        self.relay.close().await;
    }
}
