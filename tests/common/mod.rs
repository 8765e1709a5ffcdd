//! Shared test utilities
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use companion_relay::dialogue::{DialogueChannel, DialogueConnector};
use companion_relay::relay::DeviceSink;
use companion_relay::voice::{AudioStream, SynthesisError, SynthesisRequest, Synthesizer};
use companion_relay::{Error, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Upper bound on any single wait in a test
pub const WAIT: Duration = Duration::from_secs(30);

/// Poll `condition` until it holds, panicking after [`WAIT`]
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Synthesis

/// Payload returned for text without a script
#[must_use]
pub fn default_payload(text: &str) -> Bytes {
    Bytes::from(text.as_bytes().repeat(100))
}

/// `len` bytes of `tag`, so frames can be attributed to a segment
#[must_use]
pub fn tagged(tag: u8, len: usize) -> Bytes {
    Bytes::from(vec![tag; len])
}

/// How the fake provider answers one text
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Wait before answering
    pub open_delay: Duration,
    /// Answer 429 this many times first
    pub rate_limited: u32,
    /// Answer with this non-success status
    pub status: Option<u16>,
    /// Body chunks; empty means [`default_payload`]
    pub chunks: Vec<Bytes>,
    /// Wait before each body chunk
    pub chunk_delay: Duration,
}

/// One recorded synthesis call
#[derive(Debug, Clone)]
pub struct Call {
    pub text: String,
    pub voice_id: String,
    pub at: Instant,
}

struct InFlight {
    count: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(count: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Self {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Synthesizer answering from per-text scripts
#[derive(Default)]
pub struct ScriptedSynthesizer {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedSynthesizer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the answer for `text`
    pub fn script(&self, text: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(text.to_string(), script);
    }

    /// Every call so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Texts requested so far, in order
    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.text).collect()
    }

    /// Calls made for one text
    #[must_use]
    pub fn calls_for(&self, text: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.text == text).collect()
    }

    /// Most fetches (open or still streaming) alive at once
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_script(&self, text: &str) -> (Script, bool) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(text.to_string()).or_default();
        let limited = if script.rate_limited > 0 {
            script.rate_limited -= 1;
            true
        } else {
            false
        };
        (script.clone(), limited)
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn open(
        &self,
        request: &SynthesisRequest,
    ) -> std::result::Result<AudioStream, SynthesisError> {
        self.calls.lock().unwrap().push(Call {
            text: request.text.clone(),
            voice_id: request.voice_id.clone(),
            at: Instant::now(),
        });
        let guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let (script, limited) = self.take_script(&request.text);

        if !script.open_delay.is_zero() {
            tokio::time::sleep(script.open_delay).await;
        }
        if limited {
            return Err(SynthesisError::RateLimited { retry_after: None });
        }
        if let Some(status) = script.status {
            return Err(SynthesisError::Status {
                status,
                body: "scripted failure".to_string(),
            });
        }

        let chunks = if script.chunks.is_empty() {
            vec![default_payload(&request.text)]
        } else {
            script.chunks
        };
        let delay = script.chunk_delay;

        Ok(futures::stream::unfold(
            (chunks.into_iter(), guard),
            move |(mut rest, guard)| async move {
                let chunk = rest.next()?;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(chunk), (rest, guard)))
            },
        )
        .boxed())
    }
}

// ---------------------------------------------------------------------------
// Device

/// Something the relay sent to the device
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Control(serde_json::Value),
    Audio(Bytes),
}

/// Shared log of everything sent to a fake device
#[derive(Clone, Default)]
pub struct Recording {
    log: Arc<Mutex<Vec<Sent>>>,
    frame_times: Arc<Mutex<Vec<Instant>>>,
    closed: Arc<AtomicBool>,
    fail_after_frames: Option<usize>,
}

impl Recording {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose socket breaks after `frames` audio frames
    #[must_use]
    pub fn failing_after(frames: usize) -> Self {
        Self {
            fail_after_frames: Some(frames),
            ..Self::default()
        }
    }

    /// A sink writing into this recording
    #[must_use]
    pub fn sink(&self) -> Box<dyn DeviceSink> {
        Box::new(RecordingSink {
            recording: self.clone(),
        })
    }

    #[must_use]
    pub fn log(&self) -> Vec<Sent> {
        self.log.lock().unwrap().clone()
    }

    /// Control event names in order
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Control(v) => v["event"].as_str().map(String::from),
                Sent::Audio(_) => None,
            })
            .collect()
    }

    /// Control events and a marker per audio frame, in order
    #[must_use]
    pub fn timeline(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .map(|s| match s {
                Sent::Control(v) => v["event"].as_str().unwrap_or_default().to_string(),
                Sent::Audio(_) => "frame".to_string(),
            })
            .collect()
    }

    /// Control messages with the given event name
    #[must_use]
    pub fn controls(&self, event: &str) -> Vec<serde_json::Value> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Control(v) if v["event"] == event => Some(v),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn frames(&self) -> Vec<Bytes> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Audio(b) => Some(b),
                Sent::Control(_) => None,
            })
            .collect()
    }

    /// When each audio frame reached the device
    #[must_use]
    pub fn frame_times(&self) -> Vec<Instant> {
        self.frame_times.lock().unwrap().clone()
    }

    /// All audio bytes concatenated
    #[must_use]
    pub fn audio(&self) -> Vec<u8> {
        self.frames().concat()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct RecordingSink {
    recording: Recording,
}

#[async_trait]
impl DeviceSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.recording.is_closed() {
            return Err(Error::DeviceTransport("closed".to_string()));
        }
        let value = serde_json::from_str(&text)?;
        self.recording.log.lock().unwrap().push(Sent::Control(value));
        Ok(())
    }

    async fn send_binary(&mut self, frame: Bytes) -> Result<()> {
        if self.recording.is_closed() {
            return Err(Error::DeviceTransport("closed".to_string()));
        }
        if let Some(limit) = self.recording.fail_after_frames {
            if self.recording.frames().len() >= limit {
                self.recording.closed.store(true, Ordering::SeqCst);
                return Err(Error::DeviceTransport("connection reset".to_string()));
            }
        }
        self.recording.log.lock().unwrap().push(Sent::Audio(frame));
        self.recording.frame_times.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn close(&mut self) {
        self.recording.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Dialogue engine

/// Engine side of one fake dialogue connection
pub struct FakeEngine {
    to_session: mpsc::Sender<String>,
    from_session: mpsc::Receiver<String>,
}

impl FakeEngine {
    /// Send a server event
    pub async fn send(&self, event: serde_json::Value) {
        self.to_session
            .send(event.to_string())
            .await
            .expect("session dropped the link");
    }

    /// Send a server event of `kind` with no other fields
    pub async fn emit(&self, kind: &str) {
        self.send(serde_json::json!({ "type": kind })).await;
    }

    pub async fn delta(&self, text: &str) {
        self.send(serde_json::json!({ "type": "response.text.delta", "delta": text }))
            .await;
    }

    pub async fn item_created(&self, id: &str) {
        self.send(serde_json::json!({
            "type": "conversation.item.created",
            "item": { "id": id, "type": "message" }
        }))
        .await;
    }

    /// Next client event, or `None` once the session closed the link
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        tokio::time::timeout(WAIT, self.from_session.recv())
            .await
            .expect("timed out waiting for client event")
            .map(|text| serde_json::from_str(&text).expect("client sent invalid json"))
    }

    /// Skip client events until one of `kind` arrives
    pub async fn recv_type(&mut self, kind: &str) -> serde_json::Value {
        loop {
            let event = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("link closed before {kind}"));
            if event["type"] == kind {
                return event;
            }
        }
    }
}

/// Connector handing out pre-arranged fake connections in order
#[derive(Default)]
pub struct FakeConnector {
    pending: Mutex<VecDeque<DialogueChannel>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arrange the next successful connection
    pub fn accept(&self) -> FakeEngine {
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (in_tx, in_rx) = mpsc::channel(1024);
        self.pending.lock().unwrap().push_back(DialogueChannel {
            outbound: out_tx,
            inbound: in_rx,
        });
        FakeEngine {
            to_session: in_tx,
            from_session: out_rx,
        }
    }

    /// Connection attempts so far, successful or not
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DialogueConnector for FakeConnector {
    async fn connect(&self) -> Result<DialogueChannel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::UpstreamConnect("connection refused".to_string()))
    }
}
