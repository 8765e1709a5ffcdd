//! Ordered synthesis queue
//!
//! Segments are synthesized and delivered to the device strictly in push
//! order. A single drainer task per queue pulls entries off the front, opens
//! (or awaits) the segment's audio stream and forwards it to the relay in
//! small paced frames.
//!
//! Two fetch policies are supported:
//!
//! - [`FetchPolicy::Sequential`]: segment N+1 is requested only after
//!   segment N has been fully drained.
//! - [`FetchPolicy::Pipelined`]: every segment is requested as soon as it is
//!   pushed; the drainer still forwards streams in sequence order, waiting
//!   only for the stream handle of the next segment, not its whole body.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::retry::{RetryPolicy, delay_for_attempt};
use super::tts::{AudioStream, SynthesisError, SynthesisRequest, Synthesizer};
use crate::relay::DeviceRelay;
use crate::{Error, Result};

/// When the network request for a queued segment is issued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPolicy {
    /// Request a segment only after the previous one has fully drained
    #[default]
    Sequential,
    /// Request every segment as soon as it is queued
    Pipelined,
}

impl FromStr for FetchPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "strict" => Ok(Self::Sequential),
            "pipelined" | "pipeline" | "eager" => Ok(Self::Pipelined),
            other => Err(Error::Config(format!("unknown synthesis policy: {other}"))),
        }
    }
}

/// Tuning for one synthesis queue
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Fetch scheduling policy
    pub policy: FetchPolicy,
    /// Backoff for rate-limited requests
    pub retry: RetryPolicy,
    /// Largest audio frame sent to the device
    pub frame_bytes: usize,
    /// Frames sent between pacing pauses
    pub frames_per_yield: usize,
    /// Length of each pacing pause
    pub yield_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            policy: FetchPolicy::default(),
            retry: RetryPolicy::default(),
            frame_bytes: 512,
            frames_per_yield: 4,
            yield_interval: Duration::from_millis(5),
        }
    }
}

/// Lifecycle of a synthesis task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Fetching,
    Streaming,
    Done,
    Failed,
}

/// One segment awaiting or undergoing synthesis
#[derive(Debug, Clone)]
pub struct SynthesisTask {
    pub seq: u64,
    pub text: String,
    pub voice_id: String,
    pub state: TaskState,
    pub retries: u32,
}

impl SynthesisTask {
    fn request(&self) -> SynthesisRequest {
        SynthesisRequest {
            text: self.text.clone(),
            voice_id: self.voice_id.clone(),
        }
    }
}

/// Notifications from the drainer to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainEvent {
    /// Every segment queued before the matching `end_turn` has been handled
    TurnComplete { turn: u64 },
    /// The device connection failed mid-drain; the queue was discarded
    DeviceClosed,
}

type Prefetch = JoinHandle<(std::result::Result<AudioStream, SynthesisError>, u32)>;

struct Queued {
    task: SynthesisTask,
    epoch: u64,
    prefetch: Option<Prefetch>,
}

enum Entry {
    Task(Queued),
    TurnEnd(u64),
}

enum DrainOutcome {
    Completed { frames: usize, bytes: usize },
    Interrupted,
    Failed,
}

struct Shared {
    synthesizer: Arc<dyn Synthesizer>,
    relay: Arc<DeviceRelay>,
    settings: QueueSettings,
    entries: Mutex<VecDeque<Entry>>,
    wake: Notify,
    cancel: Mutex<CancellationToken>,
    events: mpsc::UnboundedSender<DrainEvent>,
}

/// Orders segments for synthesis and drains their audio to the device
pub struct SynthesisQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
    next_seq: u64,
}

impl SynthesisQueue {
    /// Create a queue and start its drainer
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        relay: Arc<DeviceRelay>,
        settings: QueueSettings,
    ) -> (Self, mpsc::UnboundedReceiver<DrainEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            synthesizer,
            relay,
            settings,
            entries: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            cancel: Mutex::new(CancellationToken::new()),
            events,
        });

        let worker = tokio::spawn(run_drainer(Arc::clone(&shared)));

        (
            Self {
                shared,
                worker,
                next_seq: 0,
            },
            events_rx,
        )
    }

    /// Fetch policy in effect
    #[must_use]
    pub fn policy(&self) -> FetchPolicy {
        self.shared.settings.policy
    }

    /// Queue a segment, returning its sequence number
    ///
    /// Under the pipelined policy the network request starts immediately.
    pub fn push(&mut self, text: impl Into<String>, voice_id: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let task = SynthesisTask {
            seq,
            text: text.into(),
            voice_id: voice_id.into(),
            state: TaskState::Pending,
            retries: 0,
        };

        let prefetch = match self.shared.settings.policy {
            FetchPolicy::Sequential => None,
            FetchPolicy::Pipelined => {
                let synthesizer = Arc::clone(&self.shared.synthesizer);
                let request = task.request();
                let retry = self.shared.settings.retry.clone();
                Some(tokio::spawn(async move {
                    fetch_with_retry(synthesizer.as_ref(), &request, &retry, seq).await
                }))
            }
        };

        tracing::debug!(seq, policy = ?self.shared.settings.policy, "segment queued");

        let epoch = self.shared.relay.epoch();
        self.shared.enqueue(Entry::Task(Queued {
            task,
            epoch,
            prefetch,
        }));
        seq
    }

    /// Mark the end of a turn
    ///
    /// A [`DrainEvent::TurnComplete`] is emitted once every segment queued
    /// before this call has been delivered or dropped.
    pub fn end_turn(&self, turn: u64) {
        self.shared.enqueue(Entry::TurnEnd(turn));
    }

    /// Discard every queued segment and stop the active drain
    ///
    /// Returns how many not-yet-started segments were discarded. In-flight
    /// fetches are aborted; nothing they return is forwarded.
    pub fn interrupt(&self) -> usize {
        {
            let mut token = self
                .shared
                .cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            token.cancel();
            *token = CancellationToken::new();
        }

        let discarded = self.shared.discard_all();
        tracing::debug!(discarded, "synthesis queue interrupted");
        discarded
    }

    /// Segments waiting behind the active drain
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| matches!(e, Entry::Task(_)))
            .count()
    }
}

impl Drop for SynthesisQueue {
    fn drop(&mut self) {
        self.worker.abort();
        self.interrupt();
    }
}

impl Shared {
    fn enqueue(&self, entry: Entry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(entry);
        self.wake.notify_one();
    }

    fn pop(&self) -> Option<Entry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn discard_all(&self) -> usize {
        let drained: Vec<Entry> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut discarded = 0;
        for entry in drained {
            if let Entry::Task(queued) = entry {
                if let Some(handle) = queued.prefetch {
                    handle.abort();
                }
                discarded += 1;
            }
        }
        discarded
    }

    async fn next_entry(&self) -> Entry {
        loop {
            if let Some(entry) = self.pop() {
                return entry;
            }
            self.wake.notified().await;
        }
    }

    /// Synthesize and deliver one segment
    ///
    /// Only device transport failures are returned as errors; synthesis
    /// failures drop the segment.
    async fn process(&self, queued: Queued) -> Result<()> {
        let Queued {
            mut task,
            epoch,
            mut prefetch,
        } = queued;

        let token = self.token();
        if token.is_cancelled() || self.relay.epoch() != epoch {
            if let Some(handle) = prefetch {
                handle.abort();
            }
            tracing::debug!(seq = task.seq, "skipping segment from interrupted turn");
            return Ok(());
        }

        task.state = TaskState::Fetching;
        let opened = match prefetch.as_mut() {
            Some(handle) => tokio::select! {
                () = token.cancelled() => None,
                joined = handle => Some(joined.unwrap_or_else(|e| {
                    (Err(SynthesisError::Transport(format!("fetch task failed: {e}"))), 0)
                })),
            },
            None => {
                let request = task.request();
                tokio::select! {
                    () = token.cancelled() => None,
                    fetched = fetch_with_retry(
                        self.synthesizer.as_ref(),
                        &request,
                        &self.settings.retry,
                        task.seq,
                    ) => Some(fetched),
                }
            }
        };

        let Some((opened, retries)) = opened else {
            if let Some(handle) = prefetch {
                handle.abort();
            }
            tracing::debug!(seq = task.seq, "fetch abandoned after interruption");
            return Ok(());
        };
        task.retries = retries;

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                task.state = TaskState::Failed;
                tracing::warn!(
                    seq = task.seq,
                    retries = task.retries,
                    error = %e,
                    "dropping segment after synthesis failure"
                );
                return Ok(());
            }
        };

        task.state = TaskState::Streaming;
        match self.drain(task.seq, epoch, stream, &token).await? {
            DrainOutcome::Completed { frames, bytes } => {
                task.state = TaskState::Done;
                tracing::debug!(seq = task.seq, frames, bytes, "segment delivered");
            }
            DrainOutcome::Interrupted => {
                tracing::debug!(seq = task.seq, "segment drain interrupted");
            }
            DrainOutcome::Failed => {
                task.state = TaskState::Failed;
            }
        }
        Ok(())
    }

    /// Forward a synthesis stream to the relay in bounded, paced frames
    async fn drain(
        &self,
        seq: u64,
        epoch: u64,
        mut stream: AudioStream,
        token: &CancellationToken,
    ) -> Result<DrainOutcome> {
        let frame_bytes = self.settings.frame_bytes.max(1);
        let frames_per_yield = self.settings.frames_per_yield.max(1);
        let mut frames = 0usize;
        let mut bytes = 0usize;

        loop {
            let chunk = tokio::select! {
                () = token.cancelled() => return Ok(DrainOutcome::Interrupted),
                chunk = stream.next() => chunk,
            };

            let chunk = match chunk {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    tracing::warn!(seq, frames, error = %e, "synthesis stream failed mid-body");
                    return Ok(DrainOutcome::Failed);
                }
            };

            let mut offset = 0;
            while offset < chunk.len() {
                let end = (offset + frame_bytes).min(chunk.len());
                let frame = chunk.slice(offset..end);
                let len = frame.len();
                offset = end;

                if token.is_cancelled() || !self.relay.send_audio(epoch, frame).await? {
                    return Ok(DrainOutcome::Interrupted);
                }
                frames += 1;
                bytes += len;

                if frames % frames_per_yield == 0 {
                    tokio::select! {
                        () = token.cancelled() => return Ok(DrainOutcome::Interrupted),
                        () = tokio::time::sleep(self.settings.yield_interval) => {}
                    }
                }
            }
        }

        Ok(DrainOutcome::Completed { frames, bytes })
    }
}

async fn run_drainer(shared: Arc<Shared>) {
    loop {
        match shared.next_entry().await {
            Entry::TurnEnd(turn) => {
                let _ = shared.events.send(DrainEvent::TurnComplete { turn });
            }
            Entry::Task(queued) => {
                if let Err(e) = shared.process(queued).await {
                    let discarded = shared.discard_all();
                    tracing::info!(
                        device_id = %shared.relay.device_id(),
                        discarded,
                        error = %e,
                        "device closed mid-drain, discarding queue"
                    );
                    let _ = shared.events.send(DrainEvent::DeviceClosed);
                    return;
                }
            }
        }
    }
}

/// Open a synthesis stream, backing off on rate limits
///
/// Returns the outcome together with the number of retries spent.
async fn fetch_with_retry(
    synthesizer: &dyn Synthesizer,
    request: &SynthesisRequest,
    policy: &RetryPolicy,
    seq: u64,
) -> (std::result::Result<AudioStream, SynthesisError>, u32) {
    let mut attempt = 0;
    loop {
        match synthesizer.open(request).await {
            Err(SynthesisError::RateLimited { retry_after }) if attempt < policy.max_retries => {
                let delay = delay_for_attempt(policy, attempt, retry_after);
                attempt += 1;
                tracing::warn!(
                    seq,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "synthesis rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            outcome => return (outcome, attempt),
        }
    }
}
