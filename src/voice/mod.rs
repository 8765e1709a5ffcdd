//! Voice output pipeline
//!
//! Turns streamed reply text into sentence segments, synthesizes each one and
//! drains the audio to the device in order.

mod queue;
mod retry;
mod segmenter;
mod tts;

pub use queue::{
    DrainEvent, FetchPolicy, QueueSettings, SynthesisQueue, SynthesisTask, TaskState,
};
pub use retry::{RetryPolicy, delay_for_attempt, parse_retry_after};
pub use segmenter::{DEFAULT_TERMINALS, SentenceSegmenter, TranscriptBuffer};
pub use tts::{
    AudioFormat, AudioStream, FishAudioConfig, FishAudioTts, SynthesisError, SynthesisRequest,
    Synthesizer,
};
