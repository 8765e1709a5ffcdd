//! Companion Relay - conversational voice relay for companion devices
//!
//! Each connected device gets a session that bridges it to two upstream
//! services: a realtime dialogue engine that hears the user and streams reply
//! text, and a speech synthesizer that turns that text into audio.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  PCM in   ┌──────────────────────────────┐  audio   ┌───────────────────┐
//! │  Device  │──────────▶│           Session            │─────────▶│ Dialogue engine   │
//! │          │◀──────────│  relay · link · segmenter ·  │◀─────────│ (realtime, text)  │
//! └──────────┘ PCM out + │  window · synthesis queue    │  deltas  └───────────────────┘
//!              control   └──────────────┬───────────────┘
//!                                       │ segments  ┌───────────────────┐
//!                                       └──────────▶│ Speech synthesis  │
//!                                                   └───────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod device;
pub mod dialogue;
pub mod error;
pub mod relay;
pub mod session;
pub mod voice;

pub use config::Config;
pub use device::{DeviceConfig, DeviceConfigService};
pub use dialogue::{DialogueConnector, DialogueLink, LinkEvent};
pub use error::{Error, Result};
pub use relay::{ControlMessage, DeviceRelay, DeviceSink};
pub use session::{Session, SessionServices, SessionState};
pub use voice::{FetchPolicy, SentenceSegmenter, SynthesisQueue, Synthesizer};
