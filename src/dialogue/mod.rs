//! Realtime dialogue engine integration
//!
//! The engine listens to the device's microphone audio, detects turns and
//! streams back reply text. Its own audio output is never used.

mod connector;
mod link;
mod protocol;
mod window;

pub use connector::{DialogueChannel, DialogueConnector, RealtimeConnector, RealtimeEndpoint};
pub use link::{DEFAULT_STABLE_AFTER, DialogueLink, LinkState};
pub use protocol::{
    ClientEvent, INPUT_AUDIO_FORMAT, LinkEvent, SessionProfile, SessionSettings,
    TranscriptionSettings, TurnDetection, VadSettings, parse_server_event,
};
pub use window::{ConversationWindow, DEFAULT_MAX_ITEMS};
