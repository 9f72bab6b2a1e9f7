//! # Realtime Relay
//!
//! Bridges a local audio producer/consumer (a browser over WebSocket, or
//! this machine's microphone and speakers) to the upstream realtime speech
//! service.
//!
//! ## Data flow:
//! ```text
//! capture -> codec (PCM16 + base64) -> session -> upstream
//! upstream -> session -> status changes, transcripts -> downstream
//!                     -> audio deltas -> playback queue -> sink
//! ```

pub mod conversation;
pub mod downstream;
pub mod language;
pub mod protocol;
pub mod session;
pub mod status;
pub mod upstream;

#[cfg(test)]
mod tests;

pub use conversation::{Conversation, ConversationHandle};
pub use downstream::{Downstream, Speaker, TranscriptEvent, TranscriptKind};
#[cfg(feature = "native-audio")]
pub use downstream::LogDownstream;
pub use language::Language;
pub use session::{RelaySession, RelaySettings, SessionDeps};
pub use status::ConnectionStatus;
pub use upstream::{RealtimeConnector, UpstreamConnector};
