//! ReadAnything speech playback pipeline.
//!
//! Turns text plus a voice into audio by driving external synthesis and
//! playback executables, with a streaming-first strategy, a file-based
//! fallback, a single-slot pre-render cache and a timer-driven word
//! highlighter. [`SpeechController`] is the entry point.

pub mod backends;
pub mod candidates;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod highlight;
pub mod pipeline;
pub mod prerender;
pub mod registry;
pub mod session;

pub use backends::{BackendKind, VoiceDescriptor};
pub use config_loader::Settings;
pub use error::{ErrorKind, Result, SpeechError};
pub use events::{ChannelListener, SessionId, SpeechEvent, SpeechListener};
pub use pipeline::Strategy;
pub use session::{PlaybackRequest, SessionState, SpeechController};
