//! Callbacks from the speech pipeline to whoever drives it (UI, CLI).

use crate::error::ErrorKind;
use crate::highlight::WordSpan;
use crate::session::SessionState;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one `play` call. Monotonic per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives pipeline events. Called from background tasks, so implementations
/// must be cheap and must not block.
pub trait SpeechListener: Send + Sync {
    fn on_state_changed(&self, _session: SessionId, _state: SessionState) {}

    /// Audio played to the end.
    fn on_finished(&self, _session: SessionId) {}

    /// Terminal failure of a session. Never called for cancellation.
    fn on_error(&self, _session: SessionId, _kind: ErrorKind, _message: &str) {}

    fn on_word_highlight(&self, _session: SessionId, _index: usize, _span: WordSpan) {}

    fn on_highlight_cleared(&self, _session: SessionId) {}

    /// A pre-rendered file for the current text and `voice_id` is ready.
    fn on_prerender_ready(&self, _voice_id: &str) {}
}

/// Ignores everything.
pub struct NullListener;

impl SpeechListener for NullListener {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SpeechEvent {
    StateChanged {
        session: SessionId,
        state: SessionState,
    },
    Finished {
        session: SessionId,
    },
    Error {
        session: SessionId,
        kind: ErrorKind,
        message: String,
    },
    WordHighlight {
        session: SessionId,
        index: usize,
        span: WordSpan,
    },
    HighlightCleared {
        session: SessionId,
    },
    PreRenderReady {
        voice_id: String,
    },
}

/// Forwards every callback as a [`SpeechEvent`] on an unbounded channel.
#[derive(Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SpeechEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SpeechEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SpeechEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl SpeechListener for ChannelListener {
    fn on_state_changed(&self, session: SessionId, state: SessionState) {
        self.send(SpeechEvent::StateChanged { session, state });
    }

    fn on_finished(&self, session: SessionId) {
        self.send(SpeechEvent::Finished { session });
    }

    fn on_error(&self, session: SessionId, kind: ErrorKind, message: &str) {
        self.send(SpeechEvent::Error {
            session,
            kind,
            message: message.to_string(),
        });
    }

    fn on_word_highlight(&self, session: SessionId, index: usize, span: WordSpan) {
        self.send(SpeechEvent::WordHighlight {
            session,
            index,
            span,
        });
    }

    fn on_highlight_cleared(&self, session: SessionId) {
        self.send(SpeechEvent::HighlightCleared { session });
    }

    fn on_prerender_ready(&self, voice_id: &str) {
        self.send(SpeechEvent::PreRenderReady {
            voice_id: voice_id.to_string(),
        });
    }
}
