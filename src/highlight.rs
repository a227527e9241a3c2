//! Timer-driven word highlighting.
//!
//! There is no feedback from the audio device, so the current word is an
//! estimate: wait an initial latency, then advance one word per
//! `delay_per_word(rate)`.

use crate::events::{SessionId, SpeechListener};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const MIN_WORD_DELAY_MS: u64 = 50;
pub const MAX_WORD_DELAY_MS: u64 = 1000;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"\b\w+\b").unwrap();
}

/// Character offsets `[start, end)` of one word in the session text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WordSpan {
    pub start: usize,
    pub end: usize,
}

/// Words of `text` in reading order, as character (not byte) offsets.
pub fn word_spans(text: &str) -> Vec<WordSpan> {
    let mut spans = Vec::new();
    let mut chars_before = 0;
    let mut last_byte = 0;
    for m in WORD.find_iter(text) {
        chars_before += text[last_byte..m.start()].chars().count();
        let len = m.as_str().chars().count();
        spans.push(WordSpan {
            start: chars_before,
            end: chars_before + len,
        });
        chars_before += len;
        last_byte = m.end();
    }
    spans
}

/// `60000 / rate` ms, clamped to [50, 1000].
pub fn delay_per_word(rate_wpm: u32) -> Duration {
    if rate_wpm == 0 {
        return Duration::from_millis(MAX_WORD_DELAY_MS);
    }
    let ms = (60_000.0 / rate_wpm as f64).clamp(MIN_WORD_DELAY_MS as f64, MAX_WORD_DELAY_MS as f64);
    Duration::from_millis(ms.round() as u64)
}

/// A running highlight timer for one session. Clears the highlight exactly
/// once: when it runs off the end of the words, or when stopped.
pub struct WordHighlighter {
    session: SessionId,
    cancel: CancellationToken,
    cleared: Arc<AtomicBool>,
    listener: Arc<dyn SpeechListener>,
    task: Option<JoinHandle<()>>,
}

impl WordHighlighter {
    pub fn start(
        session: SessionId,
        text: &str,
        rate_wpm: u32,
        initial_latency: Duration,
        listener: Arc<dyn SpeechListener>,
    ) -> Self {
        let spans = word_spans(text);
        let cancel = CancellationToken::new();
        // Nothing to highlight means nothing to clear either
        let cleared = Arc::new(AtomicBool::new(spans.is_empty()));

        let task = (!spans.is_empty()).then(|| {
            let delay = delay_per_word(rate_wpm);
            let token = cancel.clone();
            let cleared = cleared.clone();
            let listener = listener.clone();
            tracing::debug!(%session, words = spans.len(), ?delay, ?initial_latency, "highlighting");

            tokio::spawn(async move {
                let walk = async {
                    tokio::time::sleep(initial_latency).await;
                    let mut ticker = tokio::time::interval(delay);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    for (index, span) in spans.iter().enumerate() {
                        ticker.tick().await;
                        if token.is_cancelled() {
                            return;
                        }
                        listener.on_word_highlight(session, index, *span);
                    }
                    // Leave the last word up for one period
                    ticker.tick().await;
                    if !cleared.swap(true, Ordering::SeqCst) {
                        listener.on_highlight_cleared(session);
                    }
                };
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = walk => {}
                }
            })
        });

        Self {
            session,
            cancel,
            cleared,
            listener,
            task,
        }
    }

    /// Stops the timer and clears the highlight if that has not happened yet.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if !self.cleared.swap(true, Ordering::SeqCst) {
            self.listener.on_highlight_cleared(self.session);
        }
    }
}

impl Drop for WordHighlighter {
    fn drop(&mut self) {
        self.stop();
    }
}
