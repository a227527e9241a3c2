//! The speech session controller: at most one utterance plays at a time.

use crate::backends::VoiceDescriptor;
use crate::config_loader::Settings;
use crate::error::{Result, SpeechError};
use crate::events::{SessionId, SpeechListener};
use crate::highlight::WordHighlighter;
use crate::pipeline::process::{ProcessLedger, ProcessSet};
use crate::pipeline::{ProcessPipeline, Strategy, SynthesisPlan};
use crate::prerender::PreRenderCache;
use crate::registry::BackendRegistry;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempPath;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const MIN_RATE_WPM: u32 = 50;
pub const MAX_RATE_WPM: u32 = 300;

/// `Idle -> Preparing -> Playing -> Idle`; `Preparing` and `Playing` go
/// through `Stopping` on cancel and straight to `Idle` on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Idle,
    Preparing,
    Playing,
    Stopping,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, Playing)
                | (Preparing, Stopping)
                | (Playing, Stopping)
                | (Preparing, Idle)
                | (Playing, Idle)
                | (Stopping, Idle)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Preparing | SessionState::Playing)
    }
}

/// What to say, with which voice, how fast. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    text: String,
    voice: VoiceDescriptor,
    rate_wpm: u32,
}

impl PlaybackRequest {
    /// Trims the text and clamps the rate into [50, 300] WPM.
    pub fn new(text: &str, voice: VoiceDescriptor, rate_wpm: u32) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SpeechError::InvalidRequest("nothing to say".to_string()));
        }
        Ok(Self {
            text: text.to_string(),
            voice,
            rate_wpm: rate_wpm.clamp(MIN_RATE_WPM, MAX_RATE_WPM),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn voice(&self) -> &VoiceDescriptor {
        &self.voice
    }

    pub fn rate_wpm(&self) -> u32 {
        self.rate_wpm
    }
}

/// Snapshot of a session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub request: PlaybackRequest,
    pub started_at: DateTime<Local>,
    pub state: SessionState,
    pub processes: ProcessLedger,
}

impl Session {
    /// PIDs of every process this session spawned, in spawn order.
    pub fn process_ids(&self) -> Vec<u32> {
        self.processes.pids()
    }
}

enum Prepared {
    PreRendered(Arc<TempPath>),
    Synthesize(SynthesisPlan),
}

struct Active {
    session: Session,
    cancel: CancellationToken,
    highlighter: Option<WordHighlighter>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    state: SessionState,
    active: Option<Active>,
}

struct Shared {
    settings: Arc<Settings>,
    registry: Arc<BackendRegistry>,
    pipeline: Arc<ProcessPipeline>,
    cache: PreRenderCache,
    listener: Arc<dyn SpeechListener>,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

pub struct SpeechController {
    shared: Arc<Shared>,
    // Serializes play/stop so a new session never overlaps the old one's teardown
    turn: tokio::sync::Mutex<()>,
}

impl SpeechController {
    pub fn new(settings: Arc<Settings>, listener: Arc<dyn SpeechListener>) -> Self {
        let registry = Arc::new(BackendRegistry::new(&settings));
        let pipeline = Arc::new(ProcessPipeline::new(&settings));
        Self::with_parts(settings, registry, pipeline, listener)
    }

    pub fn with_parts(
        settings: Arc<Settings>,
        registry: Arc<BackendRegistry>,
        pipeline: Arc<ProcessPipeline>,
        listener: Arc<dyn SpeechListener>,
    ) -> Self {
        let cache = PreRenderCache::new(
            settings.clone(),
            registry.clone(),
            pipeline.clone(),
            listener.clone(),
        );
        Self {
            shared: Arc::new(Shared {
                settings,
                registry,
                pipeline,
                cache,
                listener,
                next_id: AtomicU64::new(1),
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    active: None,
                }),
            }),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.shared.registry
    }

    pub fn cache(&self) -> &PreRenderCache {
        &self.shared.cache
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn current_session(&self) -> Option<Session> {
        let inner = self.shared.lock();
        inner.active.as_ref().map(|a| Session {
            state: inner.state,
            ..a.session.clone()
        })
    }

    /// Resolves `voice_id` and plays `text` with it.
    pub async fn play_text(&self, text: &str, voice_id: &str, rate_wpm: u32) -> Result<SessionId> {
        let registry = self.shared.registry.clone();
        let id = voice_id.to_string();
        let voice = tokio::task::spawn_blocking(move || registry.resolve(&id))
            .await
            .ok()
            .flatten()
            .ok_or_else(|| SpeechError::InvalidRequest(format!("unknown voice: {}", voice_id)))?;
        self.play(PlaybackRequest::new(text, voice, rate_wpm)?).await
    }

    /// Stops whatever is playing, then starts a new session for `request`.
    ///
    /// Returns once the session's worker is running. Failures detected before
    /// that (no executable, say) are reported to the listener and returned;
    /// later ones only reach the listener.
    pub async fn play(&self, request: PlaybackRequest) -> Result<SessionId> {
        let _turn = self.turn.lock().await;
        self.shared.stop_active().await;

        let shared = &self.shared;
        let id = SessionId(shared.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        let ledger = ProcessLedger::new();
        {
            let mut inner = shared.lock();
            inner.state = SessionState::Preparing;
            inner.active = Some(Active {
                session: Session {
                    id,
                    request: request.clone(),
                    started_at: Local::now(),
                    state: SessionState::Preparing,
                    processes: ledger.clone(),
                },
                cancel: cancel.clone(),
                highlighter: None,
                worker: None,
            });
        }
        tracing::info!(session = %id, voice = %request.voice().display_name, rate = request.rate_wpm(), "session started");
        shared.listener.on_state_changed(id, SessionState::Preparing);

        let prepared = match shared.prepare(&request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                shared.finish(id, Err(&e));
                return Err(e);
            }
        };

        let strategy = match &prepared {
            Prepared::PreRendered(_) => Strategy::PreRendered,
            Prepared::Synthesize(plan) => shared.pipeline.initial_strategy(plan),
        };
        let highlighter = WordHighlighter::start(
            id,
            request.text(),
            request.rate_wpm(),
            shared.initial_latency(strategy),
            shared.listener.clone(),
        );
        {
            let mut inner = shared.lock();
            match inner.active.as_mut() {
                Some(active) if active.session.id == id => active.highlighter = Some(highlighter),
                // Already gone; dropping stops it
                _ => drop(highlighter),
            }
        }

        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            let on_playing = {
                let shared = worker_shared.clone();
                move || shared.transition(id, SessionState::Playing)
            };
            let mut procs = ProcessSet::new(ledger);
            let outcome = match &prepared {
                Prepared::PreRendered(audio) => {
                    worker_shared
                        .pipeline
                        .play_prerendered(audio, request.rate_wpm(), &mut procs, &cancel, &on_playing)
                        .await
                }
                Prepared::Synthesize(plan) => {
                    worker_shared
                        .synthesize_and_play(plan, &mut procs, &cancel, &on_playing)
                        .await
                }
            };
            // Runs on success, error and cancel alike
            procs.shutdown(worker_shared.pipeline.grace()).await;
            drop(prepared);
            worker_shared.finish(id, outcome.as_ref().copied());
        });

        let mut inner = shared.lock();
        if let Some(active) = inner.active.as_mut().filter(|a| a.session.id == id) {
            active.worker = Some(worker);
        }
        Ok(id)
    }

    /// Cancels the active session within `stop_timeout`. No-op when idle.
    pub async fn stop(&self) {
        let _turn = self.turn.lock().await;
        self.shared.stop_active().await;
    }

    /// Feeds the pre-render cache and warms up the selected neural voice.
    pub fn on_text_or_voice_changed(&self, text: &str, voice_id: &str) {
        self.shared.cache.on_text_or_voice_changed(text, voice_id);
        self.shared.cache.warm_up(voice_id);
    }

    /// Stops playback and drops the pre-render slot along with its file.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.shared.cache.clear();
        tracing::info!("speech controller shut down");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn initial_latency(&self, strategy: Strategy) -> Duration {
        let ms = match strategy {
            Strategy::Streaming => self.settings.streaming_latency_ms,
            Strategy::FileBased => self.settings.file_latency_ms,
            Strategy::PreRendered => self.settings.prerendered_latency_ms,
        };
        Duration::from_millis(ms)
    }

    /// Cache hit, or a synthesis plan with a resolved executable.
    async fn prepare(&self, request: &PlaybackRequest) -> Result<Prepared> {
        let voice = request.voice();
        if let Some(audio) = self.cache.lookup(request.text(), &voice.id) {
            tracing::debug!(voice = %voice.id, "pre-render hit");
            return Ok(Prepared::PreRendered(audio));
        }

        let backend = self
            .registry
            .backend(voice.backend)
            .ok_or(SpeechError::BackendUnavailable(voice.backend))?;
        let locator = backend.locator();
        let executable = tokio::task::spawn_blocking(move || locator.resolve())
            .await
            .ok()
            .flatten()
            .ok_or(SpeechError::BackendUnavailable(voice.backend))?;

        Ok(Prepared::Synthesize(SynthesisPlan {
            backend,
            executable,
            voice: voice.clone(),
            text: request.text().to_string(),
            rate_wpm: request.rate_wpm(),
        }))
    }

    /// Runs `plan` through the pipeline. A system voice whose engine fails
    /// is retried once on the fallback engine, when one is installed.
    async fn synthesize_and_play(
        &self,
        plan: &SynthesisPlan,
        procs: &mut ProcessSet,
        cancel: &CancellationToken,
        on_playing: &(dyn Fn() + Send + Sync),
    ) -> Result<Strategy> {
        let first = self.pipeline.run(plan, procs, cancel, on_playing).await;
        let engine_failed = matches!(
            &first,
            Err(SpeechError::SynthesisFailure(_) | SpeechError::ProcessSpawnFailure { .. })
        );
        if !engine_failed || cancel.is_cancelled() {
            return first;
        }

        let registry = self.registry.clone();
        let failed = plan.backend.kind();
        let fallback = tokio::task::spawn_blocking(move || registry.resolve_fallback(failed))
            .await
            .ok()
            .flatten();
        let Some((backend, executable, voice)) = fallback else {
            return first;
        };
        if let Err(e) = &first {
            tracing::warn!(backend = %failed, fallback = %backend.kind(), voice = %voice.id, error = %e, "synthesis failed, retrying on the fallback engine");
        }

        procs.shutdown(self.pipeline.grace()).await;
        let retry = SynthesisPlan {
            backend,
            executable,
            voice,
            text: plan.text.clone(),
            rate_wpm: plan.rate_wpm,
        };
        self.pipeline.run(&retry, procs, cancel, on_playing).await
    }

    /// Moves the session forward if it is still the active one.
    fn transition(&self, id: SessionId, next: SessionState) {
        {
            let mut inner = self.lock();
            let is_current = inner.active.as_ref().is_some_and(|a| a.session.id == id);
            if !is_current || !inner.state.can_transition_to(next) {
                return;
            }
            inner.state = next;
        }
        tracing::debug!(session = %id, state = ?next, "session state");
        self.listener.on_state_changed(id, next);
    }

    /// Worker exit. Reports only for the session that is still active; a
    /// superseded or stopped session ends silently.
    fn finish(&self, id: SessionId, outcome: std::result::Result<Strategy, &SpeechError>) {
        let active = {
            let mut inner = self.lock();
            if !inner.active.as_ref().is_some_and(|a| a.session.id == id) {
                return;
            }
            inner.state = SessionState::Idle;
            inner.active.take()
        };
        let Some(mut active) = active else {
            return;
        };
        if let Some(mut highlighter) = active.highlighter.take() {
            highlighter.stop();
        }
        let elapsed = Local::now() - active.session.started_at;

        match outcome {
            Ok(strategy) => {
                tracing::info!(session = %id, ?strategy, elapsed_ms = elapsed.num_milliseconds(), "session finished");
                self.listener.on_finished(id);
            }
            Err(e) if e.is_cancelled() => {
                tracing::debug!(session = %id, "session cancelled");
            }
            Err(e) => {
                tracing::error!(session = %id, error = %e, "session failed");
                self.listener.on_error(id, e.kind(), &e.to_string());
            }
        }
        self.listener.on_state_changed(id, SessionState::Idle);
    }

    /// Cancel, then wait for the worker's own teardown up to `stop_timeout`;
    /// a worker that overruns is aborted, which kills its processes on drop.
    async fn stop_active(&self) {
        let active = {
            let mut inner = self.lock();
            let Some(active) = inner.active.take() else {
                return;
            };
            inner.state = SessionState::Stopping;
            active
        };
        let id = active.session.id;
        self.listener.on_state_changed(id, SessionState::Stopping);

        let Active {
            cancel,
            highlighter,
            worker,
            ..
        } = active;
        cancel.cancel();
        if let Some(mut highlighter) = highlighter {
            highlighter.stop();
        }

        if let Some(mut worker) = worker {
            let budget = self.settings.stop_timeout();
            if tokio::time::timeout(budget, &mut worker).await.is_err() {
                tracing::warn!(session = %id, ?budget, "session did not stop in time, aborting it");
                worker.abort();
            }
        }

        {
            let mut inner = self.lock();
            if inner.active.is_none() {
                inner.state = SessionState::Idle;
            }
        }
        tracing::info!(session = %id, "session stopped");
        self.listener.on_state_changed(id, SessionState::Idle);
    }
}
