//! Single-slot pre-render cache.
//!
//! While the user is still typing, the current text is synthesized in the
//! background so that pressing play only has to start a player. Every text or
//! voice change invalidates the slot and deletes its file; a new render
//! starts after a quiet period. A render that finishes after the input moved
//! on is thrown away.

use crate::backends::VoiceDescriptor;
use crate::config_loader::Settings;
use crate::events::SpeechListener;
use crate::pipeline::player::BASELINE_WPM;
use crate::pipeline::{ProcessPipeline, SynthesisPlan};
use crate::registry::BackendRegistry;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntryState {
    /// Synthesis is running
    Pending,
    /// Audio file on disk, matching the input it was rendered for
    Ready,
    /// Superseded by newer input; no file
    Stale,
    /// Synthesis failed; no file
    Failed,
}

pub fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// The slot's content. The audio file exists exactly while `state` is `Ready`.
#[derive(Debug)]
pub struct PreRenderEntry {
    pub text_hash: u64,
    pub voice_id: String,
    pub state: EntryState,
    generation: u64,
    text: String,
    // Shared with a session that is playing it; deleted when the last holder drops
    audio: Option<Arc<TempPath>>,
}

impl PreRenderEntry {
    pub fn audio_path(&self) -> Option<&Path> {
        self.audio.as_ref().map(|p| Path::new(p.as_os_str()))
    }

    fn invalidate(&mut self, state: EntryState) {
        self.state = state;
        self.audio = None;
    }
}

/// Snapshot of the slot for callers outside the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreRenderStatus {
    pub state: EntryState,
    pub voice_id: String,
    pub text_hash: u64,
    pub audio_path: Option<PathBuf>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    /// Trimmed text and voice the user currently has selected
    current: Option<(String, String)>,
    entry: Option<PreRenderEntry>,
    in_flight: Option<CancellationToken>,
}

struct Shared {
    settings: Arc<Settings>,
    registry: Arc<BackendRegistry>,
    pipeline: Arc<ProcessPipeline>,
    listener: Arc<dyn SpeechListener>,
    slot: Mutex<Slot>,
    warmed: Mutex<HashSet<String>>,
}

/// Cheap to clone; clones share one slot.
#[derive(Clone)]
pub struct PreRenderCache {
    shared: Arc<Shared>,
}

impl PreRenderCache {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<BackendRegistry>,
        pipeline: Arc<ProcessPipeline>,
        listener: Arc<dyn SpeechListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                registry,
                pipeline,
                listener,
                slot: Mutex::new(Slot::default()),
                warmed: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Invalidates the slot (deleting its file) and schedules a render of
    /// `text` after the debounce period. Must be called within a Tokio runtime.
    pub fn on_text_or_voice_changed(&self, text: &str, voice_id: &str) {
        let text = text.trim().to_string();
        let voice_id = voice_id.to_string();
        let settings = &self.shared.settings;

        let (generation, token) = {
            let mut slot = self.shared.lock_slot();
            slot.generation += 1;
            slot.current = Some((text.clone(), voice_id.clone()));
            if let Some(previous) = slot.in_flight.take() {
                previous.cancel();
            }
            if let Some(entry) = slot.entry.as_mut() {
                entry.invalidate(EntryState::Stale);
            }

            if !settings.prerender_enabled
                || text.is_empty()
                || text.chars().count() > settings.prerender_max_chars
            {
                return;
            }
            let token = CancellationToken::new();
            slot.in_flight = Some(token.clone());
            (slot.generation, token)
        };

        let shared = self.shared.clone();
        let debounce = settings.prerender_debounce();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            shared.render(generation, text, voice_id, token).await;
        });
    }

    /// The rendered file for exactly this text and voice, if it is ready.
    pub fn lookup(&self, text: &str, voice_id: &str) -> Option<Arc<TempPath>> {
        let text = text.trim();
        let slot = self.shared.lock_slot();
        let entry = slot.entry.as_ref()?;
        if entry.state != EntryState::Ready
            || entry.voice_id != voice_id
            || entry.text_hash != text_hash(text)
            || entry.text != text
        {
            return None;
        }
        let audio = entry.audio.clone()?;
        audio.exists().then_some(audio)
    }

    pub fn status(&self) -> Option<PreRenderStatus> {
        let slot = self.shared.lock_slot();
        slot.entry.as_ref().map(|e| PreRenderStatus {
            state: e.state,
            voice_id: e.voice_id.clone(),
            text_hash: e.text_hash,
            audio_path: e.audio_path().map(Path::to_path_buf),
        })
    }

    /// Drops the slot, cancels any render in flight and forgets the input.
    pub fn clear(&self) {
        let mut slot = self.shared.lock_slot();
        slot.generation += 1;
        slot.current = None;
        if let Some(token) = slot.in_flight.take() {
            token.cancel();
        }
        slot.entry = None;
    }

    /// Loads a neural model into the OS cache in the background, once per
    /// model. A failed warm-up may be retried later.
    pub fn warm_up(&self, voice_id: &str) {
        let shared = self.shared.clone();
        let voice_id = voice_id.to_string();
        tokio::spawn(async move {
            let Some((voice, plan_parts)) = shared.resolve(&voice_id).await else {
                return;
            };
            let (backend, executable) = plan_parts;
            if backend.warmup_invocation(&executable, &voice).is_none() {
                return;
            }
            if !shared.lock_warmed().insert(voice_id.clone()) {
                return;
            }

            let started = std::time::Instant::now();
            let limit = shared.settings.warmup_timeout();
            match shared.pipeline.warm_up(backend.as_ref(), &executable, &voice, limit).await {
                Ok(()) => tracing::info!(voice = %voice.display_name, elapsed = ?started.elapsed(), "voice warmed up"),
                Err(e) => {
                    tracing::warn!(voice = %voice.display_name, error = %e, "voice warm-up failed");
                    shared.lock_warmed().remove(&voice_id);
                }
            }
        });
    }
}

type ResolvedBackend = (Arc<dyn crate::backends::SpeechBackend>, PathBuf);

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_warmed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.warmed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Voice, backend and executable; enumeration may run probe commands, so
    /// it happens off the async workers.
    async fn resolve(&self, voice_id: &str) -> Option<(VoiceDescriptor, ResolvedBackend)> {
        let registry = self.registry.clone();
        let id = voice_id.to_string();
        let resolved = tokio::task::spawn_blocking(move || {
            let voice = registry.resolve(&id)?;
            let backend = registry.backend(voice.backend)?;
            let executable = backend.locator().resolve()?;
            Some((voice, (backend, executable)))
        })
        .await
        .ok()
        .flatten();
        if resolved.is_none() {
            tracing::debug!(voice = voice_id, "voice or executable not found, skipping");
        }
        resolved
    }

    async fn render(&self, generation: u64, text: String, voice_id: String, token: CancellationToken) {
        let Some((voice, (backend, executable))) = self.resolve(&voice_id).await else {
            return;
        };
        if !backend.supports_prerender() {
            tracing::debug!(backend = %backend.kind(), "backend applies the rate itself, not pre-rendering");
            return;
        }

        {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                return;
            }
            slot.entry = Some(PreRenderEntry {
                text_hash: text_hash(&text),
                voice_id: voice_id.clone(),
                state: EntryState::Pending,
                generation,
                text: text.clone(),
                audio: None,
            });
        }

        let chars = text.chars().count();
        let plan = SynthesisPlan {
            backend,
            executable,
            voice,
            text,
            rate_wpm: BASELINE_WPM as u32,
        };
        let started = std::time::Instant::now();
        let rendered = self
            .pipeline
            .render_to_file(&plan, &token, self.settings.synthesis_timeout())
            .await;

        let mut slot = self.lock_slot();
        // Re-check under the lock; the input may have moved on while rendering
        let fresh = slot.generation == generation
            && slot.current.as_ref() == Some(&(plan.text.clone(), voice_id.clone()));
        let ours = slot.entry.as_mut().filter(|e| e.generation == generation);

        match rendered {
            Ok(audio) if fresh => {
                if let Some(entry) = ours {
                    entry.state = EntryState::Ready;
                    entry.audio = Some(Arc::new(audio));
                }
                slot.in_flight = None;
                drop(slot);
                tracing::info!(voice = %voice_id, chars, elapsed = ?started.elapsed(), "pre-render ready");
                self.listener.on_prerender_ready(&voice_id);
            }
            Ok(_stale_audio) => {
                // dropping the path deletes the file
                if let Some(entry) = ours {
                    entry.invalidate(EntryState::Stale);
                }
                tracing::debug!(voice = %voice_id, "discarding stale pre-render");
            }
            Err(e) if e.is_cancelled() => {
                tracing::debug!(voice = %voice_id, "pre-render cancelled");
            }
            Err(e) => {
                if let Some(entry) = ours {
                    entry.invalidate(EntryState::Failed);
                }
                tracing::warn!(voice = %voice_id, error = %e, "pre-render failed");
            }
        }
    }
}
