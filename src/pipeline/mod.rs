//! Runs one utterance through external synthesis and playback processes.
//!
//! Streaming (synth stdout piped into a raw-PCM player) is tried first when
//! both the backend and a stream player allow it. Any failure other than
//! cancellation tears the attempt down and falls back to synthesizing a
//! temporary file and playing it.

pub mod file;
pub mod player;
pub mod process;
mod streaming;

use crate::backends::{SpeechBackend, VoiceDescriptor};
use crate::config_loader::Settings;
use crate::error::{Result, SpeechError};
use player::{playback_speed, PlayerCatalog};
use process::{ProcessLedger, ProcessSet};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

/// How a session's audio reached the speakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Strategy {
    Streaming,
    FileBased,
    PreRendered,
}

/// Everything needed to synthesize one utterance.
#[derive(Clone)]
pub struct SynthesisPlan {
    pub backend: Arc<dyn SpeechBackend>,
    pub executable: PathBuf,
    pub voice: VoiceDescriptor,
    pub text: String,
    pub rate_wpm: u32,
}

impl SynthesisPlan {
    /// Native-rate backends already spoke at the requested rate.
    pub fn playback_speed(&self) -> f64 {
        if self.backend.applies_rate_natively() {
            1.0
        } else {
            playback_speed(self.rate_wpm)
        }
    }
}

pub struct ProcessPipeline {
    players: PlayerCatalog,
    grace: Duration,
    synthesis_timeout: Duration,
}

impl ProcessPipeline {
    pub fn new(settings: &Settings) -> Self {
        Self::with_players(settings, PlayerCatalog::for_host(settings))
    }

    pub fn with_players(settings: &Settings, players: PlayerCatalog) -> Self {
        Self {
            players,
            grace: settings.cancel_grace(),
            synthesis_timeout: settings.synthesis_timeout(),
        }
    }

    pub fn players(&self) -> &PlayerCatalog {
        &self.players
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// The strategy `run` starts with. It may still end up file-based.
    pub fn initial_strategy(&self, plan: &SynthesisPlan) -> Strategy {
        if plan.backend.supports_streaming() && self.players.supports_streaming() {
            Strategy::Streaming
        } else {
            Strategy::FileBased
        }
    }

    /// Synthesizes and plays `plan`, returning the strategy that produced
    /// audio. Every spawned process is adopted by `procs`; the caller tears
    /// them down. `on_playing` fires each time a player starts.
    pub async fn run(
        &self,
        plan: &SynthesisPlan,
        procs: &mut ProcessSet,
        cancel: &CancellationToken,
        on_playing: &(dyn Fn() + Send + Sync),
    ) -> Result<Strategy> {
        if self.initial_strategy(plan) == Strategy::Streaming {
            match streaming::run(plan, &self.players, procs, cancel, on_playing, self.synthesis_timeout).await {
                Ok(()) => return Ok(Strategy::Streaming),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, voice = %plan.voice.id, "streaming failed, falling back to file synthesis");
                    procs.shutdown(self.grace).await;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(SpeechError::Cancelled);
        }
        // Removed from disk when `audio` drops, on every exit path
        let audio = temp_audio_path(plan.backend.output_extension())?;
        file::synthesize(plan, &audio, procs, cancel, self.synthesis_timeout).await?;
        file::play(&audio, plan.playback_speed(), &self.players, procs, cancel, on_playing).await?;
        Ok(Strategy::FileBased)
    }

    /// Plays a finished pre-rendered file at the speed `rate_wpm` asks for.
    pub async fn play_prerendered(
        &self,
        audio: &Path,
        rate_wpm: u32,
        procs: &mut ProcessSet,
        cancel: &CancellationToken,
        on_playing: &(dyn Fn() + Send + Sync),
    ) -> Result<Strategy> {
        file::play(audio, playback_speed(rate_wpm), &self.players, procs, cancel, on_playing).await?;
        Ok(Strategy::PreRendered)
    }

    /// Renders `plan` into a new temporary file without playing it. The file
    /// is deleted when the returned path is dropped.
    pub async fn render_to_file(
        &self,
        plan: &SynthesisPlan,
        cancel: &CancellationToken,
        limit: Duration,
    ) -> Result<TempPath> {
        let audio = temp_audio_path(plan.backend.output_extension())?;
        let mut procs = ProcessSet::new(ProcessLedger::new());
        let rendered = file::synthesize(plan, &audio, &mut procs, cancel, limit).await;
        procs.shutdown(self.grace).await;
        rendered.map(|()| audio)
    }

    /// Runs the backend's warm-up command once and waits for it, so the
    /// model is resident before the first real utterance.
    pub async fn warm_up(
        &self,
        backend: &dyn SpeechBackend,
        executable: &Path,
        voice: &VoiceDescriptor,
        limit: Duration,
    ) -> Result<()> {
        let Some(inv) = backend.warmup_invocation(executable, voice) else {
            return Ok(());
        };
        let child = inv
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SpeechError::spawn(inv.name(), e))?;
        let mut procs = ProcessSet::new(ProcessLedger::new());
        let index = procs.adopt(format!("{} warm-up", inv.name()), child);

        let outcome = async {
            let process = procs.get_mut(index);
            if let Err(e) = process.feed_input(" ").await {
                tracing::debug!(error = %e, "warm-up stdin closed early");
            }
            match tokio::time::timeout(limit, process.wait()).await {
                Err(_) => Err(SpeechError::timeout("voice warm-up", limit)),
                Ok(Err(e)) => Err(SpeechError::SynthesisFailure(format!("warm-up wait: {}", e))),
                Ok(Ok(status)) if status.success() => Ok(()),
                Ok(Ok(status)) => {
                    let stderr = process.stderr_text().await;
                    Err(SpeechError::SynthesisFailure(streaming::failure_text(
                        &inv.name(),
                        status,
                        stderr,
                    )))
                }
            }
        }
        .await;
        procs.shutdown(self.grace).await;
        outcome
    }
}

fn temp_audio_path(extension: &str) -> Result<TempPath> {
    tempfile::Builder::new()
        .prefix("readanything-")
        .suffix(&format!(".{}", extension))
        .tempfile()
        .map(|f| f.into_temp_path())
        .map_err(|e| SpeechError::SynthesisFailure(format!("cannot create temporary audio file: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::piper::PiperBackend;
    use crate::backends::BackendKind;

    fn neural_plan(rate_wpm: u32) -> SynthesisPlan {
        SynthesisPlan {
            backend: Arc::new(PiperBackend::with_voice_dirs(None, vec![])),
            executable: PathBuf::from("/nonexistent/piper"),
            voice: VoiceDescriptor {
                id: "/v/a.onnx".into(),
                backend: BackendKind::Neural,
                display_name: "Piper: a".into(),
                model_path: Some(PathBuf::from("/v/a.onnx")),
            },
            text: "hello".into(),
            rate_wpm,
        }
    }

    #[test]
    fn neural_speed_follows_rate() {
        assert_eq!(neural_plan(300).playback_speed(), 2.0);
    }

    #[test]
    fn streaming_needs_a_stream_player() {
        let settings = Settings::default();
        let plan = neural_plan(150);

        let without = ProcessPipeline::with_players(&settings, PlayerCatalog::default());
        assert_eq!(without.initial_strategy(&plan), Strategy::FileBased);

        let with = ProcessPipeline::with_players(
            &settings,
            PlayerCatalog {
                file_players: vec![],
                stream_players: vec![player::PlayerSpec::new(player::PlayerKind::Aplay, "aplay")],
            },
        );
        let expected = if cfg!(unix) {
            Strategy::Streaming
        } else {
            Strategy::FileBased
        };
        assert_eq!(with.initial_strategy(&plan), expected);
    }

    #[test]
    fn temp_audio_paths_are_cleaned_up() {
        let path = temp_audio_path("wav").unwrap();
        let kept = path.to_path_buf();
        assert!(kept.exists());
        assert_eq!(kept.extension().and_then(|e| e.to_str()), Some("wav"));
        drop(path);
        assert!(!kept.exists());
    }

    #[tokio::test]
    async fn missing_synthesizer_is_a_spawn_failure() {
        let pipeline = ProcessPipeline::with_players(&Settings::default(), PlayerCatalog::default());
        let mut procs = ProcessSet::new(ProcessLedger::new());
        let err = pipeline
            .run(&neural_plan(150), &mut procs, &CancellationToken::new(), &|| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProcessSpawnFailure);
    }
}
