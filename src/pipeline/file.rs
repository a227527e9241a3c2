//! Synthesize to a complete audio file, then hand the file to a player.

use super::process::ProcessSet;
use super::streaming::failure_text;
use super::SynthesisPlan;
use crate::candidates::spawn_first;
use crate::error::{Result, SpeechError};
use crate::pipeline::player::PlayerCatalog;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Runs the backend's file synthesis into `output` and checks the result.
pub(super) async fn synthesize(
    plan: &SynthesisPlan,
    output: &Path,
    procs: &mut ProcessSet,
    cancel: &CancellationToken,
    limit: Duration,
) -> Result<()> {
    let inv = plan
        .backend
        .file_invocation(&plan.executable, &plan.voice, plan.rate_wpm, output);
    let child = inv
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SpeechError::spawn(inv.name(), e))?;
    let synth = procs.adopt(inv.name(), child);

    // One deadline covers both: a synth that never drains stdin stalls the write
    let deadline = Instant::now() + limit;
    let timed_out = || SpeechError::timeout(format!("{} synthesis", inv.name()), limit);

    tokio::select! {
        _ = cancel.cancelled() => return Err(SpeechError::Cancelled),
        fed = timeout_at(deadline, procs.get_mut(synth).feed_input(&plan.text)) => match fed {
            Err(_) => return Err(timed_out()),
            Ok(Err(e)) => tracing::debug!(error = %e, "synthesis stdin closed early"),
            Ok(Ok(())) => {}
        },
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => return Err(SpeechError::Cancelled),
        waited = timeout_at(deadline, procs.get_mut(synth).wait()) => match waited {
            Err(_) => return Err(timed_out()),
            Ok(status) => status
                .map_err(|e| SpeechError::SynthesisFailure(format!("waiting for synthesis: {}", e)))?,
        },
    };
    if !status.success() {
        let stderr = procs.get_mut(synth).stderr_text().await;
        return Err(SpeechError::SynthesisFailure(failure_text(&inv.name(), status, stderr)));
    }

    verify_audio_file(output)
}

/// The file must exist and be non-empty; WAV files must also parse.
pub fn verify_audio_file(path: &Path) -> Result<()> {
    let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Err(SpeechError::SynthesisFailure(format!(
            "no audio was written to {}",
            path.display()
        )));
    }

    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if is_wav {
        let reader = hound::WavReader::open(path)
            .map_err(|e| SpeechError::SynthesisFailure(format!("unreadable WAV output: {}", e)))?;
        let spec = reader.spec();
        let seconds = reader.duration() as f64 / spec.sample_rate.max(1) as f64;
        tracing::debug!(
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            seconds = %format!("{:.2}", seconds),
            "synthesized audio"
        );
    }
    Ok(())
}

/// Plays `audio` with the first player that spawns and waits for it to finish.
pub(super) async fn play(
    audio: &Path,
    speed: f64,
    players: &PlayerCatalog,
    procs: &mut ProcessSet,
    cancel: &CancellationToken,
    on_playing: &(dyn Fn() + Send + Sync),
) -> Result<()> {
    let candidates = players.file_invocations(audio, speed);
    let (child, chosen) = spawn_first(&candidates, |cmd| {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        Ok(())
    })
    .map_err(|attempts| SpeechError::PlaybackDeviceUnavailable(attempts.to_string()))?;
    let player = procs.adopt(chosen.name(), child);
    tracing::debug!(player = %chosen.name(), speed, file = %audio.display(), "playing file");
    if (speed - 1.0).abs() > f64::EPSILON && !players.honours_speed(&chosen.program) {
        tracing::warn!(player = %chosen.name(), speed, "player ignores the speed, highlighting will drift from the audio");
    }
    on_playing();

    let status = tokio::select! {
        _ = cancel.cancelled() => return Err(SpeechError::Cancelled),
        status = procs.get_mut(player).wait() => status
            .map_err(|e| SpeechError::PlaybackDeviceUnavailable(format!("waiting for player: {}", e)))?,
    };
    if !status.success() {
        let stderr = procs.get_mut(player).stderr_text().await;
        return Err(SpeechError::PlaybackDeviceUnavailable(failure_text(
            &chosen.name(),
            status,
            stderr,
        )));
    }
    Ok(())
}
