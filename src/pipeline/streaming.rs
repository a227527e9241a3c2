//! Synthesis stdout piped straight into a raw-PCM player.

use super::process::ProcessSet;
use super::SynthesisPlan;
#[cfg(unix)]
use crate::candidates::spawn_first;
use crate::error::{Result, SpeechError};
use crate::pipeline::player::PlayerCatalog;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
pub(super) async fn run(
    plan: &SynthesisPlan,
    players: &PlayerCatalog,
    procs: &mut ProcessSet,
    cancel: &CancellationToken,
    on_playing: &(dyn Fn() + Send + Sync),
    feed_limit: Duration,
) -> Result<()> {
    use std::process::Stdio;

    let synth_inv = plan
        .backend
        .stream_invocation(&plan.executable, &plan.voice)
        .ok_or_else(|| SpeechError::SynthesisFailure(format!("{} cannot stream", plan.backend.kind())))?;
    let sample_rate = plan.backend.stream_sample_rate(&plan.voice);
    let player_invs = players.stream_invocations(sample_rate);
    if player_invs.is_empty() {
        return Err(SpeechError::PlaybackDeviceUnavailable(
            "no raw PCM player configured".to_string(),
        ));
    }

    let mut synth_child = synth_inv
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SpeechError::spawn(synth_inv.name(), e))?;
    let pcm = synth_child.stdout.take();
    let synth = procs.adopt(synth_inv.name(), synth_child);

    let pcm = pcm
        .ok_or_else(|| SpeechError::SynthesisFailure("synthesis stdout was not captured".to_string()))?;
    let pcm = blocking_fd(pcm)
        .map_err(|e| SpeechError::SynthesisFailure(format!("cannot hand off PCM pipe: {}", e)))?;

    // Each candidate gets its own duplicate of the read end
    let spawned = spawn_first(&player_invs, |cmd| {
        cmd.stdin(Stdio::from(pcm.try_clone()?))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        Ok(())
    });
    // The player holds the read end now; ours must go or EOF never arrives
    drop(pcm);
    let (player_child, chosen) =
        spawned.map_err(|attempts| SpeechError::PlaybackDeviceUnavailable(attempts.to_string()))?;
    let player = procs.adopt(chosen.name(), player_child);
    tracing::debug!(synth = %synth_inv.name(), player = %chosen.name(), sample_rate, "streaming");
    on_playing();

    // Playback paces the synth, so only the hand-over of the text is bounded
    tokio::select! {
        _ = cancel.cancelled() => return Err(SpeechError::Cancelled),
        fed = tokio::time::timeout(feed_limit, procs.get_mut(synth).feed_input(&plan.text)) => match fed {
            Err(_) => return Err(SpeechError::timeout(format!("{} input", synth_inv.name()), feed_limit)),
            // Exit status below says why the synth stopped reading
            Ok(Err(e)) => tracing::debug!(error = %e, "synthesis stdin closed early"),
            Ok(Ok(())) => {}
        },
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => return Err(SpeechError::Cancelled),
        status = procs.get_mut(synth).wait() => status
            .map_err(|e| SpeechError::SynthesisFailure(format!("waiting for synthesis: {}", e)))?,
    };
    if !status.success() {
        let stderr = procs.get_mut(synth).stderr_text().await;
        return Err(SpeechError::SynthesisFailure(failure_text(&synth_inv.name(), status, stderr)));
    }

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

#[cfg(not(unix))]
pub(super) async fn run(
    _plan: &SynthesisPlan,
    _players: &PlayerCatalog,
    _procs: &mut ProcessSet,
    _cancel: &CancellationToken,
    _on_playing: &(dyn Fn() + Send + Sync),
    _feed_limit: Duration,
) -> Result<()> {
    Err(SpeechError::PlaybackDeviceUnavailable(
        "raw PCM streaming needs a Unix pipe".to_string(),
    ))
}

/// Detaches the pipe from the runtime and clears O_NONBLOCK; the player reads
/// it with plain blocking reads.
#[cfg(unix)]
fn blocking_fd(pipe: tokio::process::ChildStdout) -> std::io::Result<std::os::fd::OwnedFd> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use std::os::fd::AsRawFd;

    let fd = pipe.into_owned_fd()?;
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    Ok(fd)
}

pub(super) fn failure_text(
    program: &str,
    status: std::process::ExitStatus,
    stderr: String,
) -> String {
    if stderr.is_empty() {
        format!("{} exited with {}", program, status)
    } else {
        stderr
    }
}
