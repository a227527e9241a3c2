pub mod espeak;
pub mod piper;
pub mod say;

use crate::candidates::Invocation;
use crate::registry::ExecutableLocator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Sample rate used for raw PCM when a model declares none.
pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;

/// Family of synthesis technology behind a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// macOS `say`
    SystemSay,
    /// eSpeak NG, the engine behind the Linux system voices
    SystemEngine,
    /// Piper neural voices (ONNX model + JSON sidecar)
    Neural,
}

impl BackendKind {
    pub fn is_system(self) -> bool {
        !matches!(self, BackendKind::Neural)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::SystemSay => "say",
            BackendKind::SystemEngine => "espeak-ng",
            BackendKind::Neural => "piper",
        };
        f.write_str(label)
    }
}

/// Represents a text-to-speech voice.
///
/// `id` is both the UI key and the literal value handed to the backend:
/// a voice name for the system backends, a model path for neural voices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceDescriptor {
    pub id: String,
    pub backend: BackendKind,
    pub display_name: String,
    pub model_path: Option<PathBuf>,
}

/// Trait that all speech synthesis backends must implement.
///
/// Backends only describe processes; the pipeline spawns and supervises them.
/// Text is always delivered on the synthesis process's stdin.
pub trait SpeechBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Installed voices in discovery order. Never fails: a missing tool
    /// simply yields no voices.
    fn list_voices(&self) -> Vec<VoiceDescriptor>;

    /// Where to look for this backend's executable.
    fn locator(&self) -> ExecutableLocator;

    /// True when the synthesis process takes the WPM rate itself, so its
    /// output must be played back at 1.0x.
    fn applies_rate_natively(&self) -> bool;

    /// Raw PCM on stdout is supported.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Output is rate-independent, so it can be rendered ahead of time and
    /// keyed by (text, voice) only.
    fn supports_prerender(&self) -> bool {
        !self.applies_rate_natively()
    }

    fn output_extension(&self) -> &'static str {
        "wav"
    }

    /// Synthesis process writing raw S16_LE mono PCM to stdout.
    fn stream_invocation(&self, _exe: &Path, _voice: &VoiceDescriptor) -> Option<Invocation> {
        None
    }

    fn stream_sample_rate(&self, _voice: &VoiceDescriptor) -> u32 {
        DEFAULT_SAMPLE_RATE
    }

    /// Synthesis process writing a complete audio file to `output`.
    fn file_invocation(
        &self,
        exe: &Path,
        voice: &VoiceDescriptor,
        rate_wpm: u32,
        output: &Path,
    ) -> Invocation;

    /// A throwaway run that pulls the model into the page cache.
    fn warmup_invocation(&self, _exe: &Path, _voice: &VoiceDescriptor) -> Option<Invocation> {
        None
    }
}

/// Runs short-lived helper commands (voice listings, preference reads).
#[cfg_attr(test, mockall::automock)]
pub trait CommandProbe: Send + Sync {
    /// Stdout of the command, or `None` if it could not run, failed, or
    /// outlived `timeout`.
    fn stdout_of(&self, program: &Path, args: &[String], timeout: Duration) -> Option<String>;
}

/// `CommandProbe` backed by real processes with a hard timeout.
pub struct TimedProbe;

impl CommandProbe for TimedProbe {
    fn stdout_of(&self, program: &Path, args: &[String], timeout: Duration) -> Option<String> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;

        // Drain stdout on the side so a chatty listing cannot fill the pipe
        let mut stdout = child.stdout.take()?;
        let reader = std::thread::spawn(move || {
            let mut buf = String::new();
            stdout.read_to_string(&mut buf).map(|_| buf)
        });

        match child.wait_timeout(timeout) {
            Ok(Some(status)) if status.success() => reader.join().ok()?.ok(),
            Ok(Some(status)) => {
                tracing::debug!(program = %program.display(), %status, "probe exited with failure");
                None
            }
            Ok(None) => {
                // Timeout occurred, kill the process
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(program = %program.display(), ?timeout, "probe timed out");
                None
            }
            Err(e) => {
                tracing::debug!(program = %program.display(), error = %e, "probe wait failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_neural_is_not_system() {
        assert!(BackendKind::SystemSay.is_system());
        assert!(BackendKind::SystemEngine.is_system());
        assert!(!BackendKind::Neural.is_system());
    }

    #[test]
    #[cfg(unix)]
    fn timed_probe_captures_stdout() {
        let out = TimedProbe.stdout_of(
            Path::new("echo"),
            &["hello".to_string()],
            Duration::from_secs(5),
        );
        assert_eq!(out.as_deref(), Some("hello\n"));
    }

    #[test]
    #[cfg(unix)]
    fn timed_probe_gives_up_on_slow_commands() {
        let started = std::time::Instant::now();
        let out = TimedProbe.stdout_of(
            Path::new("sleep"),
            &["5".to_string()],
            Duration::from_millis(100),
        );
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn timed_probe_handles_missing_programs() {
        let out = TimedProbe.stdout_of(
            Path::new("/nonexistent/say"),
            &[],
            Duration::from_secs(1),
        );
        assert!(out.is_none());
    }
}
