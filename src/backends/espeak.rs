use super::{BackendKind, CommandProbe, SpeechBackend, VoiceDescriptor};
use crate::candidates::Invocation;
use crate::registry::{self, ExecutableLocator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// Lower pitch and near-full amplitude read more clearly than the defaults
const PITCH: &str = "40";
const AMPLITUDE: &str = "180";

pub struct EspeakBackend {
    probe: Arc<dyn CommandProbe>,
    probe_timeout: Duration,
}

impl EspeakBackend {
    pub fn new(probe: Arc<dyn CommandProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
        }
    }
}

impl SpeechBackend for EspeakBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemEngine
    }

    fn list_voices(&self) -> Vec<VoiceDescriptor> {
        let Some(exe) = self.locator().resolve() else {
            return Vec::new();
        };
        self.probe
            .stdout_of(&exe, &["--voices=en".to_string()], self.probe_timeout)
            .map(|listing| parse_voice_listing(&listing))
            .unwrap_or_default()
    }

    fn locator(&self) -> ExecutableLocator {
        ExecutableLocator {
            configured: None,
            env_var: None,
            well_known: vec![
                PathBuf::from("/usr/bin/espeak-ng"),
                PathBuf::from("/usr/local/bin/espeak-ng"),
                PathBuf::from("/opt/homebrew/bin/espeak-ng"),
            ],
            path_names: vec!["espeak-ng", "espeak"],
        }
    }

    fn applies_rate_natively(&self) -> bool {
        true
    }

    fn file_invocation(
        &self,
        exe: &Path,
        voice: &VoiceDescriptor,
        rate_wpm: u32,
        output: &Path,
    ) -> Invocation {
        Invocation::new(exe)
            .arg("-v")
            .arg(&voice.id)
            .arg("-s")
            .arg(rate_wpm.to_string())
            .args(["-p", PITCH, "-a", AMPLITUDE])
            .arg("-w")
            .arg(output)
            .arg("--stdin")
    }
}

/// Parses `espeak-ng --voices` output:
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File          Other Languages
///  5  en-us           --/M      English_(America)  gmw/en-US
/// ```
pub fn parse_voice_listing(listing: &str) -> Vec<VoiceDescriptor> {
    let mut voices: Vec<VoiceDescriptor> = Vec::new();
    for line in listing.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 5 {
            continue;
        }
        let (name, file) = (cols[3], cols[4]);
        let display_name = name.replace('_', " ");
        if !registry::passes_deny_list(&display_name) {
            continue;
        }
        if voices.iter().any(|v| v.id == file) {
            continue;
        }
        voices.push(VoiceDescriptor {
            id: file.to_string(),
            backend: BackendKind::SystemEngine,
            display_name,
            model_path: None,
        });
    }
    voices
}
