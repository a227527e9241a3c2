use super::{BackendKind, CommandProbe, SpeechBackend, VoiceDescriptor};
use crate::candidates::Invocation;
use crate::registry::{self, ExecutableLocator};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_VOICE_TIMEOUT: Duration = Duration::from_secs(2);

lazy_static! {
    // "Bad News            en_US    # The light you see..."
    static ref SAY_LINE: Regex =
        Regex::new(r"^(?P<name>\S.*?)\s+(?P<locale>[a-z]{2,3}_[A-Za-z0-9]{2,4})\s+#").unwrap();
}

pub struct SayBackend {
    probe: Arc<dyn CommandProbe>,
    probe_timeout: Duration,
    language: String,
}

impl SayBackend {
    pub fn new(probe: Arc<dyn CommandProbe>, probe_timeout: Duration, language: &str) -> Self {
        Self {
            probe,
            probe_timeout,
            language: language.to_string(),
        }
    }

    fn system_default_voice(&self) -> Option<String> {
        let args: Vec<String> = ["read", "com.apple.speech.voice.prefs", "SelectedVoiceName"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = self
            .probe
            .stdout_of(Path::new("defaults"), &args, DEFAULT_VOICE_TIMEOUT)?;
        let name = out.trim().trim_matches('"').to_string();
        (!name.is_empty()).then_some(name)
    }
}

impl SpeechBackend for SayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemSay
    }

    fn list_voices(&self) -> Vec<VoiceDescriptor> {
        let Some(exe) = self.locator().resolve() else {
            return Vec::new();
        };
        let Some(listing) = self
            .probe
            .stdout_of(&exe, &["-v".to_string(), "?".to_string()], self.probe_timeout)
        else {
            return Vec::new();
        };
        let default_voice = self.system_default_voice();
        parse_voice_listing(&listing, &self.language, default_voice.as_deref())
    }

    fn locator(&self) -> ExecutableLocator {
        ExecutableLocator {
            configured: None,
            env_var: None,
            well_known: vec![PathBuf::from("/usr/bin/say")],
            path_names: vec!["say"],
        }
    }

    fn applies_rate_natively(&self) -> bool {
        true
    }

    fn output_extension(&self) -> &'static str {
        "aiff"
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
            .arg("-r")
            .arg(rate_wpm.to_string())
            .arg("-o")
            .arg(output)
            .args(["-f", "-"])
    }
}

/// Filters and orders `say -v ?` output: the system default first, then the
/// curated natural voices, then everything else the policy accepts, by name.
pub fn parse_voice_listing(
    listing: &str,
    language: &str,
    default_voice: Option<&str>,
) -> Vec<VoiceDescriptor> {
    let mut items: Vec<(bool, bool, String)> = Vec::new();

    for line in listing.lines() {
        let Some(caps) = SAY_LINE.captures(line.trim_end()) else {
            continue;
        };
        let name = caps["name"].trim().to_string();
        if &caps["locale"] != language {
            continue;
        }
        if !registry::accept_system_voice(&name) {
            continue;
        }
        if items.iter().any(|(_, _, n)| *n == name) {
            continue;
        }
        let is_default = default_voice == Some(name.as_str());
        let is_curated = registry::is_curated_voice(&name);
        items.push((is_default, is_curated, name));
    }

    items.sort_by(|a, b| (!a.0, !a.1, &a.2).cmp(&(!b.0, !b.1, &b.2)));

    items
        .into_iter()
        .map(|(is_default, _, name)| VoiceDescriptor {
            display_name: if is_default {
                format!("{} (System Default)", name)
            } else {
                name.clone()
            },
            id: name,
            backend: BackendKind::SystemSay,
            model_path: None,
        })
        .collect()
}
