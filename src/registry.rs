//! Voice enumeration across backends and executable discovery.

use crate::backends::espeak::EspeakBackend;
use crate::backends::piper::PiperBackend;
use crate::backends::say::SayBackend;
use crate::backends::{BackendKind, CommandProbe, SpeechBackend, TimedProbe, VoiceDescriptor};
use crate::candidates::{first_executable, is_executable};
use crate::config_loader::Settings;
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

lazy_static! {
    /// Voices shipped with the OS that sound natural, plus common premium downloads.
    static ref CURATED_VOICES: HashSet<&'static str> = [
        "Alex", "Samantha", "Victoria", "Fred", "Kathy", "Ralph", "Tessa", "Princess",
        "Ava", "Nicky", "Siri", "Daniel", "Karen", "Moira", "Veena",
    ]
    .into_iter()
    .collect();

    /// Novelty and character voices.
    static ref DENIED_VOICES: HashSet<&'static str> = [
        "Albert", "Bad", "Bad News", "Bahh", "Bells", "Boing", "Bubbles", "Cellos",
        "Wobble", "Hysterical", "Trinoids", "Zarvox", "Junior", "Good", "Good News",
        "Jester", "Organ", "Superstar", "Whisper", "Eddy", "Flo", "Reed", "Rocko",
        "Sandy", "Shelley", "Grandma", "Grandpa",
    ]
    .into_iter()
    .collect();
}

pub fn is_curated_voice(name: &str) -> bool {
    CURATED_VOICES.contains(name)
}

pub fn passes_deny_list(name: &str) -> bool {
    !DENIED_VOICES.contains(name)
}

/// Best-effort guess that a voice name is a person's name: capitalised,
/// alphabetic (spaces allowed), no digits.
pub fn looks_natural(name: &str) -> bool {
    let compact: String = name.chars().filter(|c| *c != ' ').collect();
    name.chars().count() > 1
        && name.chars().next().is_some_and(char::is_uppercase)
        && !compact.is_empty()
        && compact.chars().all(char::is_alphabetic)
}

/// Allow/deny policy for system voices. The list of installable voices is
/// open-ended, so anything natural-looking that is not denied is accepted.
pub fn accept_system_voice(name: &str) -> bool {
    passes_deny_list(name) && (is_curated_voice(name) || looks_natural(name))
}

/// Ordered places to look for a backend executable.
#[derive(Debug, Clone, Default)]
pub struct ExecutableLocator {
    /// Explicit path from settings
    pub configured: Option<PathBuf>,
    /// Environment variable holding an override path
    pub env_var: Option<&'static str>,
    pub well_known: Vec<PathBuf>,
    /// Names looked up on `PATH`, in order
    pub path_names: Vec<&'static str>,
}

impl ExecutableLocator {
    /// Configured path, then environment override, then well-known install
    /// locations, then `PATH`. `None` when nothing usable exists.
    pub fn resolve(&self) -> Option<PathBuf> {
        if let Some(configured) = &self.configured {
            if is_executable(configured) {
                return Some(configured.clone());
            }
            tracing::warn!(path = %configured.display(), "configured executable is not usable, searching");
        }

        if let Some(var) = self.env_var {
            if let Ok(value) = std::env::var(var) {
                let path = PathBuf::from(value.trim());
                if is_executable(&path) {
                    return Some(path);
                }
                if !value.trim().is_empty() {
                    tracing::warn!(env = var, path = %path.display(), "override is not executable, ignoring");
                }
            }
        }

        if let Some(found) = first_executable(self.well_known.iter().cloned()) {
            return Some(found);
        }

        self.path_names.iter().find_map(|name| which::which(name).ok())
    }
}

/// Owns the backends and the last voice listing.
pub struct BackendRegistry {
    backends: Vec<Arc<dyn SpeechBackend>>,
    // Engines tried when a listed backend fails; their voices are not listed
    fallbacks: Vec<Arc<dyn SpeechBackend>>,
    // `None` until the first enumeration; an empty listing is still a listing
    voices: RwLock<Option<Vec<VoiceDescriptor>>>,
}

impl BackendRegistry {
    /// The backends available on this host: `say` on macOS, eSpeak NG
    /// elsewhere, Piper everywhere.
    pub fn new(settings: &Settings) -> Self {
        let probe: Arc<dyn CommandProbe> = Arc::new(TimedProbe);
        let mut backends: Vec<Arc<dyn SpeechBackend>> = Vec::new();
        let mut fallbacks: Vec<Arc<dyn SpeechBackend>> = Vec::new();
        if cfg!(target_os = "macos") {
            backends.push(Arc::new(SayBackend::new(
                probe.clone(),
                settings.probe_timeout(),
                &settings.system_voice_language,
            )));
            // Homebrew espeak-ng, used only when `say` fails
            fallbacks.push(Arc::new(EspeakBackend::new(probe, settings.probe_timeout())));
        } else {
            backends.push(Arc::new(EspeakBackend::new(probe, settings.probe_timeout())));
        }
        backends.push(Arc::new(PiperBackend::new(settings)));
        Self::with_backends(backends).with_fallbacks(fallbacks)
    }

    /// System backends should come before neural ones; listing order follows
    /// the order given here.
    pub fn with_backends(backends: Vec<Arc<dyn SpeechBackend>>) -> Self {
        Self {
            backends,
            fallbacks: Vec::new(),
            voices: RwLock::new(None),
        }
    }

    /// Adds unlisted engines that [`BackendRegistry::resolve_fallback`] may use.
    pub fn with_fallbacks(mut self, fallbacks: Vec<Arc<dyn SpeechBackend>>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Re-enumerates every backend: system voices first, then neural voices,
    /// each in discovery order.
    pub fn list_voices(&self) -> Vec<VoiceDescriptor> {
        let mut system = Vec::new();
        let mut neural = Vec::new();
        for backend in &self.backends {
            let found = backend.list_voices();
            tracing::debug!(backend = %backend.kind(), count = found.len(), "enumerated voices");
            if backend.kind().is_system() {
                system.extend(found);
            } else {
                neural.extend(found);
            }
        }
        system.extend(neural);

        if let Ok(mut cached) = self.voices.write() {
            *cached = Some(system.clone());
        }
        system
    }

    /// Last listing, enumerating on first use.
    pub fn voices(&self) -> Vec<VoiceDescriptor> {
        let cached = self.voices.read().ok().and_then(|v| v.clone());
        match cached {
            Some(voices) => voices,
            None => self.list_voices(),
        }
    }

    /// Finds a voice by id. A neural model path that was not part of the last
    /// listing is still accepted when its sidecar is present.
    pub fn resolve(&self, voice_id: &str) -> Option<VoiceDescriptor> {
        if let Some(found) = self.voices().into_iter().find(|v| v.id == voice_id) {
            return Some(found);
        }
        let path = Path::new(voice_id);
        if path.extension().and_then(|e| e.to_str()) == Some("onnx") {
            return PiperBackend::with_voice_dirs(None, Vec::new()).describe_model(path);
        }
        None
    }

    pub fn backend(&self, kind: BackendKind) -> Option<Arc<dyn SpeechBackend>> {
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    /// `None` stands for "not found"; absence is never fatal here.
    pub fn resolve_executable(&self, kind: BackendKind) -> Option<PathBuf> {
        self.backend(kind)?.locator().resolve()
    }

    /// A second system engine for a voice whose engine failed: `say` falls
    /// back to eSpeak NG. Returns the engine, its executable and the voice to
    /// use, which is the engine's first listed voice or plain English.
    /// Enumerates, so call it off the async workers.
    pub fn resolve_fallback(
        &self,
        failed: BackendKind,
    ) -> Option<(Arc<dyn SpeechBackend>, PathBuf, VoiceDescriptor)> {
        let wanted = match failed {
            BackendKind::SystemSay => BackendKind::SystemEngine,
            _ => return None,
        };
        let backend = self
            .backends
            .iter()
            .chain(self.fallbacks.iter())
            .find(|b| b.kind() == wanted)
            .cloned()?;
        let executable = backend.locator().resolve()?;
        let voice = backend.list_voices().into_iter().next().unwrap_or_else(|| VoiceDescriptor {
            id: "en".to_string(),
            backend: wanted,
            display_name: "English".to_string(),
            model_path: None,
        });
        Some((backend, executable, voice))
    }
}
