use super::{BackendKind, SpeechBackend, VoiceDescriptor, DEFAULT_SAMPLE_RATE};
use crate::candidates::Invocation;
use crate::config_loader::Settings;
use crate::registry::ExecutableLocator;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 96_000;

pub struct PiperBackend {
    configured_binary: Option<PathBuf>,
    voice_dirs: Vec<PathBuf>,
}

impl PiperBackend {
    pub fn new(settings: &Settings) -> Self {
        let mut voice_dirs = Vec::new();
        if let Ok(env_dir) = std::env::var("PIPER_VOICES_PATH") {
            if !env_dir.trim().is_empty() {
                voice_dirs.push(PathBuf::from(env_dir));
            }
        }
        if let Some(extra) = settings.extra_voices_dir() {
            voice_dirs.push(extra);
        }
        if let Some(home) = dirs::home_dir() {
            voice_dirs.push(home.join(".local/share/piper/voices"));
            voice_dirs.push(home.join(".local/share/piper/models"));
            voice_dirs.push(home.join(".piper/voices"));
            voice_dirs.push(home.join("piper/voices"));
        }
        voice_dirs.push(PathBuf::from("/usr/local/share/piper/voices"));
        voice_dirs.push(PathBuf::from("/usr/share/piper/voices"));

        Self {
            configured_binary: settings.configured_piper_binary(),
            voice_dirs,
        }
    }

    /// Backend that only looks in the given directories.
    pub fn with_voice_dirs(configured_binary: Option<PathBuf>, voice_dirs: Vec<PathBuf>) -> Self {
        Self {
            configured_binary,
            voice_dirs,
        }
    }

    /// Descriptor for a model file, provided its sidecar sits next to it.
    pub fn describe_model(&self, model: &Path) -> Option<VoiceDescriptor> {
        let config_path = sidecar_path(model);
        if !model.is_file() || !config_path.is_file() {
            return None;
        }
        Some(VoiceDescriptor {
            id: model.to_string_lossy().into_owned(),
            backend: BackendKind::Neural,
            display_name: display_name_for(model, &config_path),
            model_path: Some(model.to_path_buf()),
        })
    }
}

impl SpeechBackend for PiperBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Neural
    }

    fn list_voices(&self) -> Vec<VoiceDescriptor> {
        let mut voices = Vec::new();
        let mut seen = HashSet::new();

        for dir in &self.voice_dirs {
            if !dir.is_dir() {
                continue;
            }
            let mut models = Vec::new();
            collect_models(dir, &mut models);
            for model in models {
                // The same tree can be reachable through two configured dirs
                let key = model.canonicalize().unwrap_or_else(|_| model.clone());
                if !seen.insert(key) {
                    continue;
                }
                if let Some(voice) = self.describe_model(&model) {
                    voices.push(voice);
                } else {
                    tracing::debug!(model = %model.display(), "skipping model without .onnx.json sidecar");
                }
            }
        }

        voices
    }

    fn locator(&self) -> ExecutableLocator {
        let mut well_known = Vec::new();
        if let Some(home) = dirs::home_dir() {
            well_known.push(home.join(".local/bin/piper"));
            well_known.push(home.join("bin/piper"));
            well_known.push(home.join(".local/share/piper/piper"));
        }
        well_known.push(PathBuf::from("/usr/local/bin/piper"));
        well_known.push(PathBuf::from("/opt/homebrew/bin/piper")); // Homebrew on Apple Silicon
        well_known.push(PathBuf::from("/usr/bin/piper"));

        ExecutableLocator {
            configured: self.configured_binary.clone(),
            env_var: Some("PIPER_BIN_PATH"),
            well_known,
            path_names: vec!["piper"],
        }
    }

    fn applies_rate_natively(&self) -> bool {
        false
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn stream_invocation(&self, exe: &Path, voice: &VoiceDescriptor) -> Option<Invocation> {
        Some(
            Invocation::new(exe)
                .arg("--model")
                .arg(model_of(voice))
                .arg("--output-raw"),
        )
    }

    fn stream_sample_rate(&self, voice: &VoiceDescriptor) -> u32 {
        read_sample_rate(Path::new(&model_of(voice)))
    }

    fn file_invocation(
        &self,
        exe: &Path,
        voice: &VoiceDescriptor,
        _rate_wpm: u32,
        output: &Path,
    ) -> Invocation {
        Invocation::new(exe)
            .arg("--model")
            .arg(model_of(voice))
            .arg("--output_file")
            .arg(output)
    }

    fn warmup_invocation(&self, exe: &Path, voice: &VoiceDescriptor) -> Option<Invocation> {
        self.stream_invocation(exe, voice)
    }
}

fn model_of(voice: &VoiceDescriptor) -> String {
    voice
        .model_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| voice.id.clone())
}

/// `<model>.onnx` -> `<model>.onnx.json`
pub fn sidecar_path(model: &Path) -> PathBuf {
    let mut name = model.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Sample rate declared in the sidecar (`audio.sample_rate`), clamped into
/// [8000, 96000]. Missing or malformed sidecars fall back to 22050 Hz.
pub fn read_sample_rate(model: &Path) -> u32 {
    let config_path = sidecar_path(model);
    let declared = std::fs::read_to_string(&config_path)
        .ok()
        .and_then(|content| serde_json::from_str::<Value>(&content).ok())
        .and_then(|json| {
            json.get("audio")
                .and_then(|a| a.get("sample_rate"))
                .and_then(|sr| sr.as_u64())
        });

    match declared {
        Some(0) | None => DEFAULT_SAMPLE_RATE,
        Some(sr) => sr.clamp(MIN_SAMPLE_RATE as u64, MAX_SAMPLE_RATE as u64) as u32,
    }
}

fn collect_models(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_models(&path, out);
        } else if path.extension().and_then(|s| s.to_str()) == Some("onnx") {
            out.push(path);
        }
    }
}

/// Models are usually laid out as `<lang>/<locale>/<voice>/<quality>/<file>.onnx`;
/// prefer the directory names over the file stem when that layout is present.
fn display_name_for(model: &Path, config_path: &Path) -> String {
    let stem = model
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("voice")
        .to_string();

    let components: Vec<&str> = model
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    let (mut voice_name, mut quality) = (stem.replace('_', " "), None);
    if components.len() >= 4 {
        let quality_dir = components[components.len() - 2];
        let voice_dir = components[components.len() - 3];
        if matches!(quality_dir, "x_low" | "low" | "medium" | "high") {
            voice_name = voice_dir.to_string();
            quality = Some(quality_dir.to_string());
        }
    }

    if quality.is_none() {
        if let Ok(content) = std::fs::read_to_string(config_path) {
            if let Ok(json) = serde_json::from_str::<Value>(&content) {
                // Real Piper .onnx.json files have this:
                quality = json
                    .get("audio")
                    .and_then(|a| a.get("quality"))
                    .and_then(|q| q.as_str())
                    .map(str::to_string);
            }
        }
    }

    match quality {
        Some(q) => format!("Piper: {} ({})", voice_name, q),
        None => format!("Piper: {}", voice_name),
    }
}
