use config::{Config, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(target_os = "macos")]
const DEFAULT_FILE_LATENCY_MS: u64 = 600; // temp file generation + afplay startup
#[cfg(not(target_os = "macos"))]
const DEFAULT_FILE_LATENCY_MS: u64 = 400;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Backend discovery
    pub piper_binary: String,     // explicit path, empty = search
    pub piper_voices_dir: String, // extra model directory, empty = none
    pub system_voice_language: String,
    pub preferred_player: String,
    pub default_rate_wpm: u32,
    // Highlight anchoring (empirical, no feedback from the audio device)
    pub streaming_latency_ms: u64,
    pub file_latency_ms: u64,
    pub prerendered_latency_ms: u64,
    // Pre-render
    pub prerender_enabled: bool,
    pub prerender_debounce_ms: u64,
    pub prerender_max_chars: usize,
    // Process supervision
    pub cancel_grace_ms: u64,
    pub stop_timeout_ms: u64,
    pub synthesis_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub warmup_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            piper_binary: String::new(),
            piper_voices_dir: String::new(),
            system_voice_language: "en_US".to_string(),
            preferred_player: String::new(),
            default_rate_wpm: 150,
            streaming_latency_ms: 350,
            file_latency_ms: DEFAULT_FILE_LATENCY_MS,
            prerendered_latency_ms: 200,
            prerender_enabled: true,
            prerender_debounce_ms: 700,
            prerender_max_chars: 30_000,
            cancel_grace_ms: 50,
            stop_timeout_ms: 250,
            synthesis_timeout_secs: 120,
            probe_timeout_secs: 5,
            warmup_timeout_secs: 45,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = Config::builder()
            .set_default("piper_binary", defaults.piper_binary)?
            .set_default("piper_voices_dir", defaults.piper_voices_dir)?
            .set_default("system_voice_language", defaults.system_voice_language)?
            .set_default("preferred_player", defaults.preferred_player)?
            .set_default("default_rate_wpm", defaults.default_rate_wpm as i64)?
            // Highlight anchoring
            .set_default("streaming_latency_ms", defaults.streaming_latency_ms as i64)?
            .set_default("file_latency_ms", defaults.file_latency_ms as i64)?
            .set_default("prerendered_latency_ms", defaults.prerendered_latency_ms as i64)?
            // Pre-render
            .set_default("prerender_enabled", defaults.prerender_enabled)?
            .set_default("prerender_debounce_ms", defaults.prerender_debounce_ms as i64)?
            .set_default("prerender_max_chars", defaults.prerender_max_chars as i64)?
            // Process supervision
            .set_default("cancel_grace_ms", defaults.cancel_grace_ms as i64)?
            .set_default("stop_timeout_ms", defaults.stop_timeout_ms as i64)?
            .set_default("synthesis_timeout_secs", defaults.synthesis_timeout_secs as i64)?
            .set_default("probe_timeout_secs", defaults.probe_timeout_secs as i64)?
            .set_default("warmup_timeout_secs", defaults.warmup_timeout_secs as i64)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("ReadAnything").required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.config/readanything/settings",
                    std::env::var("HOME").unwrap_or_default()
                ))
                .required(false),
            )
            // Merge with environment variables (e.g. READANYTHING_PIPER_BINARY)
            .add_source(config::Environment::with_prefix("READANYTHING"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !(50..=300).contains(&self.default_rate_wpm) {
            return Err(config::ConfigError::Message(format!(
                "Invalid default_rate_wpm: {}. Must be between 50 and 300",
                self.default_rate_wpm
            )));
        }
        if self.cancel_grace_ms == 0 {
            return Err(config::ConfigError::Message(
                "cancel_grace_ms must be greater than 0".to_string(),
            ));
        }
        if self.stop_timeout_ms <= self.cancel_grace_ms * 2 {
            return Err(config::ConfigError::Message(format!(
                "stop_timeout_ms ({}) must exceed twice cancel_grace_ms ({})",
                self.stop_timeout_ms, self.cancel_grace_ms
            )));
        }
        if self.prerender_max_chars == 0 {
            return Err(config::ConfigError::Message(
                "prerender_max_chars must be greater than 0".to_string(),
            ));
        }
        if self.synthesis_timeout_secs == 0 || self.probe_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn configured_piper_binary(&self) -> Option<PathBuf> {
        non_empty_path(&self.piper_binary)
    }

    pub fn extra_voices_dir(&self) -> Option<PathBuf> {
        non_empty_path(&self.piper_voices_dir)
    }

    pub fn preferred_player(&self) -> Option<PathBuf> {
        non_empty_path(&self.preferred_player)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_secs(self.warmup_timeout_secs)
    }

    pub fn prerender_debounce(&self) -> Duration {
        Duration::from_millis(self.prerender_debounce_ms)
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Expand a leading "~/" the way a shell would
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return Some(home.join(rest));
        }
    }
    Some(PathBuf::from(trimmed))
}
