//! Audio players and how to invoke them.

use crate::candidates::Invocation;
use crate::config_loader::Settings;
use std::path::{Path, PathBuf};

/// Reading rate that maps to 1.0x playback.
pub const BASELINE_WPM: f64 = 150.0;
pub const MIN_PLAYBACK_SPEED: f64 = 0.3;
pub const MAX_PLAYBACK_SPEED: f64 = 2.5;

/// Playback speed multiplier for rate-agnostic (neural) audio.
pub fn playback_speed(rate_wpm: u32) -> f64 {
    (rate_wpm as f64 / BASELINE_WPM).clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    Mpv,
    Ffplay,
    Paplay,
    Aplay,
    Pacat,
    Afplay,
    SoundPlayer,
    /// Unknown program: receives the file path (or raw PCM on stdin) and nothing else
    Custom,
}

impl PlayerKind {
    fn from_program(program: &Path) -> Self {
        let name = program
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match name.as_str() {
            "mpv" => PlayerKind::Mpv,
            "ffplay" => PlayerKind::Ffplay,
            "paplay" => PlayerKind::Paplay,
            "aplay" => PlayerKind::Aplay,
            "pacat" => PlayerKind::Pacat,
            "afplay" => PlayerKind::Afplay,
            _ => PlayerKind::Custom,
        }
    }

    /// Whether the player can apply a tempo change itself.
    pub fn honours_speed(self) -> bool {
        matches!(self, PlayerKind::Mpv | PlayerKind::Ffplay | PlayerKind::Afplay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSpec {
    pub kind: PlayerKind,
    pub program: PathBuf,
}

impl PlayerSpec {
    pub fn new(kind: PlayerKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
        }
    }

    /// Kind inferred from the program name.
    pub fn from_program(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            kind: PlayerKind::from_program(&program),
            program,
        }
    }

    pub fn file_invocation(&self, audio: &Path, speed: f64) -> Invocation {
        let inv = Invocation::new(&self.program);
        match self.kind {
            PlayerKind::Mpv => inv
                .args(["--no-video", "--no-terminal", "--audio-buffer=0.1"])
                .arg(format!("--speed={:.2}", speed))
                .arg(audio),
            PlayerKind::Ffplay => inv
                .args(["-autoexit", "-nodisp", "-loglevel", "quiet", "-i"])
                .arg(audio)
                .arg("-af")
                .arg(format!("atempo={:.2}", speed)),
            PlayerKind::Aplay => inv.arg("-q").arg(audio),
            PlayerKind::Afplay => inv.arg("-r").arg(format!("{:.2}", speed)).arg(audio),
            PlayerKind::SoundPlayer => inv.args(["-NoProfile", "-NonInteractive", "-Command"]).arg(
                format!(
                    "(New-Object Media.SoundPlayer '{}').PlaySync()",
                    audio.display().to_string().replace('\'', "''")
                ),
            ),
            PlayerKind::Paplay | PlayerKind::Pacat | PlayerKind::Custom => inv.arg(audio),
        }
    }

    /// Raw S16_LE mono PCM read from stdin. `None` for players that only
    /// accept files.
    pub fn stream_invocation(&self, sample_rate: u32) -> Option<Invocation> {
        let inv = Invocation::new(&self.program);
        let inv = match self.kind {
            PlayerKind::Aplay => inv
                .args(["-q", "-t", "raw", "-f", "S16_LE", "-c", "1", "-r"])
                .arg(sample_rate.to_string())
                .arg("-"),
            PlayerKind::Pacat => inv
                .args(["--raw", "--format=s16le", "--channels=1"])
                .arg(format!("--rate={}", sample_rate)),
            PlayerKind::Ffplay => inv
                .args(["-autoexit", "-nodisp", "-loglevel", "quiet", "-f", "s16le", "-ar"])
                .arg(sample_rate.to_string())
                .args(["-ac", "1", "-i", "-"]),
            PlayerKind::Custom => inv,
            _ => return None,
        };
        Some(inv)
    }
}

/// Ordered file and stream players. The first that spawns wins.
#[derive(Debug, Clone, Default)]
pub struct PlayerCatalog {
    pub file_players: Vec<PlayerSpec>,
    pub stream_players: Vec<PlayerSpec>,
}

impl PlayerCatalog {
    /// Players for this platform, with the configured preferred player first.
    pub fn for_host(settings: &Settings) -> Self {
        let mut catalog = Self::platform_default();
        if let Some(preferred) = settings.preferred_player() {
            let spec = PlayerSpec::from_program(preferred);
            if spec.stream_invocation(crate::backends::DEFAULT_SAMPLE_RATE).is_some()
                && spec.kind != PlayerKind::Custom
            {
                catalog.stream_players.insert(0, spec.clone());
            }
            catalog.file_players.insert(0, spec);
        }
        catalog
    }

    #[cfg(target_os = "macos")]
    fn platform_default() -> Self {
        Self {
            file_players: vec![
                PlayerSpec::new(PlayerKind::Afplay, "afplay"),
                PlayerSpec::new(PlayerKind::Mpv, "mpv"),
                PlayerSpec::new(PlayerKind::Ffplay, "ffplay"),
            ],
            stream_players: vec![PlayerSpec::new(PlayerKind::Ffplay, "ffplay")],
        }
    }

    #[cfg(windows)]
    fn platform_default() -> Self {
        Self {
            file_players: vec![
                PlayerSpec::new(PlayerKind::SoundPlayer, "powershell"),
                PlayerSpec::new(PlayerKind::Ffplay, "ffplay"),
            ],
            // No pipe hand-off to a player without a Unix fd
            stream_players: Vec::new(),
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    fn platform_default() -> Self {
        Self {
            file_players: vec![
                PlayerSpec::new(PlayerKind::Mpv, "mpv"),
                PlayerSpec::new(PlayerKind::Ffplay, "ffplay"),
                PlayerSpec::new(PlayerKind::Paplay, "paplay"),
                PlayerSpec::new(PlayerKind::Aplay, "aplay"),
            ],
            stream_players: vec![
                PlayerSpec::new(PlayerKind::Aplay, "aplay"),
                PlayerSpec::new(PlayerKind::Pacat, "pacat"),
                PlayerSpec::new(PlayerKind::Ffplay, "ffplay"),
            ],
        }
    }

    /// Whether the file player running `program` applies a speed change.
    /// Unknown programs are assumed not to.
    pub fn honours_speed(&self, program: &Path) -> bool {
        self.file_players
            .iter()
            .find(|p| p.program == program)
            .is_some_and(|p| p.kind.honours_speed())
    }

    pub fn supports_streaming(&self) -> bool {
        cfg!(unix) && !self.stream_players.is_empty()
    }

    pub fn file_invocations(&self, audio: &Path, speed: f64) -> Vec<Invocation> {
        self.file_players
            .iter()
            .map(|p| p.file_invocation(audio, speed))
            .collect()
    }

    pub fn stream_invocations(&self, sample_rate: u32) -> Vec<Invocation> {
        self.stream_players
            .iter()
            .filter_map(|p| p.stream_invocation(sample_rate))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn baseline_rate_is_unit_speed() {
        assert_eq!(playback_speed(150), 1.0);
        assert_eq!(playback_speed(300), 2.0);
        assert_eq!(playback_speed(0), MIN_PLAYBACK_SPEED);
        assert_eq!(playback_speed(1000), MAX_PLAYBACK_SPEED);
    }

    proptest! {
        #[test]
        fn speed_is_bounded_and_monotonic(a in 0u32..2000, b in 0u32..2000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (s_lo, s_hi) = (playback_speed(lo), playback_speed(hi));
            prop_assert!((MIN_PLAYBACK_SPEED..=MAX_PLAYBACK_SPEED).contains(&s_lo));
            prop_assert!((MIN_PLAYBACK_SPEED..=MAX_PLAYBACK_SPEED).contains(&s_hi));
            prop_assert!(s_lo <= s_hi);
        }
    }

    #[test]
    fn mpv_gets_speed_and_low_buffer() {
        let inv = PlayerSpec::new(PlayerKind::Mpv, "mpv").file_invocation(Path::new("/tmp/a.wav"), 1.5);
        assert!(inv.has_arg("--speed=1.50"));
        assert!(inv.has_arg("--audio-buffer=0.1"));
        assert!(inv.has_arg("/tmp/a.wav"));
    }

    #[test]
    fn ffplay_uses_atempo() {
        let inv = PlayerSpec::new(PlayerKind::Ffplay, "ffplay").file_invocation(Path::new("a.wav"), 0.8);
        assert!(inv.has_arg("atempo=0.80"));
        assert!(inv.has_arg("-autoexit"));
    }

    #[test]
    fn raw_stream_arguments_carry_the_sample_rate() {
        let aplay = PlayerSpec::new(PlayerKind::Aplay, "aplay").stream_invocation(16_000).unwrap();
        assert!(aplay.has_arg("S16_LE"));
        assert!(aplay.has_arg("16000"));
        assert_eq!(aplay.args.last().map(|a| a.as_os_str()), Some(std::ffi::OsStr::new("-")));

        let pacat = PlayerSpec::new(PlayerKind::Pacat, "pacat").stream_invocation(22_050).unwrap();
        assert!(pacat.has_arg("--rate=22050"));

        assert!(PlayerSpec::new(PlayerKind::Mpv, "mpv").stream_invocation(22_050).is_none());
    }

    #[test]
    fn kind_is_inferred_from_program_name() {
        assert_eq!(PlayerSpec::from_program("/usr/bin/mpv").kind, PlayerKind::Mpv);
        assert_eq!(PlayerSpec::from_program("/opt/x/aplay").kind, PlayerKind::Aplay);
        assert_eq!(PlayerSpec::from_program("/opt/x/myplayer").kind, PlayerKind::Custom);
    }

    #[test]
    fn only_tempo_capable_players_honour_speed() {
        let catalog = PlayerCatalog {
            file_players: vec![
                PlayerSpec::new(PlayerKind::Mpv, "/usr/bin/mpv"),
                PlayerSpec::new(PlayerKind::Paplay, "/usr/bin/paplay"),
            ],
            stream_players: Vec::new(),
        };
        assert!(catalog.honours_speed(Path::new("/usr/bin/mpv")));
        assert!(!catalog.honours_speed(Path::new("/usr/bin/paplay")));
        assert!(!catalog.honours_speed(Path::new("/usr/bin/unlisted")));
    }

    #[test]
    fn preferred_player_goes_first() {
        let settings = Settings {
            preferred_player: "/opt/bin/aplay".to_string(),
            ..Settings::default()
        };
        let catalog = PlayerCatalog::for_host(&settings);
        assert_eq!(catalog.file_players[0].program, PathBuf::from("/opt/bin/aplay"));
        assert_eq!(catalog.stream_players[0].program, PathBuf::from("/opt/bin/aplay"));
    }
}
