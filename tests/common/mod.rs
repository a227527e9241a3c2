//! Fake synthesizers and players for the integration tests.
//!
//! Every fake is a small shell script that appends its name and arguments to
//! a shared log and ends with `exec sleep` so the recorded PID is the process
//! that actually lingers.

#![allow(dead_code)]

use readanything::backends::espeak::EspeakBackend;
use readanything::backends::say::SayBackend;
use readanything::backends::{BackendKind, SpeechBackend, TimedProbe, VoiceDescriptor};
use readanything::candidates::Invocation;
use readanything::pipeline::player::{PlayerCatalog, PlayerKind, PlayerSpec};
use readanything::pipeline::ProcessPipeline;
use readanything::registry::{BackendRegistry, ExecutableLocator};
use readanything::{ChannelListener, Settings, SpeechController, SpeechEvent};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const SYSTEM_VOICE: &str = "gmw/en-US";
pub const SAY_VOICE: &str = "Samantha";

/// How the fake `piper` behaves when asked for raw output.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RawMode {
    Works,
    Fails,
    /// Never reads stdin and never exits.
    Stalls,
}

pub struct Rig {
    pub dir: TempDir,
    pub template: PathBuf,
    pub log: PathBuf,
}

impl Rig {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("template.wav");
        write_wav(&template, 0.2);
        let log = dir.path().join("calls.log");
        std::fs::write(&log, "").expect("log");
        Self { dir, template, log }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    /// Consumes stdin, then copies the template WAV to the `--output_file`
    /// target or emits silence as raw PCM.
    pub fn fake_piper(&self, raw: RawMode, delay_secs: f32) -> PathBuf {
        let raw_branch = match raw {
            RawMode::Works => "head -c 8820 /dev/zero\n  exit 0",
            RawMode::Fails => "echo 'raw output unsupported' >&2\n  exit 3",
            RawMode::Stalls => "exit 0",
        };
        let stall = if raw == RawMode::Stalls {
            "if [ \"$raw\" = 1 ]; then exec sleep 30; fi\n"
        } else {
            ""
        };
        self.script(
            "piper",
            &format!(
                r#"echo "piper $*" >> "{log}"
out=""
raw=0
while [ $# -gt 0 ]; do
  case "$1" in
    --output_file) out="$2"; shift 2 ;;
    --output-raw) raw=1; shift ;;
    *) shift ;;
  esac
done
{stall}cat > /dev/null
sleep {delay}
if [ "$raw" = 1 ]; then
  {raw_branch}
fi
cp "{template}" "$out""#,
                log = self.log.display(),
                delay = delay_secs,
                raw_branch = raw_branch,
                stall = stall,
                template = self.template.display(),
            ),
        )
    }

    /// Writes the template to the `-w` target, like `espeak-ng -w`.
    pub fn fake_espeak(&self) -> PathBuf {
        self.script(
            "espeak-ng",
            &format!(
                r#"echo "espeak-ng $*" >> "{log}"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -w) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
cat > /dev/null
cp "{template}" "$out""#,
                log = self.log.display(),
                template = self.template.display(),
            ),
        )
    }

    /// An engine that always fails with a diagnostic on stderr.
    pub fn broken_espeak(&self) -> PathBuf {
        self.script(
            "espeak-ng",
            "cat > /dev/null\necho 'voice gmw/en-US not found' >&2\nexit 2",
        )
    }

    /// Never finishes. With `reads_input` it drains stdin first; without,
    /// a long text fills the pipe and the writer blocks.
    pub fn stalled_espeak(&self, reads_input: bool) -> PathBuf {
        let drain = if reads_input { "cat > /dev/null\n" } else { "" };
        self.script(
            "espeak-ng",
            &format!(
                "echo \"espeak-ng $*\" >> \"{log}\"\n{drain}exec sleep 30",
                log = self.log.display(),
                drain = drain,
            ),
        )
    }

    /// A `say` that cannot reach its speech service.
    pub fn broken_say(&self) -> PathBuf {
        self.script(
            "say",
            &format!(
                "echo \"say $*\" >> \"{log}\"\ncat > /dev/null\necho 'speech synthesizer unavailable' >&2\nexit 1",
                log = self.log.display(),
            ),
        )
    }

    /// A file player: checks its last argument is a file, then "plays".
    pub fn file_player(&self, name: &str, seconds: f32) -> PathBuf {
        self.script(
            name,
            &format!(
                r#"echo "{name} $*" >> "{log}"
for last; do :; done
[ -s "$last" ] || exit 4
exec sleep {seconds}"#,
                name = name,
                log = self.log.display(),
                seconds = seconds,
            ),
        )
    }

    /// A raw PCM player: drains stdin, then "plays".
    pub fn stream_player(&self, name: &str, seconds: f32) -> PathBuf {
        self.script(
            name,
            &format!(
                r#"echo "{name} $*" >> "{log}"
cat > /dev/null
exec sleep {seconds}"#,
                name = name,
                log = self.log.display(),
                seconds = seconds,
            ),
        )
    }

    /// A neural model with its sidecar under `<dir>/voices`.
    pub fn model(&self) -> PathBuf {
        let model = self.path("voices/en/en_US/test/medium/en_US-test-medium.onnx");
        std::fs::create_dir_all(model.parent().expect("parent")).expect("mkdir");
        std::fs::write(&model, b"onnx").expect("model");
        std::fs::write(
            readanything::backends::piper::sidecar_path(&model),
            r#"{"audio":{"sample_rate":22050,"quality":"medium"}}"#,
        )
        .expect("sidecar");
        model
    }

    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|l| l.split_whitespace().next() == Some(name))
            .count()
    }
}

pub fn write_wav(path: &Path, seconds: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 22_050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("wav");
    let samples = (22_050.0 * seconds) as usize;
    for i in 0..samples {
        writer.write_sample(((i % 64) as i16 - 32) * 64).expect("sample");
    }
    writer.finalize().expect("finalize");
}

/// Short latencies and a quick debounce so scenarios run in about a second.
pub fn fast_settings() -> Settings {
    Settings {
        streaming_latency_ms: 50,
        file_latency_ms: 50,
        prerendered_latency_ms: 50,
        prerender_debounce_ms: 50,
        cancel_grace_ms: 50,
        stop_timeout_ms: 400,
        synthesis_timeout_secs: 10,
        ..Settings::default()
    }
}

/// A real system backend's argument handling with a fixed executable and a
/// single voice, so nothing is probed.
pub struct FakeSystemBackend {
    kind: BackendKind,
    voice: &'static str,
    exe: PathBuf,
    inner: Box<dyn SpeechBackend>,
}

impl FakeSystemBackend {
    /// eSpeak NG with [`SYSTEM_VOICE`].
    pub fn new(exe: PathBuf) -> Self {
        Self {
            kind: BackendKind::SystemEngine,
            voice: SYSTEM_VOICE,
            exe,
            inner: Box::new(EspeakBackend::new(Arc::new(TimedProbe), Duration::from_secs(1))),
        }
    }

    /// macOS `say` with [`SAY_VOICE`].
    pub fn say(exe: PathBuf) -> Self {
        Self {
            kind: BackendKind::SystemSay,
            voice: SAY_VOICE,
            exe,
            inner: Box::new(SayBackend::new(Arc::new(TimedProbe), Duration::from_secs(1), "en_US")),
        }
    }
}

impl SpeechBackend for FakeSystemBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn list_voices(&self) -> Vec<VoiceDescriptor> {
        vec![VoiceDescriptor {
            id: self.voice.to_string(),
            backend: self.kind,
            display_name: self.voice.to_string(),
            model_path: None,
        }]
    }

    fn output_extension(&self) -> &'static str {
        self.inner.output_extension()
    }

    fn locator(&self) -> ExecutableLocator {
        ExecutableLocator {
            configured: Some(self.exe.clone()),
            ..ExecutableLocator::default()
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
        self.inner.file_invocation(exe, voice, rate_wpm, output)
    }
}

pub fn custom_players(file: &[PathBuf], stream: &[PathBuf]) -> PlayerCatalog {
    PlayerCatalog {
        file_players: file
            .iter()
            .map(|p| PlayerSpec::new(PlayerKind::Custom, p))
            .collect(),
        stream_players: stream
            .iter()
            .map(|p| PlayerSpec::new(PlayerKind::Custom, p))
            .collect(),
    }
}

pub struct Harness {
    pub controller: SpeechController,
    pub events: UnboundedReceiver<SpeechEvent>,
}

pub fn harness(
    settings: Settings,
    backends: Vec<Arc<dyn SpeechBackend>>,
    players: PlayerCatalog,
) -> Harness {
    let settings = Arc::new(settings);
    let (listener, events) = ChannelListener::new();
    let controller = SpeechController::with_parts(
        settings.clone(),
        Arc::new(BackendRegistry::with_backends(backends)),
        Arc::new(ProcessPipeline::with_players(&settings, players)),
        Arc::new(listener),
    );
    Harness { controller, events }
}

/// Collects events until `done` matches one (included) or `limit` passes.
pub async fn collect_until(
    events: &mut UnboundedReceiver<SpeechEvent>,
    limit: Duration,
    mut done: impl FnMut(&SpeechEvent) -> bool,
) -> Vec<SpeechEvent> {
    let deadline = tokio::time::Instant::now() + limit;
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        let finished = done(&event);
        seen.push(event);
        if finished {
            break;
        }
    }
    seen
}

pub fn drain(events: &mut UnboundedReceiver<SpeechEvent>) -> Vec<SpeechEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Zombies count as dead: they no longer run and only await reaping.
pub fn pid_alive(pid: u32) -> bool {
    let system = sysinfo::System::new_all();
    match system.process(sysinfo::Pid::from_u32(pid)) {
        None => false,
        Some(process) => !matches!(
            process.status(),
            sysinfo::ProcessStatus::Zombie | sysinfo::ProcessStatus::Dead
        ),
    }
}

pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
