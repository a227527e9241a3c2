//! readanything - speak text with the ReadAnything playback pipeline.

use clap::{Parser, Subcommand};
use readanything::backends::BackendKind;
use readanything::{ChannelListener, Settings, SpeechController, SpeechEvent};
use std::error::Error;
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Text-to-speech playback from the command line
#[derive(Parser)]
#[command(name = "readanything")]
#[command(version)]
#[command(about = "Speak text through local TTS engines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available voices
    Voices,

    /// Show which backend executables were found
    Which,

    /// Speak text (reads stdin when TEXT is "-" or omitted)
    Speak {
        /// Text to speak
        text: Option<String>,
        /// Voice id from `readanything voices` (defaults to the first voice)
        #[arg(short, long)]
        voice: Option<String>,
        /// Words per minute, 50-300
        #[arg(short, long)]
        rate: Option<u32>,
        /// Print each word as it is highlighted
        #[arg(long)]
        highlight: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("readanything=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(Settings::new()?);
    let (listener, mut events) = ChannelListener::new();
    let controller = SpeechController::new(settings.clone(), Arc::new(listener));

    match cli.command {
        Commands::Voices => {
            let registry = controller.registry().clone();
            let voices = tokio::task::spawn_blocking(move || registry.list_voices()).await?;
            if voices.is_empty() {
                println!("No voices found.");
            }
            for voice in voices {
                let available = controller.registry().resolve_executable(voice.backend).is_some();
                println!(
                    "{:<10} {:<40} {}{}",
                    voice.backend.to_string(),
                    voice.display_name,
                    voice.id,
                    if available { "" } else { "  (executable missing)" }
                );
            }
        }

        Commands::Which => {
            for kind in [BackendKind::SystemSay, BackendKind::SystemEngine, BackendKind::Neural] {
                if controller.registry().backend(kind).is_none() {
                    continue;
                }
                match controller.registry().resolve_executable(kind) {
                    Some(path) => println!("{:<10} {}", kind.to_string(), path.display()),
                    None => println!("{:<10} not found", kind.to_string()),
                }
            }
        }

        Commands::Speak {
            text,
            voice,
            rate,
            highlight,
        } => {
            let text = match text.as_deref() {
                None | Some("-") => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
                Some(t) => t.to_string(),
            };
            let voice_id = match voice {
                Some(v) => v,
                None => {
                    let registry = controller.registry().clone();
                    tokio::task::spawn_blocking(move || registry.voices())
                        .await?
                        .into_iter()
                        .next()
                        .map(|v| v.id)
                        .ok_or("no voices installed")?
                }
            };
            let rate = rate.unwrap_or(settings.default_rate_wpm);

            let session = controller.play_text(&text, &voice_id, rate).await?;
            let spoken: Vec<char> = text.trim().chars().collect();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        controller.stop().await;
                        eprintln!();
                        break;
                    }
                    event = events.recv() => match event {
                        Some(SpeechEvent::WordHighlight { session: s, span, .. }) if highlight && s == session => {
                            let word: String = spoken
                                .get(span.start..span.end)
                                .map(|w| w.iter().collect())
                                .unwrap_or_default();
                            println!("{}", word);
                        }
                        Some(SpeechEvent::Finished { session: s }) if s == session => break,
                        Some(SpeechEvent::Error { session: s, message, .. }) if s == session => {
                            controller.shutdown().await;
                            return Err(message.into());
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    }

    controller.shutdown().await;
    Ok(())
}
