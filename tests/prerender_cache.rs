//! Background rendering of the text the user is looking at.

#![cfg(unix)]

mod common;

use common::*;
use readanything::backends::piper::PiperBackend;
use readanything::backends::SpeechBackend;
use readanything::prerender::EntryState;
use readanything::{Settings, SpeechEvent};
use serial_test::serial;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn neural(rig: &Rig, piper: PathBuf) -> (Vec<Arc<dyn SpeechBackend>>, String) {
    let model = rig.model();
    let backend = PiperBackend::with_voice_dirs(Some(piper), vec![rig.path("voices")]);
    (vec![Arc::new(backend)], model.to_string_lossy().into_owned())
}

fn piper_calls_with(rig: &Rig, flag: &str) -> usize {
    rig.calls()
        .iter()
        .filter(|c| c.starts_with("piper ") && c.contains(flag))
        .count()
}

async fn wait_ready(h: &mut Harness) -> Vec<SpeechEvent> {
    collect_until(&mut h.events, Duration::from_secs(5), |e| {
        matches!(e, SpeechEvent::PreRenderReady { .. })
    })
    .await
}

#[tokio::test]
#[serial]
async fn ready_render_is_played_without_synthesizing_again() {
    let rig = Rig::new();
    let (backends, voice) = neural(&rig, rig.fake_piper(RawMode::Works, 0.0));
    let players = custom_players(
        &[rig.file_player("player", 0.2)],
        &[rig.stream_player("streamer", 0.2)],
    );
    let mut h = harness(fast_settings(), backends, players);

    h.controller.on_text_or_voice_changed("Hello there", &voice);
    let events = wait_ready(&mut h).await;
    assert_eq!(
        events.last(),
        Some(&SpeechEvent::PreRenderReady { voice_id: voice.clone() })
    );
    let status = h.controller.cache().status().expect("entry");
    assert_eq!(status.state, EntryState::Ready);
    assert!(status.audio_path.as_ref().is_some_and(|p| p.exists()));

    // surrounding whitespace does not change the key
    h.controller
        .play_text("  Hello there ", &voice, 200)
        .await
        .expect("play");
    let events = collect_until(&mut h.events, Duration::from_secs(5), |e| {
        matches!(e, SpeechEvent::Finished { .. } | SpeechEvent::Error { .. })
    })
    .await;
    assert!(
        matches!(events.last(), Some(SpeechEvent::Finished { .. })),
        "events: {:?}",
        events
    );

    assert_eq!(piper_calls_with(&rig, "--output_file"), 1);
    assert_eq!(rig.calls_to("player"), 1);
    assert_eq!(rig.calls_to("streamer"), 0);
}

#[tokio::test]
#[serial]
async fn changing_the_text_deletes_the_rendered_file() {
    let rig = Rig::new();
    let (backends, voice) = neural(&rig, rig.fake_piper(RawMode::Works, 0.0));
    let mut h = harness(fast_settings(), backends, custom_players(&[], &[]));

    h.controller.cache().on_text_or_voice_changed("Original text", &voice);
    wait_ready(&mut h).await;
    let path = h
        .controller
        .cache()
        .status()
        .and_then(|s| s.audio_path)
        .expect("rendered file");
    assert!(path.exists());

    h.controller.cache().on_text_or_voice_changed("Edited text", &voice);
    assert!(!path.exists());
    assert!(h.controller.cache().lookup("Original text", &voice).is_none());
    assert_eq!(
        h.controller.cache().status().map(|s| s.state),
        Some(EntryState::Stale)
    );

    // the new text renders in its place
    wait_ready(&mut h).await;
    assert!(h.controller.cache().lookup("Edited text", &voice).is_some());

    h.controller.shutdown().await;
    assert!(h.controller.cache().status().is_none());
}

#[tokio::test]
#[serial]
async fn superseded_render_is_never_served() {
    let rig = Rig::new();
    let (backends, voice) = neural(&rig, rig.fake_piper(RawMode::Works, 0.5));
    let mut h = harness(fast_settings(), backends, custom_players(&[], &[]));
    let cache = h.controller.cache().clone();

    cache.on_text_or_voice_changed("First text", &voice);
    // past the debounce, so the first render is running
    assert!(wait_until(Duration::from_secs(2), || piper_calls_with(&rig, "--output_file") == 1).await);
    cache.on_text_or_voice_changed("Second text", &voice);

    let events = wait_ready(&mut h).await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    let mut all = events;
    all.extend(drain(&mut h.events));

    let ready = all
        .iter()
        .filter(|e| matches!(e, SpeechEvent::PreRenderReady { .. }))
        .count();
    assert_eq!(ready, 1);
    assert!(cache.lookup("First text", &voice).is_none());
    assert!(cache.lookup("Second text", &voice).is_some());
}

#[tokio::test]
#[serial]
async fn disabled_or_oversized_input_is_not_rendered() {
    let rig = Rig::new();
    let (backends, voice) = neural(&rig, rig.fake_piper(RawMode::Works, 0.0));
    let settings = Settings {
        prerender_enabled: false,
        ..fast_settings()
    };
    let h = harness(settings, backends, custom_players(&[], &[]));
    h.controller.cache().on_text_or_voice_changed("Hello there", &voice);

    let (backends, _) = neural(&rig, rig.fake_piper(RawMode::Works, 0.0));
    let settings = Settings {
        prerender_max_chars: 5,
        ..fast_settings()
    };
    let small = harness(settings, backends, custom_players(&[], &[]));
    small.controller.cache().on_text_or_voice_changed("Far too long", &voice);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.controller.cache().status().is_none());
    assert!(small.controller.cache().status().is_none());
    assert_eq!(piper_calls_with(&rig, "--output_file"), 0);
}

#[tokio::test]
#[serial]
async fn rate_applying_backends_are_not_pre_rendered() {
    let rig = Rig::new();
    let backends: Vec<Arc<dyn SpeechBackend>> =
        vec![Arc::new(FakeSystemBackend::new(rig.fake_espeak()))];
    let h = harness(fast_settings(), backends, custom_players(&[], &[]));

    h.controller.on_text_or_voice_changed("Hello there", SYSTEM_VOICE);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(h.controller.cache().status().is_none());
    assert_eq!(rig.calls_to("espeak-ng"), 0);
}

#[tokio::test]
#[serial]
async fn each_voice_is_warmed_up_once() {
    let rig = Rig::new();
    let (backends, voice) = neural(&rig, rig.fake_piper(RawMode::Works, 0.0));
    let settings = Settings {
        prerender_enabled: false,
        ..fast_settings()
    };
    let h = harness(settings, backends, custom_players(&[], &[]));

    h.controller.on_text_or_voice_changed("One", &voice);
    h.controller.on_text_or_voice_changed("Two", &voice);
    assert!(wait_until(Duration::from_secs(2), || piper_calls_with(&rig, "--output-raw") >= 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.controller.on_text_or_voice_changed("Three", &voice);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(piper_calls_with(&rig, "--output-raw"), 1);
}
