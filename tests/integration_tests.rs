//! Integration Tests
//!
//! End-to-end runs of the song pipeline against synthetic collaborators.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use songchain::backend::mock::{
    DegenerateSeparator, SyntheticBackend, SyntheticVocals, UnavailableEffects,
};
use songchain::backend::{BackendKind, HardwareProbe};
use songchain::error::GenerationFailureKind;
use songchain::song::DegradationKind;
use songchain::stems::FilterBankSeparator;
use songchain::telemetry::{CollectingObserver, EventKind};
use songchain::{
    ClipLayout, GenerationRequest, ModelRegistry, PipelineConfig, SongError, SongPipeline,
    SongState, Stage,
};

const RATE: u32 = 16_000;
/// 0.3 + 1.7 + 0.3 seconds at 16 kHz
const CLIP_FRAMES: usize = 36_800;
/// 0.2 seconds at 16 kHz
const CROSSFADE_FRAMES: usize = 3_200;
const LEAD_OUT_FRAMES: usize = 4_800;

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.audio.sample_rate = RATE;
    config.audio.crossfade_secs = 0.2;
    config.backends.timeout_ms = 10_000;
    config
}

fn request(clips: usize) -> GenerationRequest {
    GenerationRequest::builder("late night city drive")
        .clip_count(clips)
        .layout(ClipLayout::new(0.3, 1.7, 0.3))
        .genre("synthwave")
        .seed(3)
        .build()
        .unwrap()
}

/// Registry whose backends the test keeps handles to
struct Fixture {
    primary: Arc<SyntheticBackend>,
    fallback: Arc<SyntheticBackend>,
    vocals: Arc<SyntheticVocals>,
    registry: Arc<ModelRegistry>,
}

fn fixture(
    hardware: HardwareProbe,
    primary: SyntheticBackend,
    fallback: SyntheticBackend,
    vocals: SyntheticVocals,
) -> Fixture {
    let primary = Arc::new(primary);
    let fallback = Arc::new(fallback);
    let vocals = Arc::new(vocals);
    let registry = ModelRegistry::builder()
        .hardware(hardware)
        .primary(primary.clone())
        .fallback(fallback.clone())
        .separator(Arc::new(FilterBankSeparator::new()))
        .vocals(vocals.clone())
        .build();
    Fixture {
        primary,
        fallback,
        vocals,
        registry: Arc::new(registry),
    }
}

fn default_fixture(config: &PipelineConfig, hardware: HardwareProbe) -> Fixture {
    fixture(
        hardware,
        SyntheticBackend::primary(&config.backends),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    )
}

fn unwrap_run_failed(err: SongError) -> (Stage, Option<usize>, SongError) {
    match err {
        SongError::RunFailed {
            stage,
            clip_index,
            source,
            ..
        } => (stage, clip_index, *source),
        other => panic!("expected RunFailed, got {other}"),
    }
}

// === Scenario Tests ===

#[test]
fn test_single_clip_instrumental() {
    let config = config();
    let fx = default_fixture(&config, HardwareProbe::nvidia(24.0));
    let song = SongPipeline::new(fx.registry.clone(), config)
        .run(request(1))
        .unwrap();

    assert_eq!(song.state(), &SongState::Ready);
    assert_eq!(song.clips().len(), 1);
    assert!(song.joins().is_empty());
    assert_eq!(song.backend(), Some("synthetic-primary"));

    let waveform = song.waveform().unwrap();
    assert_eq!(waveform.len(), CLIP_FRAMES);
    assert!(waveform.peak() <= 0.9 + 1e-5);
    assert!(waveform.rms() > 0.0);
    assert_eq!(fx.primary.call_count(), 1);
    assert_eq!(fx.vocals.call_count(), 0);
}

#[test]
fn test_primary_unavailable_with_lyrics_uses_fallback_and_vocals() {
    let config = config();
    let fx = default_fixture(&config, HardwareProbe::cpu());
    let request = GenerationRequest::builder("campfire song")
        .clip_count(1)
        .layout(ClipLayout::new(0.3, 1.7, 0.3))
        .lyrics("[Verse]\nsing along now")
        .build()
        .unwrap();

    let song = SongPipeline::new(fx.registry.clone(), config)
        .run(request)
        .unwrap();

    assert!(song.is_ready());
    assert_eq!(song.backend(), Some("synthetic-fallback"));
    assert_eq!(fx.primary.call_count(), 0);
    assert_eq!(fx.vocals.call_count(), 1);

    let mix = song.clips()[0].vocal_mix.expect("vocals mixed");
    assert_relative_eq!(mix.instrumental_gain, 0.7);
    assert_relative_eq!(mix.vocal_gain, 0.3);
    assert!(song
        .notices()
        .iter()
        .any(|n| n.kind == DegradationKind::BackendFallback && n.stage == Stage::Selecting));

    // the fallback was asked for an instrumental
    let calls = fx.fallback.calls();
    assert!(calls[0].lyrics.is_none());
    assert!(calls[0].prompt.ends_with("instrumental"));
}

#[test]
fn test_generation_failure_on_clip_two_fails_song() {
    let mut config = config();
    config.backends.degrade_on_primary_failure = false;
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends).fail_on_call(2, GenerationFailureKind::Backend),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let collector = Arc::new(CollectingObserver::new());
    let pipeline = SongPipeline::new(fx.registry.clone(), config).with_observer(collector.clone());

    let err = pipeline.run(request(3)).unwrap_err();
    let (stage, clip_index, source) = unwrap_run_failed(err);
    assert_eq!(stage, Stage::Generating);
    assert_eq!(clip_index, Some(2));
    assert!(matches!(
        source,
        SongError::Generation {
            clip_index: 2,
            kind: GenerationFailureKind::Backend,
            ..
        }
    ));

    assert_eq!(fx.primary.call_count(), 3);
    assert_eq!(fx.fallback.call_count(), 0);
    assert_eq!(fx.primary.release_count(), 1);
    assert!(!fx.registry.device_busy());

    let failed = collector
        .events()
        .into_iter()
        .filter(|e| matches!(e.kind, EventKind::Failed { clip_index: Some(2), .. }))
        .count();
    assert_eq!(failed, 1);
    assert!(!collector
        .events()
        .iter()
        .any(|e| matches!(e.kind, EventKind::Finished { .. })));
}

#[test]
fn test_primary_failure_degrades_to_fallback() {
    let config = config();
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends)
            .fail_on_call(1, GenerationFailureKind::ResourceExhausted),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let song = SongPipeline::new(fx.registry.clone(), config)
        .run(request(3))
        .unwrap();

    assert!(song.is_ready());
    assert_eq!(fx.primary.call_count(), 2);
    assert_eq!(fx.fallback.call_count(), 2);
    assert_eq!(song.clips()[0].backend_kind, BackendKind::Primary);
    assert_eq!(song.clips()[1].backend_kind, BackendKind::Fallback);
    assert_eq!(song.clips()[2].backend_kind, BackendKind::Fallback);
    assert_eq!(song.backend(), Some("synthetic-fallback"));

    let notice = song
        .notices()
        .iter()
        .find(|n| n.kind == DegradationKind::BackendFallback)
        .unwrap();
    assert_eq!(notice.clip_index, Some(1));

    // the retried clip still got the previous clip's lead-out
    let retried = &fx.fallback.calls()[0];
    assert_eq!(retried.conditioning_frames, Some(LEAD_OUT_FRAMES));
}

#[test]
fn test_silent_output_is_not_retried() {
    let config = config();
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends).silent_on_call(0),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let err = SongPipeline::new(fx.registry.clone(), config)
        .run(request(2))
        .unwrap_err();

    let (stage, clip_index, source) = unwrap_run_failed(err);
    assert_eq!(stage, Stage::Generating);
    assert_eq!(clip_index, Some(0));
    match source {
        SongError::SilentAudio { stage, peak, .. } => {
            assert_eq!(stage, "post-generation");
            assert_eq!(peak, 0.0);
        }
        other => panic!("expected SilentAudio, got {other}"),
    }
    assert_eq!(fx.fallback.call_count(), 0);
}

#[test]
fn test_degenerate_separation_aborts() {
    let config = config();
    let registry = ModelRegistry::builder()
        .hardware(HardwareProbe::nvidia(24.0))
        .primary(Arc::new(SyntheticBackend::primary(&config.backends)))
        .separator(Arc::new(DegenerateSeparator))
        .build();
    let pipeline = SongPipeline::new(Arc::new(registry), config);

    let err = pipeline.run(request(2)).unwrap_err();
    let (stage, clip_index, source) = unwrap_run_failed(err);
    assert_eq!(stage, Stage::Separating);
    assert_eq!(clip_index, Some(0));
    assert!(matches!(source, SongError::SeparationDegenerate { clip_index: 0, .. }));
}

#[test]
fn test_enhancement_bypass_is_reported() {
    let config = config();
    let registry = ModelRegistry::builder()
        .hardware(HardwareProbe::nvidia(24.0))
        .primary(Arc::new(SyntheticBackend::primary(&config.backends)))
        .separator(Arc::new(FilterBankSeparator::new()))
        .effects(Arc::new(UnavailableEffects))
        .build();
    let song = SongPipeline::new(Arc::new(registry), config)
        .run(request(2))
        .unwrap();

    assert!(song.is_ready());
    assert!(song.clips().iter().all(|c| c.enhancement_bypassed));
    let bypassed = song
        .notices()
        .iter()
        .filter(|n| n.kind == DegradationKind::EnhancementBypassed)
        .count();
    assert_eq!(bypassed, 2);
}

#[test]
fn test_vocal_failure_keeps_instrumental() {
    let config = config();
    let fx = fixture(
        HardwareProbe::cpu(),
        SyntheticBackend::primary(&config.backends),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE).failing(),
    );
    let request = GenerationRequest::builder("lullaby")
        .clip_count(1)
        .layout(ClipLayout::new(0.3, 1.7, 0.3))
        .lyrics("hush now")
        .build()
        .unwrap();
    let song = SongPipeline::new(fx.registry.clone(), config)
        .run(request)
        .unwrap();

    assert!(song.is_ready());
    assert!(song.clips()[0].vocal_mix.is_none());
    assert!(song
        .notices()
        .iter()
        .any(|n| n.kind == DegradationKind::VocalsUnavailable && n.clip_index == Some(0)));
}

#[test]
fn test_silent_instrumental_not_masked_by_vocals() {
    let config = config();
    let fx = fixture(
        HardwareProbe::cpu(),
        SyntheticBackend::primary(&config.backends),
        SyntheticBackend::fallback(&config.backends).silent_on_call(0),
        SyntheticVocals::new(RATE),
    );
    let request = GenerationRequest::builder("lullaby")
        .clip_count(1)
        .layout(ClipLayout::new(0.3, 1.7, 0.3))
        .lyrics("hush now")
        .build()
        .unwrap();
    let err = SongPipeline::new(fx.registry.clone(), config)
        .run(request)
        .unwrap_err();

    let (stage, clip_index, source) = unwrap_run_failed(err);
    assert_eq!(stage, Stage::Generating);
    assert_eq!(clip_index, Some(0));
    match source {
        SongError::SilentAudio { stage, peak, .. } => {
            assert_eq!(stage, "post-generation");
            assert_eq!(peak, 0.0);
        }
        other => panic!("expected SilentAudio, got {other}"),
    }
    assert_eq!(fx.vocals.call_count(), 0);
    assert_eq!(fx.fallback.call_count(), 1);
}

#[test]
fn test_silent_vocal_reported_as_unavailable() {
    let config = config();
    let fx = fixture(
        HardwareProbe::cpu(),
        SyntheticBackend::primary(&config.backends),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE).silent(),
    );
    let request = GenerationRequest::builder("lullaby")
        .clip_count(1)
        .layout(ClipLayout::new(0.3, 1.7, 0.3))
        .lyrics("hush now")
        .build()
        .unwrap();
    let song = SongPipeline::new(fx.registry.clone(), config)
        .run(request)
        .unwrap();

    assert!(song.is_ready());
    assert_eq!(fx.vocals.call_count(), 1);
    assert!(song.clips()[0].vocal_mix.is_none());
    assert!(song
        .notices()
        .iter()
        .any(|n| n.kind == DegradationKind::VocalsUnavailable && n.clip_index == Some(0)));
}

#[test]
fn test_no_backend_available() {
    let config = config();
    let fx = fixture(
        HardwareProbe::cpu(),
        SyntheticBackend::primary(&config.backends),
        SyntheticBackend::fallback(&config.backends).unavailable(),
        SyntheticVocals::new(RATE),
    );
    let err = SongPipeline::new(fx.registry.clone(), config)
        .run(request(1))
        .unwrap_err();
    let (stage, clip_index, source) = unwrap_run_failed(err);
    assert_eq!(stage, Stage::Selecting);
    assert_eq!(clip_index, None);
    assert!(matches!(source, SongError::NoBackendAvailable { .. }));
}

// === Chaining Tests ===

#[test]
fn test_assembled_length_is_exact() {
    let config = config();
    let fx = default_fixture(&config, HardwareProbe::nvidia(24.0));
    let song = SongPipeline::new(fx.registry.clone(), config)
        .run(request(3))
        .unwrap();

    let expected = 3 * CLIP_FRAMES - 2 * CROSSFADE_FRAMES;
    assert_eq!(song.waveform().unwrap().len(), expected);
    assert_eq!(song.joins().len(), 2);
    assert_eq!(song.joins()[0].start_frame, CLIP_FRAMES - CROSSFADE_FRAMES);
}

#[test]
fn test_clips_are_conditioned_on_previous_lead_out() {
    let config = config();
    let fx = default_fixture(&config, HardwareProbe::nvidia(24.0));
    SongPipeline::new(fx.registry.clone(), config)
        .run(request(3))
        .unwrap();

    let conditioning: Vec<_> = fx
        .primary
        .calls()
        .iter()
        .map(|c| c.conditioning_frames)
        .collect();
    assert_eq!(
        conditioning,
        vec![None, Some(LEAD_OUT_FRAMES), Some(LEAD_OUT_FRAMES)]
    );
}

#[test]
fn test_backend_output_is_conformed() {
    let config = config();
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends)
            .with_output_rate(22_050)
            .with_duration_offset(0.25),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let song = SongPipeline::new(fx.registry.clone(), config)
        .run(request(2))
        .unwrap();
    let waveform = song.waveform().unwrap();
    assert_eq!(waveform.sample_rate, RATE);
    assert_eq!(waveform.len(), 2 * CLIP_FRAMES - CROSSFADE_FRAMES);
}

#[test]
fn test_duration_mismatch_fails() {
    let mut config = config();
    config.backends.degrade_on_primary_failure = false;
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends).with_duration_offset(-1.0),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let err = SongPipeline::new(fx.registry.clone(), config)
        .run(request(1))
        .unwrap_err();
    let (_, _, source) = unwrap_run_failed(err);
    assert!(matches!(
        source,
        SongError::Generation {
            kind: GenerationFailureKind::DurationMismatch,
            ..
        }
    ));
}

// === Cancellation Tests ===

#[test]
fn test_cancel_during_generation() {
    let config = config();
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends).with_delay(Duration::from_millis(500)),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let pipeline = SongPipeline::new(fx.registry.clone(), config);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });

    let err = pipeline.run_with_cancel(request(2), &cancel).unwrap_err();
    canceller.join().unwrap();

    let (stage, clip_index, source) = unwrap_run_failed(err);
    assert_eq!(stage, Stage::Generating);
    assert_eq!(clip_index, Some(0));
    assert!(matches!(source, SongError::Cancelled { stage: Stage::Generating }));
    // the abandoned backend call still owns the device until it returns
    assert!(fx.registry.device_busy());
    assert_eq!(fx.primary.release_count(), 0);
    assert!(fx.registry.wait_for_idle(Duration::from_secs(5)));
    assert!(!fx.registry.device_busy());
    assert_eq!(fx.primary.release_count(), 1);
}

#[test]
fn test_generation_timeout() {
    let mut config = config();
    config.backends.timeout_ms = 50;
    config.backends.degrade_on_primary_failure = false;
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends).with_delay(Duration::from_millis(400)),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let err = SongPipeline::new(fx.registry.clone(), config)
        .run(request(1))
        .unwrap_err();
    let (_, clip_index, source) = unwrap_run_failed(err);
    assert_eq!(clip_index, Some(0));
    assert!(matches!(
        source,
        SongError::Generation {
            kind: GenerationFailureKind::Timeout,
            ..
        }
    ));
}

#[test]
fn test_abandoned_call_blocks_next_song_on_device() {
    let mut timed_out = config();
    timed_out.backends.timeout_ms = 50;
    timed_out.backends.degrade_on_primary_failure = false;
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&timed_out.backends).with_delay(Duration::from_millis(600)),
        SyntheticBackend::fallback(&timed_out.backends),
        SyntheticVocals::new(RATE),
    );

    let err = SongPipeline::new(fx.registry.clone(), timed_out)
        .run(request(1))
        .unwrap_err();
    let (_, _, source) = unwrap_run_failed(err);
    assert!(matches!(
        source,
        SongError::Generation {
            kind: GenerationFailureKind::Timeout,
            ..
        }
    ));
    // release waits for the call still running on the device
    assert_eq!(fx.primary.release_count(), 0);

    let song = SongPipeline::new(fx.registry.clone(), config())
        .run(request(1))
        .unwrap();
    assert!(song.is_ready());
    assert_eq!(fx.primary.call_count(), 2);
    assert_eq!(fx.primary.max_concurrent_calls(), 1);
    assert_eq!(fx.primary.release_count(), 1);
    assert_eq!(fx.primary.initialize_count(), 2);
}

#[cfg(feature = "async-bridge")]
#[tokio::test]
async fn test_async_deadline_cancels_song() {
    let config = config();
    let fx = fixture(
        HardwareProbe::nvidia(24.0),
        SyntheticBackend::primary(&config.backends).with_delay(Duration::from_millis(500)),
        SyntheticBackend::fallback(&config.backends),
        SyntheticVocals::new(RATE),
    );
    let pipeline = SongPipeline::new(fx.registry.clone(), config);
    let err = pipeline
        .run_async(request(1), Duration::from_millis(50))
        .await
        .unwrap_err();
    let (_, _, source) = unwrap_run_failed(err);
    assert!(matches!(source, SongError::Cancelled { .. }));
}
