//! Song pipeline
//!
//! One song runs on one thread: select a backend, then for each clip
//! generate (conditioned on the previous clip's lead-out), separate,
//! enhance and mix; then chain and master. Every stage boundary validates
//! its output. Any error fails the whole song, releases the models and is
//! returned wrapped in [`SongError::RunFailed`] with the stage and clip.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use crate::backend::{BackendSelector, CallContext};
use crate::chain::{ChainAssembler, ConditioningSeed};
use crate::clip::{ClipGenerator, FrozenClip};
use crate::config::PipelineConfig;
use crate::engine::{AudioBuffer, SignalLevels};
use crate::error::{Result, SongError};
use crate::mastering::Mastering;
use crate::registry::ModelRegistry;
use crate::request::{GenerationRequest, PromptSpec};
use crate::song::{DegradationKind, DegradationNotice, Song, SongState, Stage};
use crate::stems::StemProcessor;
use crate::telemetry::{EventKind, Observers, ProgressObserver};

/// Where the song currently is; used to attribute failures
#[derive(Debug, Clone, Copy)]
struct Position {
    stage: Stage,
    clip: Option<usize>,
    started: Instant,
}

impl Position {
    fn new() -> Self {
        Self {
            stage: Stage::Selecting,
            clip: None,
            started: Instant::now(),
        }
    }
}

/// Runs songs against a model registry
#[derive(Clone)]
pub struct SongPipeline {
    registry: Arc<ModelRegistry>,
    config: PipelineConfig,
    observers: Observers,
}

impl std::fmt::Debug for SongPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongPipeline")
            .field("registry", &self.registry)
            .field("observers", &self.observers)
            .finish()
    }
}

impl SongPipeline {
    pub fn new(registry: Arc<ModelRegistry>, config: PipelineConfig) -> Self {
        Self {
            registry,
            config,
            observers: Observers::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Run a song to completion
    pub fn run(&self, request: GenerationRequest) -> Result<Song> {
        self.run_with_cancel(request, &CancellationToken::new())
    }

    /// Run a song; cancelling the token discards it at the next stage
    /// boundary or while waiting on a backend call
    pub fn run_with_cancel(&self, request: GenerationRequest, cancel: &CancellationToken) -> Result<Song> {
        self.config.validate()?;
        request.validate_against(&self.config)?;

        let mut song = Song::new(request);
        let span = info_span!("song", id = %song.id());
        let _enter = span.enter();
        info!(
            clips = song.request().clip_count(),
            preference = ?song.request().backend_preference(),
            lyrics = song.request().lyrics().is_some(),
            "song requested"
        );

        let mut at = Position::new();
        match self.drive(&mut song, &mut at, cancel) {
            Ok(()) => Ok(song),
            Err(err) => {
                song.fail(at.stage, at.clip, &err);
                self.emit(
                    &song,
                    EventKind::Failed {
                        stage: at.stage,
                        clip_index: at.clip,
                        error_code: err.error_code().to_string(),
                        message: err.friendly_message(),
                    },
                );
                warn!(stage = %at.stage, clip = ?at.clip, error = %err, "song failed");
                self.registry.release();
                Err(SongError::RunFailed {
                    song_id: song.id(),
                    stage: at.stage,
                    clip_index: at.clip,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Run on a blocking worker, cancelling the song if `deadline` passes
    #[cfg(feature = "async-bridge")]
    pub async fn run_async(&self, request: GenerationRequest, deadline: Duration) -> Result<Song> {
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let pipeline = self.clone();
        let mut task =
            tokio::task::spawn_blocking(move || pipeline.run_with_cancel(request, &worker_cancel));

        let joined = match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "song deadline passed, cancelling");
                cancel.cancel();
                task.await
            }
        };
        joined.map_err(|e| SongError::backend("pipeline", format!("song worker failed: {}", e)))?
    }

    fn drive(&self, song: &mut Song, at: &mut Position, cancel: &CancellationToken) -> Result<()> {
        let request = song.request().clone();
        let clip_count = request.clip_count();
        let layout = request.layout();
        let ctx = CallContext {
            timeout: Duration::from_millis(self.config.backends.timeout_ms),
            cancel,
        };

        // one song per device for the whole run
        let _lease = self.registry.acquire_device();

        self.enter(song, at, Stage::Selecting, None, None, cancel)?;
        let selector = BackendSelector::new(&self.registry, &self.config);
        let mut handle = selector.select(&request)?;
        if let Some(notice) = handle.selection_notice() {
            self.record_notice(song, notice.clone());
        }
        song.set_backend(handle.backend_name());
        self.complete(song, at);

        let separator = self
            .registry
            .separator()
            .ok_or_else(|| SongError::backend("separator", "no stem separator registered"))?;
        let generator = ClipGenerator::new(&self.config, layout);
        let processor = StemProcessor::new(separator, self.registry.effects(), &self.config)?;
        let frames = layout.frames(self.config.audio.sample_rate);
        let assembler = ChainAssembler::new(&self.config, frames)?;
        let mastering = Mastering::new(&self.config);
        let prompt = PromptSpec::compose(&request);

        let mut frozen: Vec<FrozenClip> = Vec::with_capacity(clip_count);
        let mut seed: Option<ConditioningSeed> = None;

        for index in 0..clip_count {
            self.enter(
                song,
                at,
                Stage::Generating,
                Some(index),
                Some(SongState::Generating { clip: index }),
                cancel,
            )?;
            let generated = generator.generate_clip(index, &handle, &prompt, seed.as_ref(), &ctx);
            let mut clip = match generated {
                Ok(clip) => clip,
                Err(err) => match selector.degrade(&handle, index, &err, layout.total_secs()) {
                    Some(fallback) => {
                        if let Some(notice) = fallback.selection_notice() {
                            self.record_notice(song, notice.clone());
                        }
                        handle = fallback;
                        song.set_backend(handle.backend_name());
                        generator.generate_clip(index, &handle, &prompt, seed.as_ref(), &ctx)?
                    }
                    None => return Err(err),
                },
            };
            for notice in clip.take_notices() {
                self.record_notice(song, notice);
            }
            let raw = clip
                .raw_waveform()
                .ok_or_else(|| SongError::InvalidAudio {
                    reason: format!("clip {} has no raw waveform", index),
                })?
                .clone();
            self.levels(song, "post-generation", Some(index), &raw);
            self.complete(song, at);

            self.enter(
                song,
                at,
                Stage::Separating,
                Some(index),
                Some(SongState::Separating { clip: index }),
                cancel,
            )?;
            let stems = processor.separate(index, &raw)?;
            drop(raw);
            clip.set_stems(stems)?;
            self.complete(song, at);

            self.enter(
                song,
                at,
                Stage::Enhancing,
                Some(index),
                Some(SongState::Enhancing { clip: index }),
                cancel,
            )?;
            let enhanced = processor.enhance(index, clip.stems().clone())?;
            if let Some(reason) = &enhanced.bypass_reason {
                self.record_notice(
                    song,
                    DegradationNotice::new(
                        Stage::Enhancing,
                        Some(index),
                        DegradationKind::EnhancementBypassed,
                        reason.clone(),
                    ),
                );
            }
            clip.set_enhanced(enhanced.stems, enhanced.bypass_reason.is_some())?;
            let mixed = processor.mix(index, clip.enhanced_stems())?;
            self.levels(song, "post-mix", Some(index), &mixed);
            let done = clip.freeze(mixed)?;
            song.push_clip(done.diagnostics().clone());
            if index + 1 < clip_count {
                seed = Some(assembler.extract_seed(&done));
            }
            frozen.push(done);
            self.complete(song, at);
        }
        drop(seed);

        self.enter(song, at, Stage::Chaining, None, Some(SongState::Chaining), cancel)?;
        let assembly = assembler.assemble(&frozen)?;
        drop(frozen);
        for join in &assembly.joins {
            self.emit(
                song,
                EventKind::SignalLevels {
                    label: "post-crossfade".to_string(),
                    clip_index: Some(join.join_index + 1),
                    levels: join.levels,
                },
            );
        }
        self.levels(song, "post-chain", None, &assembly.waveform);
        song.set_joins(assembly.joins);
        self.complete(song, at);

        self.enter(song, at, Stage::Mastering, None, Some(SongState::Mastering), cancel)?;
        let (mastered, report) = mastering.master(&assembly.waveform)?;
        self.levels(song, "post-mastering", None, &mastered);
        let duration_secs = mastered.duration_secs();
        song.finish(mastered, report)?;
        self.complete(song, at);

        self.emit(
            song,
            EventKind::Finished {
                duration_secs,
                levels: report.output,
            },
        );
        info!(
            backend = song.backend().unwrap_or("unknown"),
            duration_secs,
            peak = report.output.peak,
            rms = report.output.rms,
            notices = song.notices().len(),
            "song ready"
        );
        Ok(())
    }

    /// Move to a stage: check cancellation, advance the state, emit
    fn enter(
        &self,
        song: &mut Song,
        at: &mut Position,
        stage: Stage,
        clip: Option<usize>,
        state: Option<SongState>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        *at = Position {
            stage,
            clip,
            started: Instant::now(),
        };
        if cancel.is_cancelled() {
            return Err(SongError::Cancelled { stage });
        }
        if let Some(state) = state {
            song.advance(state)?;
        }
        self.emit(
            song,
            EventKind::StageStarted {
                stage,
                clip_index: clip,
            },
        );
        Ok(())
    }

    fn complete(&self, song: &Song, at: &Position) {
        self.emit(
            song,
            EventKind::StageCompleted {
                stage: at.stage,
                clip_index: at.clip,
                elapsed_ms: at.started.elapsed().as_millis() as u64,
            },
        );
    }

    fn levels(&self, song: &Song, label: &str, clip: Option<usize>, waveform: &AudioBuffer) {
        self.emit(
            song,
            EventKind::SignalLevels {
                label: label.to_string(),
                clip_index: clip,
                levels: SignalLevels::measure(waveform),
            },
        );
    }

    fn record_notice(&self, song: &mut Song, notice: DegradationNotice) {
        self.emit(
            song,
            EventKind::Degraded {
                stage: notice.stage,
                clip_index: notice.clip_index,
                kind: notice.kind,
                message: notice.message.clone(),
            },
        );
        song.push_notice(notice);
    }

    fn emit(&self, song: &Song, kind: EventKind) {
        self.observers.emit(song.id(), kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::synthetic_registry;
    use crate::backend::HardwareProbe;
    use crate::request::ClipLayout;
    use crate::telemetry::CollectingObserver;
    use pretty_assertions::assert_eq;

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.audio.sample_rate = 16_000;
        config.audio.crossfade_secs = 0.2;
        config
    }

    fn request(clips: usize) -> GenerationRequest {
        GenerationRequest::builder("test song")
            .clip_count(clips)
            .layout(ClipLayout::new(0.3, 1.7, 0.3))
            .build()
            .unwrap()
    }

    #[test]
    fn test_stage_events_in_order() {
        let config = small_config();
        let registry = Arc::new(synthetic_registry(&config, HardwareProbe::nvidia(24.0)));
        let collector = Arc::new(CollectingObserver::new());
        let pipeline = SongPipeline::new(registry, config).with_observer(collector.clone());

        let song = pipeline.run(request(2)).unwrap();
        assert!(song.is_ready());
        assert_eq!(
            collector.completed_stages(),
            vec![
                (Stage::Selecting, None),
                (Stage::Generating, Some(0)),
                (Stage::Separating, Some(0)),
                (Stage::Enhancing, Some(0)),
                (Stage::Generating, Some(1)),
                (Stage::Separating, Some(1)),
                (Stage::Enhancing, Some(1)),
                (Stage::Chaining, None),
                (Stage::Mastering, None),
            ]
        );
        assert_eq!(collector.levels("post-mix").len(), 2);
        assert_eq!(collector.levels("post-crossfade").len(), 1);
    }

    #[test]
    fn test_invalid_request_rejected_before_running() {
        let config = small_config();
        let registry = Arc::new(synthetic_registry(&config, HardwareProbe::cpu()));
        let pipeline = SongPipeline::new(registry, config);
        let request = GenerationRequest::builder("x")
            .layout(ClipLayout::new(0.1, 1.0, 0.3))
            .build()
            .unwrap();
        assert!(matches!(pipeline.run(request), Err(SongError::InvalidRequest { .. })));
    }

    #[test]
    fn test_pre_cancelled_song_fails_at_selection() {
        let config = small_config();
        let registry = Arc::new(synthetic_registry(&config, HardwareProbe::cpu()));
        let pipeline = SongPipeline::new(registry, config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.run_with_cancel(request(1), &cancel).unwrap_err();
        match err {
            SongError::RunFailed { stage, source, .. } => {
                assert_eq!(stage, Stage::Selecting);
                assert!(matches!(*source, SongError::Cancelled { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
