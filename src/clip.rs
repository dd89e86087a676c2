//! Clip generation and the per-clip aggregate
//!
//! A [`Clip`] is filled stage by stage and cannot accept a stage's output
//! before the previous stage passed validation. Once mixed it is frozen
//! into a [`FrozenClip`], which keeps only the mixed audio and diagnostics.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{BackendHandle, BackendKind, CallContext};
use crate::chain::ConditioningSeed;
use crate::config::PipelineConfig;
use crate::engine::buffer::secs_to_frames;
use crate::engine::{AudioBuffer, AudioValidator, ChannelLayout, SignalLevels};
use crate::error::{GenerationFailureKind, Result, SongError};
use crate::request::{ClipLayout, PromptSpec};
use crate::song::DegradationNotice;
use crate::stems::{stem_energy, Stems};
use crate::vocal::VocalMix;

/// Which waveform fields of a clip have passed validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipValidity {
    pub raw: bool,
    pub post_separation: bool,
    pub post_enhancement: bool,
}

/// Per-clip metadata reported with the song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipDiagnostics {
    pub index: usize,
    pub backend: String,
    pub backend_kind: BackendKind,
    pub conditioned: bool,
    pub generation_ms: u64,
    pub raw_levels: SignalLevels,
    pub stem_names: Vec<String>,
    pub stem_energy: f32,
    pub enhanced_energy: f32,
    pub enhancement_bypassed: bool,
    pub mix_levels: SignalLevels,
    pub vocal_mix: Option<VocalMix>,
    pub validity: ClipValidity,
}

/// A clip under construction
#[derive(Debug, Clone)]
pub struct Clip {
    index: usize,
    backend: String,
    backend_kind: BackendKind,
    conditioned: bool,
    generation_ms: u64,
    raw: Option<AudioBuffer>,
    raw_levels: Option<SignalLevels>,
    stems: Stems,
    enhanced_stems: Stems,
    enhancement_bypassed: bool,
    vocal_mix: Option<VocalMix>,
    notices: Vec<DegradationNotice>,
    validity: ClipValidity,
}

impl Clip {
    fn new(index: usize, handle: &BackendHandle, conditioned: bool) -> Self {
        Self {
            index,
            backend: handle.backend_name().to_string(),
            backend_kind: handle.kind(),
            conditioned,
            generation_ms: 0,
            raw: None,
            raw_levels: None,
            stems: Stems::new(),
            enhanced_stems: Stems::new(),
            enhancement_bypassed: false,
            vocal_mix: None,
            notices: Vec::new(),
            validity: ClipValidity::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn raw_waveform(&self) -> Option<&AudioBuffer> {
        self.raw.as_ref()
    }

    pub fn stems(&self) -> &Stems {
        &self.stems
    }

    pub fn enhanced_stems(&self) -> &Stems {
        &self.enhanced_stems
    }

    pub fn validity(&self) -> ClipValidity {
        self.validity
    }

    /// Notices raised while generating this clip
    pub fn take_notices(&mut self) -> Vec<DegradationNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// Store separated stems; the raw waveform must be valid
    pub fn set_stems(&mut self, stems: Stems) -> Result<()> {
        self.require(self.validity.raw, "separation")?;
        self.stems = stems;
        self.validity.post_separation = true;
        Ok(())
    }

    /// Store enhanced stems; separation must have passed
    pub fn set_enhanced(&mut self, stems: Stems, bypassed: bool) -> Result<()> {
        self.require(self.validity.post_separation, "enhancement")?;
        self.enhanced_stems = stems;
        self.enhancement_bypassed = bypassed;
        self.validity.post_enhancement = true;
        Ok(())
    }

    /// Freeze with the mixed waveform; enhancement must have passed
    pub fn freeze(self, mixed: AudioBuffer) -> Result<FrozenClip> {
        self.require(self.validity.post_enhancement, "mixing")?;
        let raw_levels = self.raw_levels.unwrap_or(SignalLevels { peak: 0.0, rms: 0.0 });
        let diagnostics = ClipDiagnostics {
            index: self.index,
            backend: self.backend,
            backend_kind: self.backend_kind,
            conditioned: self.conditioned,
            generation_ms: self.generation_ms,
            raw_levels,
            stem_names: self.stems.keys().cloned().collect(),
            stem_energy: stem_energy(&self.stems),
            enhanced_energy: stem_energy(&self.enhanced_stems),
            enhancement_bypassed: self.enhancement_bypassed,
            mix_levels: SignalLevels::measure(&mixed),
            vocal_mix: self.vocal_mix,
            validity: self.validity,
        };
        Ok(FrozenClip {
            index: self.index,
            waveform: mixed,
            diagnostics,
        })
    }

    fn require(&self, passed: bool, next: &str) -> Result<()> {
        if passed {
            return Ok(());
        }
        Err(SongError::InvalidAudio {
            reason: format!(
                "clip {} cannot enter {} before the previous stage validated",
                self.index, next
            ),
        })
    }
}

/// A mixed clip ready for chaining
#[derive(Debug, Clone)]
pub struct FrozenClip {
    index: usize,
    waveform: AudioBuffer,
    diagnostics: ClipDiagnostics,
}

impl FrozenClip {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn waveform(&self) -> &AudioBuffer {
        &self.waveform
    }

    pub fn diagnostics(&self) -> &ClipDiagnostics {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.waveform.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waveform.is_empty()
    }
}

/// Produces validated raw clips from a backend
#[derive(Debug, Clone)]
pub struct ClipGenerator {
    validator: AudioValidator,
    sample_rate: u32,
    layout: ChannelLayout,
    target_frames: usize,
    tolerance_frames: usize,
}

impl ClipGenerator {
    pub fn new(config: &PipelineConfig, clip_layout: ClipLayout) -> Self {
        let sample_rate = config.audio.sample_rate;
        Self {
            validator: config.validator(),
            sample_rate,
            layout: config.audio.layout,
            target_frames: clip_layout.frames(sample_rate).total(),
            tolerance_frames: secs_to_frames(config.audio.duration_tolerance_secs, sample_rate),
        }
    }

    /// Frames every raw clip is conformed to
    pub fn target_frames(&self) -> usize {
        self.target_frames
    }

    /// Generate and validate one raw clip
    ///
    /// Backend failures carry the clip index. The raw waveform is
    /// conformed to the song's rate, layout and exact length, then must
    /// pass `post-generation` validation.
    pub fn generate_clip(
        &self,
        index: usize,
        handle: &BackendHandle,
        prompt: &PromptSpec,
        seed: Option<&ConditioningSeed>,
        ctx: &CallContext<'_>,
    ) -> Result<Clip> {
        let mut clip = Clip::new(index, handle, seed.is_some());
        let start = Instant::now();
        let generated = handle.generate(index, prompt, seed, ctx)?;
        clip.generation_ms = start.elapsed().as_millis() as u64;
        clip.notices = generated.notices;
        clip.vocal_mix = generated.vocal_mix;

        let waveform = self.conform(index, generated.waveform)?;
        let levels = self
            .validator
            .assert_valid(&waveform, "post-generation", Some(index))?;
        info!(
            clip = index,
            backend = %clip.backend,
            peak = levels.peak,
            rms = levels.rms,
            ms = clip.generation_ms,
            "clip generated"
        );

        clip.raw = Some(waveform);
        clip.raw_levels = Some(levels);
        clip.validity.raw = true;
        Ok(clip)
    }

    /// Bring backend output to the song's format and exact frame count
    pub fn conform(&self, index: usize, waveform: AudioBuffer) -> Result<AudioBuffer> {
        if waveform.has_non_finite() {
            return Err(SongError::Generation {
                clip_index: index,
                kind: GenerationFailureKind::InvalidOutput,
                reason: "output contains NaN or infinite samples".to_string(),
            });
        }
        if waveform.channel_layout().is_none() {
            return Err(SongError::Generation {
                clip_index: index,
                kind: GenerationFailureKind::InvalidOutput,
                reason: format!("output has {} channels", waveform.channels()),
            });
        }
        if waveform.sample_rate == 0 {
            return Err(SongError::Generation {
                clip_index: index,
                kind: GenerationFailureKind::InvalidOutput,
                reason: "output has sample rate 0".to_string(),
            });
        }

        if waveform.sample_rate != self.sample_rate {
            debug!(clip = index, from = waveform.sample_rate, to = self.sample_rate, "resampling clip");
        }
        let mut conformed = waveform.resample(self.sample_rate).to_layout(self.layout);

        let frames = conformed.len();
        if frames.abs_diff(self.target_frames) > self.tolerance_frames {
            return Err(SongError::Generation {
                clip_index: index,
                kind: GenerationFailureKind::DurationMismatch,
                reason: format!(
                    "got {:.3}s, expected {:.3}s",
                    frames as f64 / self.sample_rate as f64,
                    self.target_frames as f64 / self.sample_rate as f64
                ),
            });
        }
        if frames != self.target_frames {
            debug!(clip = index, frames, target = self.target_frames, "conforming clip length");
            conformed.resize_frames(self.target_frames);
        }
        Ok(conformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn generator() -> ClipGenerator {
        let mut config = PipelineConfig::default();
        config.audio.sample_rate = 8_000;
        ClipGenerator::new(&config, ClipLayout::new(0.3, 1.7, 0.3))
    }

    #[test]
    fn test_conform_trims_within_tolerance() {
        let generator = generator();
        let long = AudioBuffer::from_mono(vec![0.5; 18_400 + 800], 8_000);
        let conformed = generator.conform(0, long).unwrap();
        assert_eq!(conformed.len(), 18_400);
    }

    #[test]
    fn test_conform_pads_within_tolerance() {
        let generator = generator();
        let short = AudioBuffer::from_mono(vec![0.5; 18_000], 8_000);
        assert_eq!(generator.conform(0, short).unwrap().len(), 18_400);
    }

    #[test]
    fn test_conform_rejects_large_mismatch() {
        let generator = generator();
        let short = AudioBuffer::from_mono(vec![0.5; 8_000], 8_000);
        let err = generator.conform(3, short).unwrap_err();
        assert!(matches!(
            err,
            SongError::Generation {
                clip_index: 3,
                kind: GenerationFailureKind::DurationMismatch,
                ..
            }
        ));
    }

    #[test]
    fn test_conform_resamples() {
        let generator = generator();
        let other_rate = AudioBuffer::from_mono(vec![0.5; 36_800], 16_000);
        let conformed = generator.conform(0, other_rate).unwrap();
        assert_eq!(conformed.sample_rate, 8_000);
        assert_eq!(conformed.len(), 18_400);
    }

    #[test]
    fn test_conform_rejects_nan() {
        let generator = generator();
        let mut samples = vec![0.5; 18_400];
        samples[10] = f32::NAN;
        let err = generator
            .conform(0, AudioBuffer::from_mono(samples, 8_000))
            .unwrap_err();
        assert!(matches!(
            err,
            SongError::Generation {
                kind: GenerationFailureKind::InvalidOutput,
                ..
            }
        ));
    }
}
