//! Crossfade chaining
//!
//! Clips overlap by a fixed crossfade length `L`, so a song of `N` clips
//! is exactly `sum(len) - (N - 1) * L` frames. Every join is checked for
//! a sample-to-sample jump and for silence after the fade.

use std::f32::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clip::FrozenClip;
use crate::config::PipelineConfig;
use crate::engine::buffer::secs_to_frames;
use crate::engine::{AudioBuffer, AudioValidator, SignalLevels};
use crate::error::{Result, SongError};
use crate::request::ClipFrames;

/// Gain law across a crossfade window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossfadeCurve {
    /// `a * (1 - t/L) + b * (t/L)`
    #[default]
    Linear,
    /// Quarter-sine gains; constant power for uncorrelated material
    EqualPower,
}

impl CrossfadeCurve {
    /// `(outgoing, incoming)` gains at position `x` in `[0, 1)`
    pub fn gains(&self, x: f32) -> (f32, f32) {
        match self {
            CrossfadeCurve::Linear => (1.0 - x, x),
            CrossfadeCurve::EqualPower => ((x * FRAC_PI_2).cos(), (x * FRAC_PI_2).sin()),
        }
    }
}

/// Lead-out of the previous clip, handed to the next generation call
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningSeed {
    source_clip: usize,
    waveform: AudioBuffer,
}

impl ConditioningSeed {
    pub fn source_clip(&self) -> usize {
        self.source_clip
    }

    pub fn waveform(&self) -> &AudioBuffer {
        &self.waveform
    }
}

/// Measurements of one join after the fade
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JoinReport {
    /// Join between clip `join_index` and `join_index + 1`
    pub join_index: usize,
    /// First frame of the overlap in the assembled song
    pub start_frame: usize,
    pub max_jump: f32,
    pub levels: SignalLevels,
}

/// Result of assembly
#[derive(Debug, Clone)]
pub struct Assembly {
    pub waveform: AudioBuffer,
    pub joins: Vec<JoinReport>,
}

/// Blend `tail` into `head` over their common length
pub fn crossfade(tail: &AudioBuffer, head: &AudioBuffer, curve: CrossfadeCurve) -> Result<AudioBuffer> {
    tail.ensure_same_rate(head)?;
    if tail.channels() != head.channels() || tail.len() != head.len() {
        return Err(SongError::InvalidAudio {
            reason: format!(
                "crossfade needs equal shapes, got {}x{} and {}x{}",
                tail.channels(),
                tail.len(),
                head.channels(),
                head.len()
            ),
        });
    }
    let mut out = tail.clone();
    blend_into(&mut out, 0, head, curve);
    Ok(out)
}

/// Fade `head` in over `dst[start..start + head.len()]`
fn blend_into(dst: &mut AudioBuffer, start: usize, head: &AudioBuffer, curve: CrossfadeCurve) {
    let frames = head.len();
    for (dst_ch, head_ch) in dst.samples.iter_mut().zip(head.samples.iter()) {
        for (t, &b) in head_ch.iter().enumerate() {
            let (g_out, g_in) = curve.gains(t as f32 / frames as f32);
            let a = &mut dst_ch[start + t];
            *a = *a * g_out + b * g_in;
        }
    }
}

/// Fade the last `frames` frames to zero with `(1 - x)^exponent`
pub fn apply_fade_out(waveform: &mut AudioBuffer, frames: usize, exponent: f32) {
    let len = waveform.len();
    let frames = frames.min(len);
    if frames == 0 {
        return;
    }
    let start = len - frames;
    let span = (frames.max(2) - 1) as f32;
    for channel in &mut waveform.samples {
        for (i, sample) in channel[start..].iter_mut().enumerate() {
            let x = (i as f32 / span).min(1.0);
            *sample *= (1.0 - x).powf(exponent);
        }
    }
}

/// Largest absolute difference between adjacent frames in `[start, end)`
fn max_jump(waveform: &AudioBuffer, start: usize, end: usize) -> f32 {
    let end = end.min(waveform.len());
    let start = start.max(1);
    waveform
        .samples
        .iter()
        .flat_map(|ch| (start..end).map(move |i| (ch[i] - ch[i - 1]).abs()))
        .fold(0.0_f32, f32::max)
}

/// Joins frozen clips into one waveform
#[derive(Debug, Clone)]
pub struct ChainAssembler {
    crossfade_frames: usize,
    lead_out_frames: usize,
    curve: CrossfadeCurve,
    jump_threshold: f32,
    validator: AudioValidator,
    fade_out: Option<f32>,
}

impl ChainAssembler {
    /// The crossfade must be strictly shorter than lead-in and lead-out
    pub fn new(config: &PipelineConfig, frames: ClipFrames) -> Result<Self> {
        let crossfade_frames = secs_to_frames(config.audio.crossfade_secs, config.audio.sample_rate);
        if crossfade_frames == 0 || crossfade_frames >= frames.lead_in || crossfade_frames >= frames.lead_out {
            return Err(SongError::InvalidConfig {
                reason: format!(
                    "crossfade of {} frames must be in 1..min(lead-in {}, lead-out {})",
                    crossfade_frames, frames.lead_in, frames.lead_out
                ),
            });
        }
        Ok(Self {
            crossfade_frames,
            lead_out_frames: frames.lead_out,
            curve: config.audio.crossfade_curve,
            jump_threshold: config.audio.join_jump_threshold,
            validator: config.validator(),
            fade_out: config.audio.fade_out.then_some(config.audio.fade_out_exponent),
        })
    }

    pub fn crossfade_frames(&self) -> usize {
        self.crossfade_frames
    }

    /// `sum(lengths) - (N - 1) * L`
    pub fn expected_len(&self, clip_lengths: &[usize]) -> usize {
        let total: usize = clip_lengths.iter().sum();
        total - clip_lengths.len().saturating_sub(1) * self.crossfade_frames
    }

    /// Cut the lead-out of a finished clip for the next generation call
    pub fn extract_seed(&self, clip: &FrozenClip) -> ConditioningSeed {
        ConditioningSeed {
            source_clip: clip.index(),
            waveform: clip.waveform().tail(self.lead_out_frames),
        }
    }

    /// Crossfade clips in order and validate each join
    pub fn assemble(&self, clips: &[FrozenClip]) -> Result<Assembly> {
        let Some(first) = clips.first() else {
            return Err(SongError::InvalidAudio {
                reason: "no clips to assemble".to_string(),
            });
        };
        let l = self.crossfade_frames;
        for clip in clips {
            first.waveform().ensure_same_rate(clip.waveform())?;
            if clip.waveform().channels() != first.waveform().channels() || clip.len() <= l {
                return Err(SongError::InvalidAudio {
                    reason: format!(
                        "clip {} has {} channels and {} frames; needs {} channels and more than {}",
                        clip.index(),
                        clip.waveform().channels(),
                        clip.len(),
                        first.waveform().channels(),
                        l
                    ),
                });
            }
        }

        let lengths: Vec<usize> = clips.iter().map(FrozenClip::len).collect();
        let expected = self.expected_len(&lengths);
        let mut out = first.waveform().clone();
        out.samples.iter_mut().for_each(|ch| ch.reserve(expected.saturating_sub(ch.len())));

        let mut joins = Vec::with_capacity(clips.len().saturating_sub(1));
        for (join_index, clip) in clips.iter().skip(1).enumerate() {
            let start = out.len() - l;
            let head = clip.waveform().slice_frames(0, l);
            blend_into(&mut out, start, &head, self.curve);
            out.append(&clip.waveform().slice_frames(l, clip.len()))?;
            joins.push(self.check_join(&out, join_index, start)?);
        }

        if out.len() != expected {
            return Err(SongError::InvalidAudio {
                reason: format!("assembled {} frames, expected {}", out.len(), expected),
            });
        }

        if let Some(exponent) = self.fade_out {
            apply_fade_out(&mut out, self.lead_out_frames, exponent);
        }
        let levels = self.validator.assert_valid(&out, "post-chain", None)?;
        info!(
            clips = clips.len(),
            frames = out.len(),
            crossfade_frames = l,
            peak = levels.peak,
            rms = levels.rms,
            "clips chained"
        );

        Ok(Assembly { waveform: out, joins })
    }

    fn check_join(&self, out: &AudioBuffer, join_index: usize, start: usize) -> Result<JoinReport> {
        let end = start + self.crossfade_frames;
        let jump = max_jump(out, start, (end + 1).min(out.len()));
        if jump > self.jump_threshold {
            return Err(SongError::ChainDiscontinuity {
                join_index,
                jump,
                threshold: self.jump_threshold,
            });
        }
        let window = out.slice_frames(start, end);
        let levels = self
            .validator
            .assert_valid(&window, "post-crossfade", Some(join_index + 1))?;
        debug!(join = join_index, start, jump, peak = levels.peak, "join validated");
        Ok(JoinReport {
            join_index,
            start_frame: start,
            max_jump: jump,
            levels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_case::test_case;

    #[test_case(CrossfadeCurve::Linear, 0.5, 0.5 ; "linear midpoint")]
    #[test_case(CrossfadeCurve::EqualPower, 0.70710677, 0.70710677 ; "equal power midpoint")]
    fn test_curve_midpoint(curve: CrossfadeCurve, out: f32, inc: f32) {
        let (g_out, g_in) = curve.gains(0.5);
        assert_relative_eq!(g_out, out, epsilon = 1e-6);
        assert_relative_eq!(g_in, inc, epsilon = 1e-6);
    }

    #[test]
    fn test_linear_crossfade_midpoint_energy() {
        let tail = AudioBuffer::from_mono(vec![0.8; 100], 8_000);
        let head = AudioBuffer::from_mono(vec![0.8; 100], 8_000);
        let mixed = crossfade(&tail, &head, CrossfadeCurve::Linear).unwrap();
        let mid = mixed.samples[0][50];
        assert_relative_eq!(mid, 0.5 * (0.8 + 0.8), epsilon = 1e-6);
    }

    #[test]
    fn test_crossfade_endpoints() {
        let tail = AudioBuffer::from_mono(vec![1.0; 10], 8_000);
        let head = AudioBuffer::from_mono(vec![0.0; 10], 8_000);
        let mixed = crossfade(&tail, &head, CrossfadeCurve::Linear).unwrap();
        assert_relative_eq!(mixed.samples[0][0], 1.0);
        assert_relative_eq!(mixed.samples[0][9], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_fade_out_shape() {
        let mut buffer = AudioBuffer::from_mono(vec![1.0; 11], 8_000);
        apply_fade_out(&mut buffer, 5, 1.5);
        assert_eq!(buffer.samples[0][5], 1.0);
        assert_relative_eq!(buffer.samples[0][6], 1.0);
        assert_relative_eq!(buffer.samples[0][8], 0.5_f32.powf(1.5), epsilon = 1e-6);
        assert_eq!(buffer.samples[0][10], 0.0);
        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn test_max_jump_detects_step() {
        let mut samples = vec![0.1; 20];
        samples[10] = 0.9;
        let buffer = AudioBuffer::from_mono(samples, 8_000);
        assert_relative_eq!(max_jump(&buffer, 0, 20), 0.8, epsilon = 1e-6);
        assert_relative_eq!(max_jump(&buffer, 12, 20), 0.0);
    }
}
