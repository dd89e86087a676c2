//! Final mastering: peak normalization then soft limiting
//!
//! The limiter only touches samples above its threshold, so normal-level
//! material passes through unchanged and mastering a mastered track is a
//! no-op.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PipelineConfig;
use crate::engine::{AudioBuffer, AudioValidator, SignalLevels};
use crate::error::Result;

/// What mastering did to a track
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MasteringReport {
    pub input: SignalLevels,
    pub output: SignalLevels,
    /// Normalization gain (linear)
    pub gain: f32,
    pub limited_samples: usize,
}

/// Smooth saturation of the excess above `threshold`, approaching `ceiling`
#[inline]
pub fn soft_limit(x: f32, threshold: f32, ceiling: f32) -> f32 {
    let magnitude = x.abs();
    if magnitude <= threshold {
        return x;
    }
    let knee = ceiling - threshold;
    if knee <= f32::EPSILON {
        return threshold.copysign(x);
    }
    (threshold + knee * ((magnitude - threshold) / knee).tanh()).copysign(x)
}

#[derive(Debug, Clone)]
pub struct Mastering {
    headroom: f32,
    threshold: f32,
    ceiling: f32,
    validator: AudioValidator,
}

impl Mastering {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            headroom: config.mastering.headroom,
            threshold: config.mastering.limiter_threshold,
            ceiling: config.mastering.limiter_ceiling,
            validator: config.validator(),
        }
    }

    pub fn headroom(&self) -> f32 {
        self.headroom
    }

    /// Normalize the peak to the headroom, then soft-limit
    ///
    /// A silent input is an error rather than something to scale up.
    pub fn master(&self, waveform: &AudioBuffer) -> Result<(AudioBuffer, MasteringReport)> {
        let input = self.validator.assert_valid(waveform, "pre-mastering", None)?;

        let gain = self.headroom / input.peak;
        let mut out = waveform.clone();
        if (gain - 1.0).abs() > f32::EPSILON {
            out.apply_gain(gain);
        }

        let mut limited_samples = 0;
        for channel in &mut out.samples {
            for sample in channel.iter_mut() {
                if sample.abs() > self.threshold {
                    *sample = soft_limit(*sample, self.threshold, self.ceiling);
                    limited_samples += 1;
                }
            }
        }

        let output = self.validator.assert_valid(&out, "post-mastering", None)?;
        info!(
            input_peak = input.peak,
            input_rms = input.rms,
            output_peak = output.peak,
            output_rms = output.rms,
            gain,
            limited_samples,
            "mastered"
        );

        Ok((
            out,
            MasteringReport {
                input,
                output,
                gain,
                limited_samples,
            },
        ))
    }
}
