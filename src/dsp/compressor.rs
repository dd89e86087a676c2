//! Compressor effect
//!
//! Feed-forward compressor with peak detection, soft knee and one-pole
//! attack/release smoothing. With a sidechain high-pass the same detector
//! becomes a de-esser: only sibilant energy drives the gain reduction.

use serde::{Deserialize, Serialize};

use crate::dsp::effect::Effect;
use crate::dsp::eq::{BiquadCoeffs, BiquadState, FilterType};
use crate::engine::buffer::db_to_linear;
use crate::engine::AudioBuffer;
use crate::error::{Result, SongError};

/// Compressor parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorParams {
    /// Threshold level in dB (-60 to 0 dB)
    pub threshold_db: f32,
    /// Compression ratio (1.0 to 20.0)
    pub ratio: f32,
    /// Attack time in milliseconds (0.1 to 100 ms)
    pub attack_ms: f32,
    /// Release time in milliseconds (10 to 1000 ms)
    pub release_ms: f32,
    /// Knee width in dB (0 = hard knee)
    #[serde(default)]
    pub knee_db: f32,
    /// Makeup gain in dB
    #[serde(default)]
    pub makeup_gain_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -18.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            knee_db: 0.0,
            makeup_gain_db: 0.0,
        }
    }
}

impl CompressorParams {
    pub fn new(threshold_db: f32, ratio: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            threshold_db,
            ratio,
            attack_ms,
            release_ms,
            ..Self::default()
        }
    }

    /// Validate parameters against their ranges
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("threshold_db", self.threshold_db, -60.0, 0.0),
            ("ratio", self.ratio, 1.0, 20.0),
            ("attack_ms", self.attack_ms, 0.1, 100.0),
            ("release_ms", self.release_ms, 10.0, 1000.0),
            ("knee_db", self.knee_db, 0.0, 12.0),
            ("makeup_gain_db", self.makeup_gain_db, 0.0, 24.0),
        ];
        for (name, value, min, max) in checks {
            if !(min..=max).contains(&value) {
                return Err(SongError::InvalidConfig {
                    reason: format!(
                        "compressor {} = {} (expected {} to {})",
                        name, value, min, max
                    ),
                });
            }
        }
        Ok(())
    }

    /// Gain reduction in dB (<= 0) for a detector level in dB
    fn gain_reduction_db(&self, input_db: f32) -> f32 {
        let threshold = self.threshold_db;
        let ratio = self.ratio;
        let knee = self.knee_db;

        if knee > 0.0 {
            let knee_start = threshold - knee / 2.0;
            let knee_end = threshold + knee / 2.0;

            if input_db <= knee_start {
                0.0
            } else if input_db >= knee_end {
                (threshold + (input_db - threshold) / ratio) - input_db
            } else {
                // ratio ramps quadratically from 1:1 across the knee
                let knee_factor = (input_db - knee_start) / knee;
                let effective_ratio = 1.0 + (ratio - 1.0) * knee_factor * knee_factor;
                (knee_start + (input_db - knee_start) / effective_ratio) - input_db
            }
        } else if input_db <= threshold {
            0.0
        } else {
            (threshold + (input_db - threshold) / ratio) - input_db
        }
    }
}

/// Compressor dynamics processor (linked across channels)
#[derive(Debug, Clone)]
pub struct Compressor {
    params: CompressorParams,
    /// Detector high-pass corner; `Some` turns this into a de-esser
    sidechain_hz: Option<f32>,
    sample_rate: u32,
    attack_coeff: f32,
    release_coeff: f32,
    gain: f32,
    sidechain_coeffs: BiquadCoeffs,
    sidechain_states: Vec<BiquadState>,
}

impl Compressor {
    pub fn new(params: CompressorParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            sidechain_hz: None,
            sample_rate: 0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            gain: 1.0,
            sidechain_coeffs: BiquadCoeffs::BYPASS,
            sidechain_states: Vec::new(),
        })
    }

    /// Compressor keyed only on content above `sidechain_hz`
    pub fn de_esser(params: CompressorParams, sidechain_hz: f32) -> Result<Self> {
        let mut comp = Self::new(params)?;
        comp.sidechain_hz = Some(sidechain_hz);
        Ok(comp)
    }

    pub fn params(&self) -> &CompressorParams {
        &self.params
    }

    /// Current gain applied by the envelope, in dB
    pub fn gain_reduction_db(&self) -> f32 {
        20.0 * self.gain.max(1e-6).log10()
    }

    fn update_coefficients(&mut self) {
        // coeff = exp(-1 / time_in_samples)
        let attack_samples = (self.params.attack_ms / 1000.0) * self.sample_rate as f32;
        let release_samples = (self.params.release_ms / 1000.0) * self.sample_rate as f32;

        self.attack_coeff = if attack_samples > 0.0 {
            (-1.0 / attack_samples).exp()
        } else {
            0.0
        };
        self.release_coeff = if release_samples > 0.0 {
            (-1.0 / release_samples).exp()
        } else {
            0.0
        };

        self.sidechain_coeffs = match self.sidechain_hz {
            Some(hz) => BiquadCoeffs::calculate(
                FilterType::HighPass,
                self.sample_rate as f64,
                hz as f64,
                0.0,
                0.707,
            ),
            None => BiquadCoeffs::BYPASS,
        };
    }
}

impl Effect for Compressor {
    fn process(&mut self, buffer: &mut AudioBuffer) {
        if self.sample_rate != buffer.sample_rate || self.sidechain_states.len() != buffer.channels()
        {
            self.prepare(buffer.sample_rate, buffer.channels());
        }

        let makeup = db_to_linear(self.params.makeup_gain_db);
        let channels = buffer.channels();

        for frame in 0..buffer.len() {
            // Linked detection: loudest channel drives the gain
            let mut level: f32 = 0.0;
            for ch in 0..channels {
                let sample = buffer.samples[ch][frame] as f64;
                let detected = if self.sidechain_hz.is_some() {
                    self.sidechain_states[ch].process(sample, &self.sidechain_coeffs)
                } else {
                    sample
                };
                level = level.max(detected.abs() as f32);
            }

            let input_db = if level > 0.0 {
                20.0 * level.log10()
            } else {
                -96.0
            };
            let target = db_to_linear(self.params.gain_reduction_db(input_db));

            let coeff = if target < self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain = coeff * self.gain + (1.0 - coeff) * target;

            let total = self.gain * makeup;
            for ch in 0..channels {
                buffer.samples[ch][frame] *= total;
            }
        }
    }

    fn prepare(&mut self, sample_rate: u32, channels: usize) {
        self.sample_rate = sample_rate;
        self.sidechain_states = vec![BiquadState::default(); channels];
        self.update_coefficients();
    }

    fn reset(&mut self) {
        self.gain = 1.0;
        for state in &mut self.sidechain_states {
            state.reset();
        }
    }

    fn effect_type(&self) -> &'static str {
        if self.sidechain_hz.is_some() {
            "de-esser"
        } else {
            "compressor"
        }
    }

    fn box_clone(&self) -> Box<dyn Effect> {
        Box::new(self.clone())
    }
}
