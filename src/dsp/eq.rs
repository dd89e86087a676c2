//! Parametric EQ Effect
//!
//! Cascaded biquad filters. Supports peak, shelf and pass filters.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::dsp::effect::Effect;
use crate::engine::AudioBuffer;
use crate::error::{Result, SongError};

/// Filter type for EQ bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    /// Bell curve boost/cut
    #[default]
    Peak,
    /// Boost/cut below frequency
    LowShelf,
    /// Boost/cut above frequency
    HighShelf,
    /// Remove above frequency
    LowPass,
    /// Remove below frequency
    HighPass,
}

/// Biquad filter coefficients, normalized by a0
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl BiquadCoeffs {
    pub(crate) const BYPASS: BiquadCoeffs = BiquadCoeffs {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// Audio EQ Cookbook formulas
    /// Reference: https://www.w3.org/2011/audio/audio-eq-cookbook.html
    pub(crate) fn calculate(
        filter_type: FilterType,
        sample_rate: f64,
        frequency: f64,
        gain_db: f64,
        q: f64,
    ) -> Self {
        // Keep the corner below Nyquist even at low test rates
        let freq = frequency.clamp(10.0, sample_rate * 0.45);
        let q = q.clamp(0.1, 10.0);

        let w0 = 2.0 * PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 / (2.0 * q);
        let a = 10.0_f64.powf(gain_db / 40.0);

        let (b0, b1, b2, a0, a1, a2) = match filter_type {
            FilterType::Peak => (
                1.0 + alpha * a,
                -2.0 * cos_w0,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w0,
                1.0 - alpha / a,
            ),
            FilterType::LowShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                    (a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha,
                )
            }
            FilterType::HighShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                    (a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha,
                )
            }
            FilterType::LowPass => (
                (1.0 - cos_w0) / 2.0,
                1.0 - cos_w0,
                (1.0 - cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterType::HighPass => (
                (1.0 + cos_w0) / 2.0,
                -(1.0 + cos_w0),
                (1.0 + cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
        };

        BiquadCoeffs {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Biquad filter state for one channel (Direct Form I)
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BiquadState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl BiquadState {
    pub(crate) fn process(&mut self, input: f64, coeffs: &BiquadCoeffs) -> f64 {
        let output = coeffs.b0 * input + coeffs.b1 * self.x1 + coeffs.b2 * self.x2
            - coeffs.a1 * self.y1
            - coeffs.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;

        output
    }

    pub(crate) fn reset(&mut self) {
        *self = BiquadState::default();
    }
}

/// Single EQ band configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EQBand {
    /// Center/corner frequency in Hz
    pub frequency: f32,
    /// Gain in dB (-24 to +24); ignored by pass filters
    pub gain_db: f32,
    /// Q factor / bandwidth (0.1 to 10.0)
    pub q: f32,
    pub filter_type: FilterType,
}

impl EQBand {
    pub fn new(frequency: f32, gain_db: f32, q: f32, filter_type: FilterType) -> Self {
        Self {
            frequency,
            gain_db,
            q,
            filter_type,
        }
    }

    pub fn peak(frequency: f32, gain_db: f32, q: f32) -> Self {
        Self::new(frequency, gain_db, q, FilterType::Peak)
    }

    pub fn low_shelf(frequency: f32, gain_db: f32) -> Self {
        Self::new(frequency, gain_db, 0.707, FilterType::LowShelf)
    }

    pub fn high_shelf(frequency: f32, gain_db: f32) -> Self {
        Self::new(frequency, gain_db, 0.707, FilterType::HighShelf)
    }

    pub fn high_pass(frequency: f32) -> Self {
        Self::new(frequency, 0.0, 0.707, FilterType::HighPass)
    }

    pub fn low_pass(frequency: f32) -> Self {
        Self::new(frequency, 0.0, 0.707, FilterType::LowPass)
    }

    /// Validate band parameters
    pub fn validate(&self) -> Result<()> {
        if !(10.0..=20_000.0).contains(&self.frequency) {
            return Err(invalid_band("frequency", self.frequency, "10-20000 Hz"));
        }
        if !(-24.0..=24.0).contains(&self.gain_db) {
            return Err(invalid_band("gain_db", self.gain_db, "-24 to +24 dB"));
        }
        if !(0.1..=10.0).contains(&self.q) {
            return Err(invalid_band("q", self.q, "0.1 to 10.0"));
        }
        Ok(())
    }

    fn is_bypass(&self) -> bool {
        match self.filter_type {
            FilterType::Peak | FilterType::LowShelf | FilterType::HighShelf => {
                self.gain_db.abs() < 0.01
            }
            FilterType::LowPass | FilterType::HighPass => false,
        }
    }

    fn coefficients(&self, sample_rate: u32) -> BiquadCoeffs {
        if self.is_bypass() {
            return BiquadCoeffs::BYPASS;
        }
        BiquadCoeffs::calculate(
            self.filter_type,
            sample_rate as f64,
            self.frequency as f64,
            self.gain_db as f64,
            self.q as f64,
        )
    }
}

fn invalid_band(param: &str, value: f32, expected: &str) -> SongError {
    SongError::InvalidConfig {
        reason: format!("EQ band {} = {} (expected {})", param, value, expected),
    }
}

/// Per-band coefficients plus one filter state per channel
#[derive(Debug, Clone)]
struct BandState {
    coeffs: BiquadCoeffs,
    states: Vec<BiquadState>,
}

/// Parametric EQ effect
#[derive(Debug, Clone)]
pub struct ParametricEQ {
    bands: Vec<EQBand>,
    band_states: Vec<BandState>,
}

impl ParametricEQ {
    /// Create an EQ from validated bands
    pub fn with_bands(bands: Vec<EQBand>) -> Result<Self> {
        for band in &bands {
            band.validate()?;
        }
        Ok(Self {
            bands,
            band_states: Vec::new(),
        })
    }

    pub fn bands(&self) -> &[EQBand] {
        &self.bands
    }
}

impl Effect for ParametricEQ {
    fn process(&mut self, buffer: &mut AudioBuffer) {
        if self.band_states.len() != self.bands.len() {
            self.prepare(buffer.sample_rate, buffer.channels());
        }

        for (ch, channel) in buffer.samples.iter_mut().enumerate() {
            for sample in channel.iter_mut() {
                let mut output = *sample as f64;
                for band in &mut self.band_states {
                    if band.coeffs == BiquadCoeffs::BYPASS {
                        continue;
                    }
                    if let Some(state) = band.states.get_mut(ch) {
                        output = state.process(output, &band.coeffs);
                    }
                }
                *sample = output as f32;
            }
        }
    }

    fn prepare(&mut self, sample_rate: u32, channels: usize) {
        self.band_states = self
            .bands
            .iter()
            .map(|band| BandState {
                coeffs: band.coefficients(sample_rate),
                states: vec![BiquadState::default(); channels],
            })
            .collect();
    }

    fn reset(&mut self) {
        for band in &mut self.band_states {
            for state in &mut band.states {
                state.reset();
            }
        }
    }

    fn effect_type(&self) -> &'static str {
        "parametric-eq"
    }

    fn box_clone(&self) -> Box<dyn Effect> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::io::generate_test_tone;

    const RATE: u32 = 16_000;

    fn processed_rms(band: EQBand, frequency: f32) -> f32 {
        let mut tone = generate_test_tone(frequency, 1.0, RATE);
        let mut eq = ParametricEQ::with_bands(vec![band]).unwrap();
        eq.prepare(RATE, 1);
        eq.process(&mut tone);
        // skip the filter settling time
        tone.slice_frames(RATE as usize / 4, RATE as usize).rms()
    }

    #[test]
    fn test_band_validation() {
        assert!(EQBand::peak(1000.0, 6.0, 1.0).validate().is_ok());
        assert!(EQBand::peak(5.0, 0.0, 1.0).validate().is_err());
        assert!(EQBand::peak(1000.0, 30.0, 1.0).validate().is_err());
        assert!(EQBand::peak(1000.0, 0.0, 0.05).validate().is_err());
    }

    #[test]
    fn test_peak_boost_raises_level_at_center() {
        let dry = std::f32::consts::FRAC_1_SQRT_2;
        let boosted = processed_rms(EQBand::peak(1000.0, 6.0, 1.0), 1000.0);
        assert!(boosted > dry * 1.8, "boosted rms {}", boosted);
    }

    #[test]
    fn test_high_pass_removes_low_tone() {
        let rms = processed_rms(EQBand::high_pass(2000.0), 100.0);
        assert!(rms < 0.05, "rms {}", rms);
    }

    #[test]
    fn test_low_shelf_leaves_highs_alone() {
        let dry = std::f32::consts::FRAC_1_SQRT_2;
        let rms = processed_rms(EQBand::low_shelf(150.0, 3.0), 4000.0);
        assert!((rms - dry).abs() < 0.05, "rms {}", rms);
    }

    #[test]
    fn test_flat_band_is_bypass() {
        let mut tone = generate_test_tone(440.0, 0.1, RATE);
        let original = tone.clone();
        let mut eq = ParametricEQ::with_bands(vec![EQBand::peak(1000.0, 0.0, 1.0)]).unwrap();
        eq.prepare(RATE, 1);
        eq.process(&mut tone);
        assert_eq!(tone, original);
    }
}
