//! Crossover separator
//!
//! Splits a mix into four bands with fixed filters. It is not a source
//! separation model, but it runs anywhere, needs no weights and its stems
//! always sum back to the input, so it serves offline runs and tests.

use crate::dsp::{EQBand, Effect, ParametricEQ};
use crate::engine::AudioBuffer;
use crate::error::Result;
use crate::stems::{StemSeparator, Stems};

/// Band edges in Hz
const BASS_CUTOFF_HZ: f32 = 250.0;
const VOCAL_LOW_HZ: f32 = 300.0;
const VOCAL_HIGH_HZ: f32 = 3400.0;
const DRUM_CUTOFF_HZ: f32 = 5000.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterBankSeparator;

impl FilterBankSeparator {
    pub fn new() -> Self {
        Self
    }
}

fn filtered(waveform: &AudioBuffer, bands: Vec<EQBand>) -> Result<AudioBuffer> {
    let mut eq = ParametricEQ::with_bands(bands)?;
    let mut out = waveform.clone();
    eq.prepare(out.sample_rate, out.channels());
    eq.process(&mut out);
    Ok(out)
}

impl StemSeparator for FilterBankSeparator {
    fn name(&self) -> &str {
        "filterbank"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn stem_names(&self) -> Vec<String> {
        ["bass", "vocals", "drums", "other"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn separate(&self, waveform: &AudioBuffer) -> Result<Stems> {
        let bass = filtered(waveform, vec![EQBand::low_pass(BASS_CUTOFF_HZ)])?;
        let vocals = filtered(
            waveform,
            vec![EQBand::high_pass(VOCAL_LOW_HZ), EQBand::low_pass(VOCAL_HIGH_HZ)],
        )?;
        let drums = filtered(waveform, vec![EQBand::high_pass(DRUM_CUTOFF_HZ)])?;

        // residual keeps the sum equal to the input
        let mut other = waveform.clone();
        other.add_scaled(&bass, -1.0)?;
        other.add_scaled(&vocals, -1.0)?;
        other.add_scaled(&drums, -1.0)?;

        let mut stems = Stems::new();
        stems.insert("bass".to_string(), bass);
        stems.insert("vocals".to_string(), vocals);
        stems.insert("drums".to_string(), drums);
        stems.insert("other".to_string(), other);
        Ok(stems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::generate_test_tone;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_stems_sum_to_input() {
        let input = generate_test_tone(440.0, 0.2, 16_000);
        let stems = FilterBankSeparator::new().separate(&input).unwrap();
        assert_eq!(stems.len(), 4);

        let mut sum = AudioBuffer::silence(input.len(), Default::default(), 16_000);
        for stem in stems.values() {
            sum.add_scaled(stem, 1.0).unwrap();
        }
        for (a, b) in sum.samples[0].iter().zip(input.samples[0].iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_low_tone_lands_in_bass() {
        let input = generate_test_tone(60.0, 0.5, 16_000);
        let stems = FilterBankSeparator::new().separate(&input).unwrap();
        assert!(stems["bass"].rms() > stems["drums"].rms() * 10.0);
    }
}
