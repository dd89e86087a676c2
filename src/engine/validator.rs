//! Audio validity checks
//!
//! Every stage boundary in the pipeline runs a waveform through
//! [`AudioValidator::assert_valid`]. A failing check is an error; nothing
//! downstream may replace the waveform with synthetic silence.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::buffer::{linear_to_db, AudioBuffer};
use crate::error::{Result, SongError};

/// Default minimum absolute peak for a waveform to count as signal
pub const DEFAULT_MIN_PEAK: f32 = 1e-3;

/// Default minimum RMS for a waveform to count as signal
pub const DEFAULT_MIN_RMS: f32 = 1e-4;

/// Measured levels of a waveform (linear)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalLevels {
    pub peak: f32,
    pub rms: f32,
}

impl SignalLevels {
    /// Measure a buffer
    pub fn measure(waveform: &AudioBuffer) -> Self {
        Self {
            peak: waveform.peak(),
            rms: waveform.rms(),
        }
    }

    /// Peak in dBFS
    pub fn peak_db(&self) -> f32 {
        linear_to_db(self.peak)
    }

    /// RMS in dBFS
    pub fn rms_db(&self) -> f32 {
        linear_to_db(self.rms)
    }
}

/// Pure check: finite samples, peak and RMS at or above their floors
pub fn is_valid(waveform: &AudioBuffer, min_peak_threshold: f32, min_rms_threshold: f32) -> bool {
    if waveform.is_empty() || waveform.has_non_finite() {
        return false;
    }
    waveform.peak() >= min_peak_threshold && waveform.rms() >= min_rms_threshold
}

/// Validity floor applied at stage boundaries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioValidator {
    pub min_peak: f32,
    pub min_rms: f32,
}

impl Default for AudioValidator {
    fn default() -> Self {
        Self {
            min_peak: DEFAULT_MIN_PEAK,
            min_rms: DEFAULT_MIN_RMS,
        }
    }
}

impl AudioValidator {
    pub fn new(min_peak: f32, min_rms: f32) -> Self {
        Self { min_peak, min_rms }
    }

    /// Check a waveform against this validator's floors
    pub fn is_valid(&self, waveform: &AudioBuffer) -> bool {
        is_valid(waveform, self.min_peak, self.min_rms)
    }

    /// Check a waveform and fail with the stage label and measured levels
    ///
    /// Logs peak and RMS on every call. Non-finite samples are reported as
    /// `InvalidAudio`; an empty or below-floor waveform as `SilentAudio`.
    pub fn assert_valid(
        &self,
        waveform: &AudioBuffer,
        context_label: &str,
        clip_index: Option<usize>,
    ) -> Result<SignalLevels> {
        let levels = SignalLevels::measure(waveform);
        debug!(
            stage = context_label,
            clip = ?clip_index,
            peak = levels.peak,
            rms = levels.rms,
            frames = waveform.len(),
            "signal levels"
        );

        if waveform.has_non_finite() {
            warn!(stage = context_label, clip = ?clip_index, "non-finite samples");
            return Err(SongError::InvalidAudio {
                reason: format!("non-finite samples at {}", context_label),
            });
        }

        if waveform.is_empty() || levels.peak < self.min_peak || levels.rms < self.min_rms {
            warn!(
                stage = context_label,
                clip = ?clip_index,
                peak = levels.peak,
                rms = levels.rms,
                min_peak = self.min_peak,
                min_rms = self.min_rms,
                "waveform below validity floor"
            );
            return Err(SongError::silent(
                context_label,
                clip_index,
                levels.peak,
                levels.rms,
            ));
        }

        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::io::generate_test_tone;
    use test_case::test_case;

    #[test_case(0.5, true ; "normal level")]
    #[test_case(1e-3, true ; "exactly at peak floor")]
    #[test_case(9e-4, false ; "just below peak floor")]
    #[test_case(0.0, false ; "digital silence")]
    fn test_peak_threshold(amplitude: f32, expected: bool) {
        // a DC-free square wave keeps peak == rms so only the peak floor decides
        let samples = (0..800)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        let buffer = AudioBuffer::from_mono(samples, 8_000);
        assert_eq!(AudioValidator::default().is_valid(&buffer), expected);
    }

    #[test]
    fn test_never_passes_below_threshold() {
        let validator = AudioValidator::new(0.2, 0.0);
        for step in 0..20 {
            let amp = step as f32 * 0.01;
            let mut tone = generate_test_tone(100.0, 0.1, 8_000);
            tone.apply_gain(amp);
            if tone.peak() < 0.2 {
                assert!(!validator.is_valid(&tone), "amp {} passed", amp);
                assert!(validator.assert_valid(&tone, "post-mix", Some(0)).is_err());
            }
        }
    }

    #[test]
    fn test_assert_valid_reports_stage_and_levels() {
        let buffer = AudioBuffer::from_mono(vec![0.0; 100], 8_000);
        let err = AudioValidator::default()
            .assert_valid(&buffer, "post-generation", Some(3))
            .unwrap_err();
        match err {
            SongError::SilentAudio {
                stage,
                clip_index,
                peak,
                rms,
            } => {
                assert_eq!(stage, "post-generation");
                assert_eq!(clip_index, Some(3));
                assert_eq!(peak, 0.0);
                assert_eq!(rms, 0.0);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_nan_is_invalid() {
        let buffer = AudioBuffer::from_mono(vec![0.5, f32::NAN, 0.5], 8_000);
        assert!(!is_valid(&buffer, 0.0, 0.0));
        assert!(matches!(
            AudioValidator::default().assert_valid(&buffer, "post-generation", None),
            Err(SongError::InvalidAudio { .. })
        ));
    }

    #[test]
    fn test_empty_is_invalid() {
        let buffer = AudioBuffer::from_mono(Vec::new(), 8_000);
        assert!(!is_valid(&buffer, 0.0, 0.0));
    }

    #[test]
    fn test_valid_tone_returns_levels() {
        let mut tone = generate_test_tone(100.0, 0.5, 8_000);
        tone.apply_gain(0.5);
        let levels = AudioValidator::default()
            .assert_valid(&tone, "post-mix", Some(0))
            .unwrap();
        assert!(levels.peak > 0.49);
        assert!(levels.rms > 0.3);
    }
}
