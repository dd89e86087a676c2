//! Gain Effect
//!
//! Static gain stage with a dB interface.

use crate::dsp::effect::Effect;
use crate::engine::buffer::db_to_linear;
use crate::engine::AudioBuffer;

/// Minimum gain in dB (-96 dB = effectively silent)
const MIN_GAIN_DB: f32 = -96.0;

/// Maximum gain in dB (+24 dB)
const MAX_GAIN_DB: f32 = 24.0;

/// Simple gain adjustment effect
#[derive(Debug, Clone)]
pub struct Gain {
    gain_db: f32,
    gain_linear: f32,
}

impl Gain {
    /// Create a new gain effect, clamped to -96..+24 dB
    pub fn new(gain_db: f32) -> Self {
        let clamped = gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
        Self {
            gain_db: clamped,
            gain_linear: db_to_linear(clamped),
        }
    }

    /// Get the current gain in decibels
    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Get the current linear gain multiplier
    pub fn gain_linear(&self) -> f32 {
        self.gain_linear
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Effect for Gain {
    fn process(&mut self, buffer: &mut AudioBuffer) {
        // Unity gain optimization
        if (self.gain_linear - 1.0).abs() < f32::EPSILON {
            return;
        }
        buffer.apply_gain(self.gain_linear);
    }

    fn prepare(&mut self, _sample_rate: u32, _channels: usize) {}

    fn reset(&mut self) {}

    fn effect_type(&self) -> &'static str {
        "gain"
    }

    fn box_clone(&self) -> Box<dyn Effect> {
        Box::new(self.clone())
    }
}
