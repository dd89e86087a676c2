//! Effect trait definition
//!
//! Base trait for the gain, filter and dynamics stages that make up a
//! stem enhancement chain.

use crate::engine::AudioBuffer;

/// Base trait for all DSP effects
///
/// Effects process audio buffers in-place. `prepare` is always called with
/// the buffer's sample rate before the first `process`.
pub trait Effect: Send + Sync {
    /// Process audio buffer in-place
    fn process(&mut self, buffer: &mut AudioBuffer);

    /// Prepare the effect for the given sample rate and channel count
    fn prepare(&mut self, sample_rate: u32, channels: usize);

    /// Clear filter history and envelopes
    fn reset(&mut self);

    /// Get the effect type identifier
    fn effect_type(&self) -> &'static str;

    /// Clone the effect into a boxed trait object
    fn box_clone(&self) -> Box<dyn Effect>;
}

impl Clone for Box<dyn Effect> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

impl std::fmt::Debug for dyn Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Effect({})", self.effect_type())
    }
}
