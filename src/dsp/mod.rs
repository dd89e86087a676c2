//! DSP Effects Library
//!
//! Gain, filter and dynamics stages used by the stem enhancement chains,
//! and the in-process effects engine that runs them.

mod chain;
mod compressor;
mod effect;
mod eq;
mod gain;

pub use chain::{ChainSpec, EffectChain, EffectSpec};
pub use compressor::{Compressor, CompressorParams};
pub use effect::Effect;
pub use eq::{EQBand, FilterType, ParametricEQ};
pub use gain::Gain;

use crate::engine::AudioBuffer;
use crate::error::Result;
use crate::stems::EffectsEngine;

/// Effects engine that runs chains in-process
#[derive(Debug, Clone, Copy, Default)]
pub struct DspEffectsEngine;

impl EffectsEngine for DspEffectsEngine {
    fn name(&self) -> &str {
        "dsp"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn apply_chain(&self, waveform: &AudioBuffer, chain: &ChainSpec) -> Result<AudioBuffer> {
        let mut effects = EffectChain::from_spec(chain)?;
        let mut output = waveform.clone();
        effects.process(&mut output);
        Ok(output)
    }
}
