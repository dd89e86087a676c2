//! Effect chains
//!
//! A [`ChainSpec`] is the serializable description handed to an effects
//! engine: a name plus an ordered list of stages. [`EffectChain`] is the
//! built, runnable form. Stages run in order, index 0 first.

use serde::{Deserialize, Serialize};

use crate::dsp::compressor::{Compressor, CompressorParams};
use crate::dsp::effect::Effect;
use crate::dsp::eq::{EQBand, ParametricEQ};
use crate::dsp::gain::Gain;
use crate::engine::AudioBuffer;
use crate::error::Result;

/// One stage of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectSpec {
    Gain { gain_db: f32 },
    Eq { bands: Vec<EQBand> },
    Compressor { params: CompressorParams },
    DeEsser { params: CompressorParams, sidechain_hz: f32 },
}

impl EffectSpec {
    /// Build the runnable effect
    pub fn build(&self) -> Result<Box<dyn Effect>> {
        Ok(match self {
            EffectSpec::Gain { gain_db } => Box::new(Gain::new(*gain_db)),
            EffectSpec::Eq { bands } => Box::new(ParametricEQ::with_bands(bands.clone())?),
            EffectSpec::Compressor { params } => Box::new(Compressor::new(*params)?),
            EffectSpec::DeEsser {
                params,
                sidechain_hz,
            } => Box::new(Compressor::de_esser(*params, *sidechain_hz)?),
        })
    }
}

/// Named, ordered chain description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub effects: Vec<EffectSpec>,
}

impl ChainSpec {
    pub fn new(name: impl Into<String>, effects: Vec<EffectSpec>) -> Self {
        Self {
            name: name.into(),
            effects,
        }
    }
}

/// Chain of effects for processing
#[derive(Clone, Default)]
pub struct EffectChain {
    effects: Vec<Box<dyn Effect>>,
}

impl EffectChain {
    /// Create a new empty effect chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every stage of a description
    pub fn from_spec(spec: &ChainSpec) -> Result<Self> {
        let effects = spec
            .effects
            .iter()
            .map(EffectSpec::build)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { effects })
    }

    /// Append an effect at the end
    pub fn push(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
    }

    /// Prepare all effects for processing
    pub fn prepare(&mut self, sample_rate: u32, channels: usize) {
        for effect in &mut self.effects {
            effect.prepare(sample_rate, channels);
        }
    }

    /// Reset all effects
    pub fn reset(&mut self) {
        for effect in &mut self.effects {
            effect.reset();
        }
    }

    /// Process the entire chain in order
    pub fn process(&mut self, buffer: &mut AudioBuffer) {
        self.prepare(buffer.sample_rate, buffer.channels());
        for effect in &mut self.effects {
            effect.process(buffer);
        }
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Effect type identifiers in processing order
    pub fn effect_types(&self) -> Vec<&'static str> {
        self.effects.iter().map(|e| e.effect_type()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_chain_new() {
        let chain = EffectChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn test_from_spec_keeps_order() {
        let spec = ChainSpec::new(
            "test",
            vec![
                EffectSpec::Eq {
                    bands: vec![EQBand::high_shelf(5000.0, 2.0)],
                },
                EffectSpec::Compressor {
                    params: CompressorParams::default(),
                },
                EffectSpec::Gain { gain_db: 1.5 },
            ],
        );
        let chain = EffectChain::from_spec(&spec).unwrap();
        assert_eq!(
            chain.effect_types(),
            vec!["parametric-eq", "compressor", "gain"]
        );
    }

    #[test]
    fn test_invalid_stage_rejected() {
        let spec = ChainSpec::new(
            "bad",
            vec![EffectSpec::Compressor {
                params: CompressorParams::new(-18.0, 50.0, 10.0, 100.0),
            }],
        );
        assert!(EffectChain::from_spec(&spec).is_err());
    }

    #[test]
    fn test_spec_json_shape() {
        let spec = EffectSpec::Gain { gain_db: 2.0 };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "gain");
        let back: EffectSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
