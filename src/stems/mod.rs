//! Stem separation, enhancement and re-mixing
//!
//! A clip is split into named stems, each stem runs through the chain for
//! its instrument class, and the stems are summed back at fixed volumes.
//! Energy is checked after every step so a degenerate separation or an
//! enhancement that zeroes a stem set is caught where it happens.

pub mod chains;
pub mod filterbank;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, StemVolumes};
use crate::dsp::ChainSpec;
use crate::engine::{AudioBuffer, AudioValidator};
use crate::error::{Result, SongError};

pub use filterbank::FilterBankSeparator;

/// Named stems, ordered by name
pub type Stems = BTreeMap<String, AudioBuffer>;

/// Source separation model
pub trait StemSeparator: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Names this separator produces
    fn stem_names(&self) -> Vec<String>;

    fn separate(&self, waveform: &AudioBuffer) -> Result<Stems>;
}

/// Runs an effect chain over a stem
pub trait EffectsEngine: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn apply_chain(&self, waveform: &AudioBuffer, chain: &ChainSpec) -> Result<AudioBuffer>;
}

/// Instrument class of a stem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemClass {
    Vocals,
    Drums,
    Bass,
    Other,
    Unknown,
}

impl StemClass {
    pub fn classify(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "vocals" | "vocal" | "voice" => StemClass::Vocals,
            "drums" | "drum" | "percussion" => StemClass::Drums,
            "bass" => StemClass::Bass,
            "other" | "accompaniment" => StemClass::Other,
            _ => StemClass::Unknown,
        }
    }

    /// Mix volume for this class
    pub fn volume(&self, volumes: &StemVolumes) -> f32 {
        match self {
            StemClass::Vocals => volumes.vocals,
            StemClass::Drums => volumes.drums,
            StemClass::Bass => volumes.bass,
            StemClass::Other => volumes.other,
            StemClass::Unknown => volumes.unknown,
        }
    }
}

impl fmt::Display for StemClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StemClass::Vocals => "vocals",
            StemClass::Drums => "drums",
            StemClass::Bass => "bass",
            StemClass::Other => "other",
            StemClass::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Sum of per-stem peaks
pub fn stem_energy(stems: &Stems) -> f32 {
    stems.values().map(AudioBuffer::peak).sum()
}

/// Stems below this peak are left out of the mix
const EMPTY_STEM_PEAK: f32 = 1e-6;

/// Sum stems at their class volumes
///
/// Empty stems are skipped. The result is scaled down to `peak_limit`
/// only if it exceeds it.
pub fn mix_stems(stems: &Stems, volumes: &StemVolumes, peak_limit: f32) -> Result<AudioBuffer> {
    let Some(reference) = stems.values().next() else {
        return Err(SongError::InvalidAudio {
            reason: "no stems to mix".to_string(),
        });
    };
    let layout = reference
        .channel_layout()
        .ok_or_else(|| SongError::InvalidAudio {
            reason: format!("stem has {} channels", reference.channels()),
        })?;
    let mut mixed = AudioBuffer::silence(reference.len(), layout, reference.sample_rate);

    for (name, stem) in stems {
        let peak = stem.peak();
        if peak < EMPTY_STEM_PEAK {
            debug!(stem = %name, "skipping empty stem");
            continue;
        }
        let volume = StemClass::classify(name).volume(volumes);
        debug!(stem = %name, volume, peak, "adding stem");
        mixed.add_scaled(stem, volume)?;
    }

    let peak = mixed.peak();
    if peak > peak_limit {
        mixed.apply_gain(peak_limit / peak);
        debug!(peak_before = peak, peak_limit, "normalized stem mix");
    }
    Ok(mixed)
}

/// Result of the enhancement step
#[derive(Debug, Clone)]
pub struct Enhanced {
    pub stems: Stems,
    /// Set when stems passed through because the engine was unavailable
    pub bypass_reason: Option<String>,
}

/// Separation, enhancement and mixing for one clip at a time
pub struct StemProcessor {
    separator: Arc<dyn StemSeparator>,
    effects: Arc<dyn EffectsEngine>,
    validator: AudioValidator,
    energy_floor: f32,
    volumes: StemVolumes,
    mix_peak_limit: f32,
    pool: rayon::ThreadPool,
}

impl StemProcessor {
    pub fn new(
        separator: Arc<dyn StemSeparator>,
        effects: Arc<dyn EffectsEngine>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.stems.worker_threads.max(1))
            .thread_name(|i| format!("songchain-enhance-{}", i))
            .build()
            .map_err(|e| SongError::InvalidConfig {
                reason: format!("cannot start enhancement workers: {}", e),
            })?;
        Ok(Self {
            separator,
            effects,
            validator: config.validator(),
            energy_floor: config.validation.stem_energy_floor,
            volumes: config.stems.volumes.clone(),
            mix_peak_limit: config.stems.mix_peak_limit,
            pool,
        })
    }

    pub fn separator_name(&self) -> &str {
        self.separator.name()
    }

    /// Split a validated clip into stems
    ///
    /// Stems are conformed to the input's length and layout. A stem set
    /// whose summed peak is under the floor is a hard error.
    pub fn separate(&self, clip_index: usize, waveform: &AudioBuffer) -> Result<Stems> {
        if !self.separator.is_available() {
            return Err(SongError::backend(
                "separator",
                format!("{} is not available", self.separator.name()),
            ));
        }
        let layout = waveform
            .channel_layout()
            .ok_or_else(|| SongError::InvalidAudio {
                reason: format!("clip has {} channels", waveform.channels()),
            })?;

        let start = Instant::now();
        let raw = self.separator.separate(waveform)?;

        let mut stems = Stems::new();
        for (name, stem) in raw {
            waveform.ensure_same_rate(&stem)?;
            if stem.has_non_finite() {
                return Err(SongError::InvalidAudio {
                    reason: format!("stem '{}' contains non-finite samples", name),
                });
            }
            let mut stem = stem.to_layout(layout);
            if stem.len() != waveform.len() {
                debug!(stem = %name, got = stem.len(), want = waveform.len(), "conforming stem length");
                stem.resize_frames(waveform.len());
            }
            stems.insert(name, stem);
        }

        let energy = stem_energy(&stems);
        info!(
            clip = clip_index,
            separator = self.separator.name(),
            stems = stems.len(),
            energy,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "separated"
        );
        if energy < self.energy_floor {
            return Err(SongError::SeparationDegenerate {
                clip_index,
                stem_energy: energy,
                floor: self.energy_floor,
            });
        }
        Ok(stems)
    }

    /// Run every stem through its class chain, in parallel
    pub fn enhance(&self, clip_index: usize, stems: Stems) -> Result<Enhanced> {
        if !self.effects.is_available() {
            let reason = format!(
                "effects engine '{}' unavailable; stems passed through unprocessed",
                self.effects.name()
            );
            warn!(clip = clip_index, "{}", reason);
            self.check_energy(clip_index, &stems)?;
            return Ok(Enhanced {
                stems,
                bypass_reason: Some(reason),
            });
        }

        let start = Instant::now();
        let effects = &self.effects;
        let processed = self.pool.install(|| {
            stems
                .par_iter()
                .map(|(name, stem)| {
                    let chain = chains::chain_for(StemClass::classify(name));
                    effects
                        .apply_chain(stem, &chain)
                        .map(|out| (name.clone(), out))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        let stems: Stems = processed.into_iter().collect();

        debug!(
            clip = clip_index,
            engine = self.effects.name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "stems enhanced"
        );
        self.check_energy(clip_index, &stems)?;
        Ok(Enhanced {
            stems,
            bypass_reason: None,
        })
    }

    /// Sum stems back into one clip and validate it
    pub fn mix(&self, clip_index: usize, stems: &Stems) -> Result<AudioBuffer> {
        let mixed = mix_stems(stems, &self.volumes, self.mix_peak_limit)?;
        self.validator
            .assert_valid(&mixed, "post-mix", Some(clip_index))?;
        Ok(mixed)
    }

    fn check_energy(&self, clip_index: usize, stems: &Stems) -> Result<()> {
        let energy = stem_energy(stems);
        if energy < self.energy_floor {
            let rms = stems.values().map(AudioBuffer::rms).fold(0.0_f32, f32::max);
            return Err(SongError::silent("post-enhancement", Some(clip_index), energy, rms));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{DegenerateSeparator, UnavailableEffects};
    use crate::dsp::DspEffectsEngine;
    use crate::engine::generate_test_tone;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn processor(separator: Arc<dyn StemSeparator>, effects: Arc<dyn EffectsEngine>) -> StemProcessor {
        let mut config = PipelineConfig::default();
        config.stems.worker_threads = 2;
        StemProcessor::new(separator, effects, &config).unwrap()
    }

    #[test_case("vocals", StemClass::Vocals)]
    #[test_case("Drums", StemClass::Drums)]
    #[test_case("bass", StemClass::Bass)]
    #[test_case("other", StemClass::Other)]
    #[test_case("piano", StemClass::Unknown)]
    fn test_classify(name: &str, expected: StemClass) {
        assert_eq!(StemClass::classify(name), expected);
    }

    #[test]
    fn test_mix_applies_volumes_and_skips_empty() {
        let mut stems = Stems::new();
        stems.insert("vocals".into(), AudioBuffer::from_mono(vec![0.2; 8], 8_000));
        stems.insert("bass".into(), AudioBuffer::from_mono(vec![0.1; 8], 8_000));
        stems.insert("drums".into(), AudioBuffer::from_mono(vec![0.0; 8], 8_000));
        let mixed = mix_stems(&stems, &StemVolumes::default(), 0.95).unwrap();
        assert_relative_eq!(mixed.samples[0][0], 0.2 + 0.08, epsilon = 1e-6);
    }

    #[test]
    fn test_mix_normalizes_only_above_limit() {
        let mut stems = Stems::new();
        stems.insert("vocals".into(), AudioBuffer::from_mono(vec![0.9; 8], 8_000));
        stems.insert("other".into(), AudioBuffer::from_mono(vec![0.8; 8], 8_000));
        let mixed = mix_stems(&stems, &StemVolumes::default(), 0.95).unwrap();
        assert_relative_eq!(mixed.peak(), 0.95, epsilon = 1e-6);
    }

    #[test]
    fn test_degenerate_separation_is_hard_error() {
        let processor = processor(Arc::new(DegenerateSeparator), Arc::new(DspEffectsEngine));
        let input = generate_test_tone(440.0, 0.1, 8_000);
        let err = processor.separate(1, &input).unwrap_err();
        assert!(matches!(
            err,
            SongError::SeparationDegenerate { clip_index: 1, .. }
        ));
    }

    #[test]
    fn test_unavailable_effects_pass_through() {
        let processor = processor(Arc::new(FilterBankSeparator::new()), Arc::new(UnavailableEffects));
        let input = generate_test_tone(440.0, 0.2, 16_000);
        let stems = processor.separate(0, &input).unwrap();
        let enhanced = processor.enhance(0, stems.clone()).unwrap();
        assert!(enhanced.bypass_reason.is_some());
        assert_eq!(enhanced.stems, stems);
    }

    #[test]
    fn test_full_stem_path_keeps_length() {
        let processor = processor(Arc::new(FilterBankSeparator::new()), Arc::new(DspEffectsEngine));
        let input = generate_test_tone(440.0, 0.25, 16_000);
        let stems = processor.separate(0, &input).unwrap();
        let enhanced = processor.enhance(0, stems).unwrap();
        assert!(enhanced.bypass_reason.is_none());
        let mixed = processor.mix(0, &enhanced.stems).unwrap();
        assert_eq!(mixed.len(), input.len());
        assert!(mixed.peak() <= 0.95 + 1e-6);
    }
}
