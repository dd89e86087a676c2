//! Enhancement chain presets per stem class

use crate::dsp::{ChainSpec, CompressorParams, EQBand, EffectSpec};
use crate::stems::StemClass;

/// Presence boost with de-essing
pub fn vocal_chain() -> ChainSpec {
    ChainSpec::new(
        "vocal",
        vec![
            EffectSpec::DeEsser {
                params: CompressorParams::new(-24.0, 8.0, 0.1, 50.0),
                sidechain_hz: 5000.0,
            },
            EffectSpec::Eq {
                bands: vec![EQBand::peak(3000.0, 2.0, 0.7)],
            },
            EffectSpec::Compressor {
                params: CompressorParams::new(-18.0, 3.0, 5.0, 100.0),
            },
            EffectSpec::Gain { gain_db: 2.0 },
        ],
    )
}

/// Low-end weight
pub fn bass_chain() -> ChainSpec {
    ChainSpec::new(
        "bass",
        vec![
            EffectSpec::Eq {
                bands: vec![EQBand::low_shelf(150.0, 3.0)],
            },
            EffectSpec::Compressor {
                params: CompressorParams::new(-20.0, 4.0, 10.0, 100.0),
            },
            EffectSpec::Gain { gain_db: 2.0 },
        ],
    )
}

/// Fast attack keeps transients
pub fn drum_chain() -> ChainSpec {
    ChainSpec::new(
        "drums",
        vec![
            EffectSpec::Eq {
                bands: vec![EQBand::high_shelf(5000.0, 2.0)],
            },
            EffectSpec::Compressor {
                params: CompressorParams::new(-18.0, 6.0, 1.0, 100.0),
            },
            EffectSpec::Gain { gain_db: 1.5 },
        ],
    )
}

pub fn general_chain() -> ChainSpec {
    ChainSpec::new(
        "general",
        vec![
            EffectSpec::Compressor {
                params: CompressorParams::new(-16.0, 3.0, 10.0, 100.0),
            },
            EffectSpec::Gain { gain_db: 1.0 },
        ],
    )
}

/// Chain for a stem class
pub fn chain_for(class: StemClass) -> ChainSpec {
    match class {
        StemClass::Vocals => vocal_chain(),
        StemClass::Bass => bass_chain(),
        StemClass::Drums => drum_chain(),
        StemClass::Other | StemClass::Unknown => general_chain(),
    }
}
