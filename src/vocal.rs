//! Vocal composition for backends that cannot sing
//!
//! Lyrics are cleaned for a text-to-speech style synthesizer, rendered to
//! a vocal waveform and summed with the instrumental at a fixed balance.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{call_with_deadline, CallContext, Interrupted};
use crate::config::VocalConfig;
use crate::engine::{AudioBuffer, AudioValidator};
use crate::error::{Result, SongError};
use crate::request::StyleHints;
use crate::song::Stage;

/// Text-to-singing engine
pub trait VocalSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn synthesize(&self, text: &str, style: &StyleHints) -> Result<AudioBuffer>;
}

/// Lyrics ready for synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedLyrics {
    pub text: String,
    /// Characters dropped by the length cap
    pub truncated_chars: usize,
}

/// Strip `[Section]` markers, collapse whitespace, cap length in characters
pub fn prepare_lyrics(raw: &str, max_chars: usize) -> PreparedLyrics {
    let mut stripped = String::with_capacity(raw.len());
    let mut depth = 0usize;
    for c in raw.chars() {
        match c {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => stripped.push(c),
            _ => {}
        }
    }

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let total = collapsed.chars().count();
    if total <= max_chars {
        return PreparedLyrics {
            text: collapsed,
            truncated_chars: 0,
        };
    }

    warn!(from = total, to = max_chars, "lyrics truncated");
    PreparedLyrics {
        text: collapsed.chars().take(max_chars).collect(),
        truncated_chars: total - max_chars,
    }
}

/// Gains actually applied by a vocal mix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VocalMix {
    pub vocal_gain: f32,
    pub instrumental_gain: f32,
    /// Extra scale applied to keep the peak within the limit, 1.0 if none
    pub normalization_gain: f32,
}

/// A mixed waveform and how it was mixed
#[derive(Debug, Clone)]
pub struct MixedVocals {
    pub waveform: AudioBuffer,
    pub mix: VocalMix,
}

/// Renders lyrics and lays them over an instrumental
#[derive(Clone)]
pub struct VocalCompositor {
    synth: Arc<dyn VocalSynthesizer>,
    config: VocalConfig,
    validator: AudioValidator,
}

impl VocalCompositor {
    pub fn new(synth: Arc<dyn VocalSynthesizer>, config: VocalConfig, validator: AudioValidator) -> Self {
        Self {
            synth,
            config,
            validator,
        }
    }

    pub fn synthesizer_name(&self) -> &str {
        self.synth.name()
    }

    /// Synthesize the vocal line for `lyrics`
    ///
    /// A vocal below the validity floor is a synthesis failure.
    pub fn compose(&self, lyrics: &str, style: &StyleHints, ctx: &CallContext<'_>) -> Result<AudioBuffer> {
        if !self.synth.is_available() {
            return Err(SongError::backend(
                "vocals",
                format!("{} is not available", self.synth.name()),
            ));
        }
        let prepared = prepare_lyrics(lyrics, self.config.max_lyric_chars);
        if prepared.text.is_empty() {
            return Err(SongError::backend("vocals", "no singable text after removing section markers"));
        }

        let start = Instant::now();
        let synth = Arc::clone(&self.synth);
        let style = style.clone();
        let text = prepared.text;
        let chars = text.chars().count();
        let vocal = match call_with_deadline(
            "vocals",
            move || synth.synthesize(&text, &style),
            ctx.timeout,
            ctx.cancel,
        ) {
            Ok(result) => result?,
            Err(Interrupted::Cancelled) => {
                return Err(SongError::Cancelled {
                    stage: Stage::Generating,
                })
            }
            Err(Interrupted::Timeout) => {
                return Err(SongError::backend(
                    "vocals",
                    format!("no result after {} ms", ctx.timeout.as_millis()),
                ))
            }
            Err(other) => return Err(SongError::backend("vocals", format!("{:?}", other))),
        };

        info!(
            synth = self.synth.name(),
            chars,
            secs = vocal.duration_secs(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "vocals synthesized"
        );
        self.validator.assert_valid(&vocal, "vocal-synthesis", None)?;
        Ok(vocal)
    }

    /// Sum `vocal` over `instrumental` at the configured gains
    ///
    /// The vocal is converted to the instrumental's rate and layout; the
    /// shorter buffer is zero-padded; the peak is pulled down to
    /// `mix_peak` only if it exceeds it.
    pub fn mix_with_instrumental(&self, instrumental: &AudioBuffer, vocal: &AudioBuffer) -> Result<MixedVocals> {
        let layout = instrumental
            .channel_layout()
            .ok_or_else(|| SongError::InvalidAudio {
                reason: format!("instrumental has {} channels", instrumental.channels()),
            })?;
        let mut vocal = vocal.resample(instrumental.sample_rate).to_layout(layout);
        let mut mixed = instrumental.clone();
        let frames = mixed.len().max(vocal.len());
        mixed.resize_frames(frames);
        vocal.resize_frames(frames);

        mixed.apply_gain(self.config.instrumental_gain);
        mixed.add_scaled(&vocal, self.config.vocal_gain)?;

        let peak = mixed.peak();
        let normalization_gain = if peak > self.config.mix_peak {
            self.config.mix_peak / peak
        } else {
            1.0
        };
        if normalization_gain < 1.0 {
            mixed.apply_gain(normalization_gain);
        }
        debug!(
            peak_before = peak,
            normalization_gain,
            frames,
            "vocals mixed with instrumental"
        );

        Ok(MixedVocals {
            waveform: mixed,
            mix: VocalMix {
                vocal_gain: self.config.vocal_gain,
                instrumental_gain: self.config.instrumental_gain,
                normalization_gain,
            },
        })
    }
}
