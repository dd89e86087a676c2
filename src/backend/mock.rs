//! Synthetic collaborators
//!
//! In-process stand-ins for every model: tone generators for the
//! backends and vocals, plus separators and effects engines that misbehave
//! on purpose. Used by tests and by `songchain-cli --synthetic`.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::backend::{
    BackendCapability, GenerationBackend, GenerationCall, GenerationFailure, HardwareProbe,
};
use crate::config::{BackendConfig, PipelineConfig};
use crate::dsp::ChainSpec;
use crate::engine::buffer::secs_to_frames;
use crate::engine::{AudioBuffer, ChannelLayout};
use crate::error::{GenerationFailureKind, Result, SongError};
use crate::registry::ModelRegistry;
use crate::request::StyleHints;
use crate::stems::{EffectsEngine, FilterBankSeparator, StemSeparator, Stems};
use crate::vocal::VocalSynthesizer;

/// What a synthetic backend saw for one call
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub prompt: String,
    pub lyrics: Option<String>,
    pub duration_secs: f64,
    pub conditioning_frames: Option<usize>,
    pub seed: Option<u64>,
}

/// Tone-generating backend with injectable faults
pub struct SyntheticBackend {
    name: String,
    capability: BackendCapability,
    available: bool,
    fail_initialize: bool,
    fail_on_call: Option<(usize, GenerationFailureKind)>,
    silent_on_call: Option<usize>,
    output_rate: Option<u32>,
    duration_offset_secs: f64,
    delay: Duration,
    calls: Mutex<Vec<CallRecord>>,
    initialized: AtomicUsize,
    released: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl SyntheticBackend {
    pub fn new(name: impl Into<String>, capability: BackendCapability) -> Self {
        Self {
            name: name.into(),
            capability,
            available: true,
            fail_initialize: false,
            fail_on_call: None,
            silent_on_call: None,
            output_rate: None,
            duration_offset_secs: 0.0,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            initialized: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn primary(config: &BackendConfig) -> Self {
        Self::new("synthetic-primary", BackendCapability::primary(config))
    }

    pub fn fallback(config: &BackendConfig) -> Self {
        Self::new("synthetic-fallback", BackendCapability::fallback(config))
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Fail the `call`-th generate call (0-based)
    pub fn fail_on_call(mut self, call: usize, kind: GenerationFailureKind) -> Self {
        self.fail_on_call = Some((call, kind));
        self
    }

    /// Return silence from the `call`-th generate call
    pub fn silent_on_call(mut self, call: usize) -> Self {
        self.silent_on_call = Some(call);
        self
    }

    /// Render at this rate instead of the requested one
    pub fn with_output_rate(mut self, rate: u32) -> Self {
        self.output_rate = Some(rate);
        self
    }

    /// Render this many seconds more (or less) than requested
    pub fn with_duration_offset(mut self, secs: f64) -> Self {
        self.duration_offset_secs = secs;
        self
    }

    /// Sleep before returning
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Most generate calls ever running at the same time
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn render(&self, call: &GenerationCall) -> std::result::Result<AudioBuffer, GenerationFailure> {
        let index = self.record(call);
        debug!(backend = %self.name, call = index, "synthetic generate");
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if let Some((fail_at, kind)) = self.fail_on_call {
            if fail_at == index {
                return Err(GenerationFailure::new(kind, format!("injected failure on call {}", index)));
            }
        }

        let rate = self.output_rate.unwrap_or(call.sample_rate);
        let secs = call.duration_secs + self.duration_offset_secs;
        if self.silent_on_call == Some(index) {
            return Ok(AudioBuffer::silence(secs_to_frames(secs, rate), call.layout, rate));
        }
        Ok(synthetic_clip(call, rate, secs, index))
    }

    fn record(&self, call: &GenerationCall) -> usize {
        let record = CallRecord {
            prompt: call.prompt.clone(),
            lyrics: call.lyrics.clone(),
            duration_secs: call.duration_secs,
            conditioning_frames: call.conditioning.as_ref().map(AudioBuffer::len),
            seed: call.params.seed,
        };
        match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(record);
                calls.len() - 1
            }
            Err(poisoned) => {
                let mut calls = poisoned.into_inner();
                calls.push(record);
                calls.len() - 1
            }
        }
    }
}

/// Deterministic multi-tone clip
///
/// The pitch set depends on `seed` and `index`, so the same request renders
/// the same audio.
pub fn synthetic_clip(call: &GenerationCall, rate: u32, secs: f64, index: usize) -> AudioBuffer {
    let frames = secs_to_frames(secs.max(0.0), rate);
    let step = (call.params.seed.unwrap_or(0) as usize + index) % 4;
    let fundamental = 220.0 * (1.0 + step as f32 * 0.25);
    let bass = 80.0;

    let mono: Vec<f32> = (0..frames)
        .map(|i| {
            let t = i as f32 / rate as f32;
            0.45 * (2.0 * PI * fundamental * t).sin()
                + 0.1 * (2.0 * PI * fundamental * 2.0 * t).sin()
                + 0.2 * (2.0 * PI * bass * t).sin()
        })
        .collect();
    AudioBuffer::from_mono(mono, rate).to_layout(call.layout)
}

impl GenerationBackend for SyntheticBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> BackendCapability {
        self.capability
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn initialize(&self) -> Result<()> {
        if self.fail_initialize {
            return Err(SongError::backend(&self.name, "weights failed to load"));
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generate(&self, call: &GenerationCall) -> std::result::Result<AudioBuffer, GenerationFailure> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let result = self.render(call);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sings a steady tone, four characters per second
pub struct SyntheticVocals {
    sample_rate: u32,
    available: bool,
    fail: bool,
    silent: bool,
    calls: AtomicUsize,
}

impl SyntheticVocals {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            available: true,
            fail: false,
            silent: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Return silence instead of a tone
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VocalSynthesizer for SyntheticVocals {
    fn name(&self) -> &str {
        "synthetic-vocals"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn synthesize(&self, text: &str, _style: &StyleHints) -> Result<AudioBuffer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SongError::backend("vocals", "injected synthesis failure"));
        }
        let secs = (text.chars().count() as f64 / 4.0).max(1.0);
        let frames = secs_to_frames(secs, self.sample_rate);
        if self.silent {
            return Ok(AudioBuffer::silence(frames, ChannelLayout::Mono, self.sample_rate));
        }
        let rate = self.sample_rate as f32;
        let samples = (0..frames)
            .map(|i| 0.5 * (2.0 * PI * 330.0 * i as f32 / rate).sin())
            .collect();
        Ok(AudioBuffer::from_mono(samples, self.sample_rate))
    }
}

/// Separator whose stems carry no energy
#[derive(Debug, Clone, Copy, Default)]
pub struct DegenerateSeparator;

impl StemSeparator for DegenerateSeparator {
    fn name(&self) -> &str {
        "degenerate"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn stem_names(&self) -> Vec<String> {
        ["vocals", "drums", "bass", "other"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn separate(&self, waveform: &AudioBuffer) -> Result<Stems> {
        let mut silent = waveform.clone();
        silent.apply_gain(0.0);
        Ok(self
            .stem_names()
            .into_iter()
            .map(|name| (name, silent.clone()))
            .collect())
    }
}

/// Effects engine that is never available
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableEffects;

impl EffectsEngine for UnavailableEffects {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn apply_chain(&self, _waveform: &AudioBuffer, chain: &ChainSpec) -> Result<AudioBuffer> {
        Err(SongError::backend(
            "effects",
            format!("cannot run chain '{}': engine unavailable", chain.name),
        ))
    }
}

/// Registry with synthetic backends, the crossover separator, DSP effects
/// and synthetic vocals
pub fn synthetic_registry(config: &PipelineConfig, hardware: HardwareProbe) -> ModelRegistry {
    ModelRegistry::builder()
        .hardware(hardware)
        .primary(Arc::new(SyntheticBackend::primary(&config.backends)))
        .fallback(Arc::new(SyntheticBackend::fallback(&config.backends)))
        .separator(Arc::new(FilterBankSeparator::new()))
        .vocals(Arc::new(SyntheticVocals::new(config.audio.sample_rate)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::GenerationParams;

    fn call(seed: Option<u64>) -> GenerationCall {
        GenerationCall {
            prompt: "test".into(),
            lyrics: None,
            duration_secs: 0.5,
            conditioning: None,
            params: GenerationParams {
                seed,
                ..Default::default()
            },
            sample_rate: 8_000,
            layout: ChannelLayout::Stereo,
        }
    }

    #[test]
    fn test_generates_requested_shape() {
        let backend = SyntheticBackend::primary(&BackendConfig::default());
        let audio = backend.generate(&call(None)).unwrap();
        assert_eq!(audio.len(), 4_000);
        assert_eq!(audio.channels(), 2);
        assert!(audio.peak() > 0.3 && audio.peak() <= 0.75);
    }

    #[test]
    fn test_deterministic_per_seed() {
        let a = SyntheticBackend::primary(&BackendConfig::default());
        let b = SyntheticBackend::primary(&BackendConfig::default());
        assert_eq!(a.generate(&call(Some(7))).unwrap(), b.generate(&call(Some(7))).unwrap());
    }

    #[test]
    fn test_injected_faults() {
        let backend = SyntheticBackend::primary(&BackendConfig::default())
            .silent_on_call(0)
            .fail_on_call(1, GenerationFailureKind::ResourceExhausted);
        assert_eq!(backend.generate(&call(None)).unwrap().peak(), 0.0);
        let err = backend.generate(&call(None)).unwrap_err();
        assert_eq!(err.kind, GenerationFailureKind::ResourceExhausted);
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_vocal_length_follows_text() {
        let vocals = SyntheticVocals::new(8_000);
        let audio = vocals.synthesize(&"a".repeat(20), &StyleHints::default()).unwrap();
        assert_eq!(audio.len(), 40_000);
    }
}
