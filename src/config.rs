//! Pipeline configuration
//!
//! One JSON document with a section per concern. Every field has a
//! default so a partial file (or none at all) is accepted. Bridge
//! endpoints and the call timeout can be overridden from the environment.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chain::CrossfadeCurve;
use crate::engine::buffer::{ChannelLayout, DEFAULT_SAMPLE_RATE};
use crate::error::{Result, SongError};

/// Environment variable overriding the primary generation bridge URL
pub const ENV_PRIMARY_URL: &str = "SONGCHAIN_PRIMARY_URL";
/// Environment variable overriding the fallback generation bridge URL
pub const ENV_FALLBACK_URL: &str = "SONGCHAIN_FALLBACK_URL";
/// Environment variable overriding the separation bridge URL
pub const ENV_SEPARATOR_URL: &str = "SONGCHAIN_SEPARATOR_URL";
/// Environment variable overriding the vocal synthesis bridge URL
pub const ENV_VOCAL_URL: &str = "SONGCHAIN_VOCAL_URL";
/// Environment variable overriding the per-call timeout
pub const ENV_TIMEOUT_MS: &str = "SONGCHAIN_TIMEOUT_MS";

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub audio: AudioConfig,
    pub validation: ValidationConfig,
    pub mastering: MasteringConfig,
    pub backends: BackendConfig,
    pub stems: StemConfig,
    pub vocals: VocalConfig,
}

/// Song-wide waveform and clip layout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    pub lead_in_secs: f64,
    pub main_secs: f64,
    pub lead_out_secs: f64,
    pub crossfade_secs: f64,
    pub crossfade_curve: CrossfadeCurve,
    pub max_clips: usize,
    pub default_clips: usize,
    /// Allowed deviation of backend output from the requested clip length
    pub duration_tolerance_secs: f64,
    /// Largest allowed sample-to-sample jump across a crossfade join
    pub join_jump_threshold: f32,
    pub fade_out: bool,
    pub fade_out_exponent: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            layout: ChannelLayout::Mono,
            lead_in_secs: 2.0,
            main_secs: 28.0,
            lead_out_secs: 2.0,
            crossfade_secs: 1.5,
            crossfade_curve: CrossfadeCurve::Linear,
            max_clips: 10,
            default_clips: 3,
            duration_tolerance_secs: 0.5,
            join_jump_threshold: 0.5,
            fade_out: true,
            fade_out_exponent: 1.5,
        }
    }
}

/// Validity floors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_peak: f32,
    pub min_rms: f32,
    /// Floor for the sum of per-stem peaks after separation
    pub stem_energy_floor: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_peak: crate::engine::validator::DEFAULT_MIN_PEAK,
            min_rms: crate::engine::validator::DEFAULT_MIN_RMS,
            stem_energy_floor: 1e-3,
        }
    }
}

/// Mastering targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasteringConfig {
    /// Absolute peak the track is normalized to
    pub headroom: f32,
    /// Samples above this are soft limited
    pub limiter_threshold: f32,
    /// Asymptote of the soft limiter curve
    pub limiter_ceiling: f32,
}

impl Default for MasteringConfig {
    fn default() -> Self {
        Self {
            headroom: 0.9,
            limiter_threshold: 0.9,
            limiter_ceiling: 1.0,
        }
    }
}

/// Generation backends and their bridges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub primary_url: String,
    pub fallback_url: String,
    pub timeout_ms: u64,
    /// Switch remaining clips to Fallback when Primary fails mid-run
    pub degrade_on_primary_failure: bool,
    pub primary_min_vram_gb: f32,
    pub primary_max_clip_secs: f64,
    pub fallback_max_clip_secs: f64,
    pub inference_steps: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            primary_url: "http://localhost:8001".to_string(),
            fallback_url: "http://localhost:8002".to_string(),
            timeout_ms: 300_000,
            degrade_on_primary_failure: true,
            primary_min_vram_gb: 8.0,
            primary_max_clip_secs: 240.0,
            fallback_max_clip_secs: 60.0,
            inference_steps: 27,
        }
    }
}

/// Per-stem mix volumes applied after enhancement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemVolumes {
    pub vocals: f32,
    pub drums: f32,
    pub bass: f32,
    pub other: f32,
    pub unknown: f32,
}

impl Default for StemVolumes {
    fn default() -> Self {
        Self {
            vocals: 1.0,
            drums: 0.85,
            bass: 0.80,
            other: 0.75,
            unknown: 0.6,
        }
    }
}

/// Stem separation and enhancement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemConfig {
    pub separator_url: String,
    /// Enhancement pool size; 0 means one thread per available core
    pub worker_threads: usize,
    pub volumes: StemVolumes,
    /// Mixed clips are scaled down only when their peak exceeds this
    pub mix_peak_limit: f32,
}

impl Default for StemConfig {
    fn default() -> Self {
        Self {
            separator_url: "http://localhost:8003".to_string(),
            worker_threads: 4,
            volumes: StemVolumes::default(),
            mix_peak_limit: 0.95,
        }
    }
}

/// Vocal synthesis used behind the fallback backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VocalConfig {
    pub synth_url: String,
    pub vocal_gain: f32,
    pub instrumental_gain: f32,
    pub mix_peak: f32,
    pub max_lyric_chars: usize,
}

impl Default for VocalConfig {
    fn default() -> Self {
        Self {
            synth_url: "http://localhost:8004".to_string(),
            vocal_gain: 0.3,
            instrumental_gain: 0.7,
            mix_peak: 0.9,
            max_lyric_chars: 2000,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Write as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `SONGCHAIN_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var(ENV_PRIMARY_URL) {
            self.backends.primary_url = url;
        }
        if let Ok(url) = env::var(ENV_FALLBACK_URL) {
            self.backends.fallback_url = url;
        }
        if let Ok(url) = env::var(ENV_SEPARATOR_URL) {
            self.stems.separator_url = url;
        }
        if let Ok(url) = env::var(ENV_VOCAL_URL) {
            self.vocals.synth_url = url;
        }
        if let Some(timeout) = env::var(ENV_TIMEOUT_MS)
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.backends.timeout_ms = timeout;
        }
        self
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate must be positive"));
        }
        if audio.lead_in_secs <= 0.0 || audio.lead_out_secs <= 0.0 || audio.main_secs <= 0.0 {
            return Err(invalid("clip sections must all be positive"));
        }
        if audio.crossfade_secs <= 0.0 {
            return Err(invalid("audio.crossfade_secs must be positive"));
        }
        if audio.crossfade_secs >= audio.lead_in_secs.min(audio.lead_out_secs) {
            return Err(invalid(
                "audio.crossfade_secs must be strictly less than lead-in and lead-out",
            ));
        }
        if audio.max_clips == 0 || audio.default_clips == 0 || audio.default_clips > audio.max_clips {
            return Err(invalid("audio.default_clips must be within 1..=max_clips"));
        }
        if audio.duration_tolerance_secs < 0.0 {
            return Err(invalid("audio.duration_tolerance_secs must not be negative"));
        }
        if audio.fade_out_exponent <= 0.0 {
            return Err(invalid("audio.fade_out_exponent must be positive"));
        }

        let mastering = &self.mastering;
        if !(mastering.headroom > 0.0
            && mastering.limiter_threshold <= mastering.headroom
            && mastering.headroom <= mastering.limiter_ceiling
            && mastering.limiter_ceiling <= 1.0)
        {
            return Err(invalid(
                "mastering requires 0 < limiter_threshold <= headroom <= limiter_ceiling <= 1",
            ));
        }
        if mastering.limiter_threshold <= 0.0 {
            return Err(invalid("mastering.limiter_threshold must be positive"));
        }

        let vocals = &self.vocals;
        if vocals.vocal_gain < 0.0 || vocals.instrumental_gain < 0.0 {
            return Err(invalid("vocal mix gains must not be negative"));
        }
        if vocals.mix_peak <= 0.0 || vocals.mix_peak > 1.0 {
            return Err(invalid("vocals.mix_peak must be in (0, 1]"));
        }

        if self.validation.min_peak < 0.0 || self.validation.min_rms < 0.0 {
            return Err(invalid("validation floors must not be negative"));
        }
        if self.stems.mix_peak_limit <= 0.0 {
            return Err(invalid("stems.mix_peak_limit must be positive"));
        }
        if self.backends.timeout_ms == 0 {
            return Err(invalid("backends.timeout_ms must be positive"));
        }

        Ok(())
    }

    /// Validator built from the configured floors
    pub fn validator(&self) -> crate::engine::AudioValidator {
        crate::engine::AudioValidator::new(self.validation.min_peak, self.validation.min_rms)
    }
}

fn invalid(reason: &str) -> SongError {
    SongError::InvalidConfig {
        reason: reason.to_string(),
    }
}
