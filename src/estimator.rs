//! Wall-clock estimates for a request
//!
//! Read-only and advisory: the pipeline never consults it. Figures are
//! real-time factors measured on typical hardware; they are coarse.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendCapability, BackendKind, HardwareClass};
use crate::config::PipelineConfig;
use crate::request::{BackendPreference, GenerationRequest};

/// Model load time, seconds
const PRIMARY_LOAD_SECS: f64 = 90.0;
const FALLBACK_LOAD_SECS: f64 = 30.0;

/// Seconds of compute per second of audio
const PRIMARY_RTF_16GB: f64 = 0.35;
const PRIMARY_RTF_8GB: f64 = 0.5;
const PRIMARY_RTF_LOW_VRAM: f64 = 0.8;
const FALLBACK_RTF_GPU: f64 = 0.6;
const FALLBACK_RTF_CPU: f64 = 4.0;
const SEPARATION_RTF_GPU: f64 = 0.05;
const SEPARATION_RTF_CPU: f64 = 0.4;
const ENHANCEMENT_RTF_PER_STEM: f64 = 0.05;
const ASSEMBLY_RTF: f64 = 0.02;

/// Vocal synthesis, seconds per lyric character
const VOCAL_SECS_PER_CHAR: f64 = 0.01;

/// Primary step count the RTFs were measured at
const REFERENCE_STEPS: f64 = 27.0;

const STEMS_PER_CLIP: f64 = 4.0;

/// Per-phase seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimateBreakdown {
    pub model_load: f64,
    pub generation: f64,
    pub separation: f64,
    pub enhancement: f64,
    pub vocal_synthesis: f64,
    pub assembly: f64,
}

impl EstimateBreakdown {
    pub fn total(&self) -> f64 {
        self.model_load
            + self.generation
            + self.separation
            + self.enhancement
            + self.vocal_synthesis
            + self.assembly
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimate {
    /// Backend the selector would pick on this hardware
    pub backend: BackendKind,
    pub hardware: HardwareClass,
    pub clip_count: usize,
    pub song_secs: f64,
    pub breakdown: EstimateBreakdown,
    pub total_secs: f64,
}

impl TimeEstimate {
    pub fn summary(&self) -> String {
        let b = &self.breakdown;
        let mut lines = vec![
            format!(
                "Estimated time: {} for {} clip(s), {} of audio",
                format_duration(self.total_secs),
                self.clip_count,
                format_duration(self.song_secs)
            ),
            format!("Backend: {} on {}", self.backend, self.hardware.label()),
            format!("  model load:   {}", format_duration(b.model_load)),
            format!("  generation:   {}", format_duration(b.generation)),
            format!("  separation:   {}", format_duration(b.separation)),
            format!("  enhancement:  {}", format_duration(b.enhancement)),
        ];
        if b.vocal_synthesis > 0.0 {
            lines.push(format!("  vocals:       {}", format_duration(b.vocal_synthesis)));
        }
        lines.push(format!("  assembly:     {}", format_duration(b.assembly)));
        lines.join("\n")
    }
}

/// `95.0` -> `"1m 35s"`
pub fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, m, _) => format!("{}h {}m", h, m),
    }
}

#[derive(Debug, Clone)]
pub struct TimeEstimator {
    primary: BackendCapability,
    fallback: BackendCapability,
    crossfade_secs: f64,
}

impl TimeEstimator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            primary: BackendCapability::primary(&config.backends),
            fallback: BackendCapability::fallback(&config.backends),
            crossfade_secs: config.audio.crossfade_secs,
        }
    }

    /// Backend the selector would choose, assuming both are installed
    ///
    /// Applies the selector's hardware and clip-length checks in the
    /// selector's order. When no backend can take the clip length, the
    /// first one the hardware can run is reported.
    pub fn predicted_backend(&self, request: &GenerationRequest, hardware: &HardwareClass) -> BackendKind {
        let clip_secs = request.layout().total_secs();
        let order = match request.backend_preference() {
            BackendPreference::Fallback => [self.fallback, self.primary],
            BackendPreference::Auto | BackendPreference::Primary => [self.primary, self.fallback],
        };
        let runs_here = |capability: &&BackendCapability| capability.hardware().satisfied_by(hardware);
        order
            .iter()
            .filter(runs_here)
            .find(|capability| clip_secs <= capability.max_clip_secs())
            .or_else(|| order.iter().find(runs_here))
            .unwrap_or(&order[0])
            .kind()
    }

    pub fn estimate(&self, request: &GenerationRequest, hardware: &HardwareClass) -> TimeEstimate {
        let backend = self.predicted_backend(request, hardware);
        let clips = request.clip_count() as f64;
        let clip_secs = request.layout().total_secs();
        let audio_secs = clip_secs * clips;
        let gpu = hardware.is_nvidia();

        let (model_load, rtf) = match backend {
            BackendKind::Primary => {
                let vram = hardware.vram_gb();
                let base = if vram >= 16.0 {
                    PRIMARY_RTF_16GB
                } else if vram >= 8.0 {
                    PRIMARY_RTF_8GB
                } else {
                    PRIMARY_RTF_LOW_VRAM
                };
                let steps = request.params().inference_steps as f64 / REFERENCE_STEPS;
                (PRIMARY_LOAD_SECS, base * steps)
            }
            BackendKind::Fallback if gpu => (FALLBACK_LOAD_SECS, FALLBACK_RTF_GPU),
            BackendKind::Fallback => (FALLBACK_LOAD_SECS, FALLBACK_RTF_CPU),
        };

        let vocal_synthesis = match (backend, request.lyrics()) {
            (BackendKind::Fallback, Some(lyrics)) => {
                lyrics.chars().count() as f64 * VOCAL_SECS_PER_CHAR * clips
            }
            _ => 0.0,
        };
        let separation_rtf = if gpu { SEPARATION_RTF_GPU } else { SEPARATION_RTF_CPU };
        let song_secs = (audio_secs - (clips - 1.0).max(0.0) * self.crossfade_secs).max(0.0);

        let breakdown = EstimateBreakdown {
            model_load,
            generation: audio_secs * rtf,
            separation: audio_secs * separation_rtf,
            enhancement: audio_secs * ENHANCEMENT_RTF_PER_STEM * STEMS_PER_CLIP,
            vocal_synthesis,
            assembly: song_secs * ASSEMBLY_RTF,
        };

        TimeEstimate {
            backend,
            hardware: hardware.clone(),
            clip_count: request.clip_count(),
            song_secs,
            total_secs: breakdown.total(),
            breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ClipLayout;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn estimator() -> TimeEstimator {
        TimeEstimator::new(&PipelineConfig::default())
    }

    #[test_case(HardwareClass::NvidiaGpu { vram_gb: 24.0 }, BackendKind::Primary ; "big gpu")]
    #[test_case(HardwareClass::NvidiaGpu { vram_gb: 4.0 }, BackendKind::Fallback ; "small gpu")]
    #[test_case(HardwareClass::OtherGpu { name: "Radeon".into() }, BackendKind::Fallback ; "amd")]
    #[test_case(HardwareClass::Cpu, BackendKind::Fallback ; "cpu")]
    fn test_predicted_backend(hardware: HardwareClass, expected: BackendKind) {
        let request = GenerationRequest::builder("x").build().unwrap();
        assert_eq!(estimator().predicted_backend(&request, &hardware), expected);
    }

    #[test_case(BackendPreference::Fallback, HardwareClass::NvidiaGpu { vram_gb: 24.0 }, BackendKind::Primary ; "fallback too short for clip")]
    #[test_case(BackendPreference::Auto, HardwareClass::NvidiaGpu { vram_gb: 24.0 }, BackendKind::Primary ; "auto on gpu")]
    #[test_case(BackendPreference::Auto, HardwareClass::Cpu, BackendKind::Fallback ; "nothing fits on cpu")]
    fn test_predicted_backend_respects_clip_limit(
        preference: BackendPreference,
        hardware: HardwareClass,
        expected: BackendKind,
    ) {
        let request = GenerationRequest::builder("x")
            .layout(ClipLayout::new(2.0, 66.0, 2.0))
            .backend_preference(preference)
            .build()
            .unwrap();
        assert_eq!(estimator().predicted_backend(&request, &hardware), expected);
    }

    #[test]
    fn test_fallback_preference_honoured_for_short_clips() {
        let request = GenerationRequest::builder("x")
            .backend_preference(BackendPreference::Fallback)
            .build()
            .unwrap();
        let hardware = HardwareClass::NvidiaGpu { vram_gb: 24.0 };
        assert_eq!(estimator().predicted_backend(&request, &hardware), BackendKind::Fallback);
    }

    #[test]
    fn test_primary_generation_scales_with_steps() {
        let hardware = HardwareClass::NvidiaGpu { vram_gb: 16.0 };
        let base = GenerationRequest::builder("x").clip_count(1).build().unwrap();
        let mut params = *base.params();
        params.inference_steps = 54;
        let doubled = GenerationRequest::builder("x").clip_count(1).params(params).build().unwrap();

        let a = estimator().estimate(&base, &hardware);
        let b = estimator().estimate(&doubled, &hardware);
        assert_relative_eq!(a.breakdown.generation, 32.0 * 0.35, epsilon = 1e-9);
        assert_relative_eq!(b.breakdown.generation, 2.0 * a.breakdown.generation, epsilon = 1e-9);
        assert_eq!(a.breakdown.vocal_synthesis, 0.0);
    }

    #[test]
    fn test_fallback_vocal_time() {
        let request = GenerationRequest::builder("x")
            .clip_count(2)
            .lyrics("a".repeat(100))
            .build()
            .unwrap();
        let estimate = estimator().estimate(&request, &HardwareClass::Cpu);
        assert_eq!(estimate.backend, BackendKind::Fallback);
        assert_relative_eq!(estimate.breakdown.vocal_synthesis, 2.0, epsilon = 1e-9);
        assert_relative_eq!(estimate.breakdown.model_load, 30.0);
        assert_relative_eq!(estimate.song_secs, 64.0 - 1.5, epsilon = 1e-9);
        assert_relative_eq!(estimate.total_secs, estimate.breakdown.total(), epsilon = 1e-9);
    }

    #[test_case(5.0, "5s")]
    #[test_case(95.0, "1m 35s")]
    #[test_case(3725.0, "1h 2m")]
    fn test_format_duration(secs: f64, expected: &str) {
        assert_eq!(format_duration(secs), expected);
    }
}
