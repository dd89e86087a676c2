//! Error handling for Songchain
//!
//! Every failure is attributable to a song, a clip index and a stage.
//! No error in this crate is ever converted into synthetic audio.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::song::Stage;

/// Result type alias for Songchain operations
pub type Result<T> = std::result::Result<T, SongError>;

/// Why a backend generation call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationFailureKind {
    /// The backend raised or returned an error
    Backend,
    /// The call did not finish before its deadline
    Timeout,
    /// Out of VRAM / memory
    ResourceExhausted,
    /// Model files or device not accessible
    Permission,
    /// Output duration outside the generation tolerance
    DurationMismatch,
    /// Output could not be interpreted as audio (NaN/Inf, wrong layout)
    InvalidOutput,
}

impl fmt::Display for GenerationFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Backend => "backend error",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource exhausted",
            Self::Permission => "permission denied",
            Self::DurationMismatch => "duration mismatch",
            Self::InvalidOutput => "invalid output",
        };
        f.write_str(label)
    }
}

/// Main error type for Songchain operations
#[derive(Error, Debug)]
pub enum SongError {
    // Signal validity
    #[error("Silent audio at {stage}{}: peak {peak:.6}, RMS {rms:.6}", clip_suffix(*clip_index))]
    SilentAudio {
        stage: String,
        clip_index: Option<usize>,
        peak: f32,
        rms: f32,
    },

    // Generation
    #[error("Generation failed for clip {clip_index} ({kind}): {reason}")]
    Generation {
        clip_index: usize,
        kind: GenerationFailureKind,
        reason: String,
    },

    #[error("No generation backend available: {reason}")]
    NoBackendAvailable { reason: String },

    // Stem processing
    #[error("Degenerate separation for clip {clip_index}: summed stem peak {stem_energy:.6} below floor {floor:.6}")]
    SeparationDegenerate {
        clip_index: usize,
        stem_energy: f32,
        floor: f32,
    },

    // Chaining
    #[error("Discontinuity at join {join_index}: sample jump {jump:.4} exceeds {threshold:.4}")]
    ChainDiscontinuity {
        join_index: usize,
        jump: f32,
        threshold: f32,
    },

    // Attribution wrapper produced by the pipeline
    #[error("Song {song_id} failed at {stage}{}: {source}", clip_suffix(*clip_index))]
    RunFailed {
        song_id: Uuid,
        stage: Stage,
        clip_index: Option<usize>,
        #[source]
        source: Box<SongError>,
    },

    #[error("Song cancelled during {stage}")]
    Cancelled { stage: Stage },

    // Request / configuration
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Audio plumbing
    #[error("Sample rate mismatch: expected {expected} Hz, got {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("Invalid audio: {reason}")]
    InvalidAudio { reason: String },

    #[error("Song is not exportable in state {state}")]
    NotExportable { state: String },

    // Collaborator plumbing (registry, bridges, worker pool)
    #[error("Collaborator '{component}' failed: {reason}")]
    Backend { component: String, reason: String },

    // I/O Errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

fn clip_suffix(clip_index: Option<usize>) -> String {
    match clip_index {
        Some(index) => format!(" (clip {})", index),
        None => String::new(),
    }
}

impl SongError {
    /// Build a silent-audio error for a stage label
    pub fn silent(stage: impl Into<String>, clip_index: Option<usize>, peak: f32, rms: f32) -> Self {
        SongError::SilentAudio {
            stage: stage.into(),
            clip_index,
            peak,
            rms,
        }
    }

    /// Build a collaborator error
    pub fn backend(component: impl Into<String>, reason: impl Into<String>) -> Self {
        SongError::Backend {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Get the error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            SongError::SilentAudio { .. } => "SILENT_AUDIO",
            SongError::Generation { .. } => "GENERATION_ERROR",
            SongError::NoBackendAvailable { .. } => "NO_BACKEND_AVAILABLE",
            SongError::SeparationDegenerate { .. } => "SEPARATION_DEGENERATE",
            SongError::ChainDiscontinuity { .. } => "CHAIN_DISCONTINUITY",
            SongError::RunFailed { source, .. } => source.error_code(),
            SongError::Cancelled { .. } => "CANCELLED",
            SongError::InvalidRequest { .. } => "INVALID_REQUEST",
            SongError::InvalidConfig { .. } => "INVALID_CONFIG",
            SongError::SampleRateMismatch { .. } => "SAMPLE_RATE_MISMATCH",
            SongError::InvalidAudio { .. } => "INVALID_AUDIO",
            SongError::NotExportable { .. } => "NOT_EXPORTABLE",
            SongError::Backend { .. } => "COLLABORATOR_ERROR",
            SongError::Io(_) => "IO_ERROR",
            SongError::Serialization(_) => "SERIALIZATION_ERROR",
            SongError::Wav(_) => "WAV_ERROR",
        }
    }

    /// The innermost error, looking through the attribution wrapper
    pub fn root(&self) -> &SongError {
        match self {
            SongError::RunFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Clip index the error is attributed to, if any
    pub fn clip_index(&self) -> Option<usize> {
        match self {
            SongError::SilentAudio { clip_index, .. } => *clip_index,
            SongError::Generation { clip_index, .. } => Some(*clip_index),
            SongError::SeparationDegenerate { clip_index, .. } => Some(*clip_index),
            SongError::RunFailed {
                clip_index, source, ..
            } => clip_index.or_else(|| source.clip_index()),
            _ => None,
        }
    }

    /// Check if the operator can retry the same request and expect success
    ///
    /// None of these are recovered inside a run; this only informs the caller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SongError::RunFailed { source, .. } => source.is_recoverable(),
            SongError::Generation { kind, .. } => matches!(
                kind,
                GenerationFailureKind::Timeout | GenerationFailureKind::ResourceExhausted
            ),
            SongError::Cancelled { .. } => true,
            SongError::InvalidRequest { .. } => true,
            SongError::InvalidConfig { .. } => true,
            _ => false,
        }
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self.root() {
            SongError::SilentAudio { .. } => vec![
                "The model produced empty output - try a different seed or prompt",
                "Check the backend logs for swallowed errors",
            ],
            SongError::Generation { kind, .. } => match kind {
                GenerationFailureKind::Timeout => vec![
                    "Increase the backend timeout",
                    "Reduce the number of clips or inference steps",
                ],
                GenerationFailureKind::ResourceExhausted => vec![
                    "Close other GPU applications to free VRAM",
                    "Use the CPU fallback backend",
                ],
                GenerationFailureKind::Permission => vec![
                    "Check read permissions on the model directory",
                    "Verify the device is accessible to this user",
                ],
                _ => vec!["Inspect the backend logs", "Retry the request"],
            },
            SongError::NoBackendAvailable { .. } => vec![
                "Install or start the primary (GPU) generation service",
                "Install or start the fallback (CPU) generation service",
                "Run 'songchain-cli probe' to see what was detected",
            ],
            SongError::SeparationDegenerate { .. } => vec![
                "The separation model returned near-silent stems",
                "Check the separation service and its model weights",
            ],
            SongError::ChainDiscontinuity { .. } => vec![
                "Lengthen the crossfade",
                "Switch the crossfade curve to equal-power",
            ],
            SongError::InvalidRequest { .. } => vec![
                "Crossfade must be shorter than lead-in and lead-out",
                "Clip count must be between 1 and the configured maximum",
            ],
            _ => vec![],
        }
    }

    /// Get a user-friendly message for this error
    pub fn friendly_message(&self) -> String {
        match self.root() {
            SongError::NoBackendAvailable { reason } => {
                format!("No hardware or generation backend is available: {}", reason)
            }
            SongError::SilentAudio {
                stage, peak, rms, ..
            } if stage.starts_with("post-generation") => format!(
                "The model produced empty output (peak {:.6}, RMS {:.6}).",
                peak, rms
            ),
            SongError::SilentAudio {
                stage, peak, rms, ..
            } => format!(
                "Audio dropped out during {} (peak {:.6}, RMS {:.6}).",
                stage, peak, rms
            ),
            SongError::SeparationDegenerate { stem_energy, .. } => format!(
                "Audio dropped during stem separation (summed stem peak {:.6}).",
                stem_energy
            ),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SongError::silent("post-generation", Some(2), 0.0, 0.0);
        assert_eq!(err.error_code(), "SILENT_AUDIO");
        assert_eq!(err.clip_index(), Some(2));
    }

    #[test]
    fn test_run_failed_looks_through_to_root() {
        let err = SongError::RunFailed {
            song_id: Uuid::new_v4(),
            stage: Stage::Generating,
            clip_index: Some(2),
            source: Box::new(SongError::Generation {
                clip_index: 2,
                kind: GenerationFailureKind::Timeout,
                reason: "deadline".to_string(),
            }),
        };
        assert_eq!(err.error_code(), "GENERATION_ERROR");
        assert_eq!(err.clip_index(), Some(2));
        assert!(err.is_recoverable());
        assert!(!err.recovery_suggestions().is_empty());
    }

    #[test]
    fn test_friendly_message_distinguishes_causes() {
        let no_backend = SongError::NoBackendAvailable {
            reason: "no GPU".to_string(),
        };
        let empty = SongError::silent("post-generation", Some(0), 0.0, 0.0);
        let dropped = SongError::silent("post-mix", Some(0), 0.0, 0.0);

        assert!(no_backend.friendly_message().contains("hardware"));
        assert!(empty.friendly_message().contains("empty output"));
        assert!(dropped.friendly_message().contains("dropped"));
    }
}
