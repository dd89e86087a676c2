//! Song state and export
//!
//! A [`Song`] moves through a fixed sequence of states. Only a `Ready`
//! song carries audio and only a `Ready` song can be exported.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::chain::JoinReport;
use crate::clip::ClipDiagnostics;
use crate::engine::{export_audio, AudioBuffer, ExportFormat, SignalLevels};
use crate::error::{Result, SongError};
use crate::mastering::MasteringReport;
use crate::request::GenerationRequest;

/// Pipeline stage an event, notice or error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Selecting,
    Generating,
    Separating,
    Enhancing,
    Chaining,
    Mastering,
    Exporting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Selecting => "selecting",
            Stage::Generating => "generating",
            Stage::Separating => "separating",
            Stage::Enhancing => "enhancing",
            Stage::Chaining => "chaining",
            Stage::Mastering => "mastering",
            Stage::Exporting => "exporting",
        };
        f.write_str(label)
    }
}

/// Song lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SongState {
    Requested,
    Generating { clip: usize },
    Separating { clip: usize },
    Enhancing { clip: usize },
    Chaining,
    Mastering,
    Ready,
    Failed {
        stage: Stage,
        clip_index: Option<usize>,
        error_code: String,
        message: String,
    },
}

impl SongState {
    /// Stage this state belongs to; `None` before work starts and once ready
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SongState::Requested | SongState::Ready => None,
            SongState::Generating { .. } => Some(Stage::Generating),
            SongState::Separating { .. } => Some(Stage::Separating),
            SongState::Enhancing { .. } => Some(Stage::Enhancing),
            SongState::Chaining => Some(Stage::Chaining),
            SongState::Mastering => Some(Stage::Mastering),
            SongState::Failed { stage, .. } => Some(*stage),
        }
    }

    pub fn clip_index(&self) -> Option<usize> {
        match self {
            SongState::Generating { clip }
            | SongState::Separating { clip }
            | SongState::Enhancing { clip } => Some(*clip),
            SongState::Failed { clip_index, .. } => *clip_index,
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SongState::Ready | SongState::Failed { .. })
    }

    /// Whether `next` is a legal successor
    pub fn can_advance_to(&self, next: &SongState) -> bool {
        use SongState::*;
        match (self, next) {
            (Ready, _) | (Failed { .. }, _) => false,
            (_, Failed { .. }) => true,
            (Requested, Generating { clip }) => *clip == 0,
            (Generating { clip: a }, Separating { clip: b }) => a == b,
            (Separating { clip: a }, Enhancing { clip: b }) => a == b,
            (Enhancing { clip: a }, Generating { clip: b }) => *b == a + 1,
            (Enhancing { .. }, Chaining) => true,
            (Chaining, Mastering) => true,
            (Mastering, Ready) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> String {
        match self {
            SongState::Requested => "requested".to_string(),
            SongState::Generating { clip } => format!("generating clip {}", clip),
            SongState::Separating { clip } => format!("separating clip {}", clip),
            SongState::Enhancing { clip } => format!("enhancing clip {}", clip),
            SongState::Chaining => "chaining".to_string(),
            SongState::Mastering => "mastering".to_string(),
            SongState::Ready => "ready".to_string(),
            SongState::Failed { stage, .. } => format!("failed during {}", stage),
        }
    }
}

/// Kind of reduced-quality path a song went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    /// Generation ran on the other backend variant
    BackendFallback,
    /// Lyrics could not be sung; clip is instrumental
    VocalsUnavailable,
    /// Stems passed through without enhancement
    EnhancementBypassed,
}

/// Visible record of a degradation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationNotice {
    pub stage: Stage,
    pub clip_index: Option<usize>,
    pub kind: DegradationKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl DegradationNotice {
    pub fn new(
        stage: Stage,
        clip_index: Option<usize>,
        kind: DegradationKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            clip_index,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// What an export wrote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub frames: usize,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: usize,
    pub bit_depth: u16,
    /// Hex SHA-256 of the written file
    pub sha256: String,
}

/// Serializable summary of a song
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongReport {
    pub id: Uuid,
    pub state: SongState,
    pub backend: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub levels: Option<SignalLevels>,
    pub clips: Vec<ClipDiagnostics>,
    pub joins: Vec<JoinReport>,
    pub mastering: Option<MasteringReport>,
    pub notices: Vec<DegradationNotice>,
}

/// One song request and everything produced for it
#[derive(Debug, Clone)]
pub struct Song {
    id: Uuid,
    request: GenerationRequest,
    state: SongState,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    backend: Option<String>,
    clips: Vec<ClipDiagnostics>,
    joins: Vec<JoinReport>,
    mastering: Option<MasteringReport>,
    notices: Vec<DegradationNotice>,
    waveform: Option<AudioBuffer>,
}

impl Song {
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: SongState::Requested,
            created_at: Utc::now(),
            completed_at: None,
            backend: None,
            clips: Vec::new(),
            joins: Vec::new(),
            mastering: None,
            notices: Vec::new(),
            waveform: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn state(&self) -> &SongState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SongState::Ready
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Name of the backend that rendered the last clip
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn clips(&self) -> &[ClipDiagnostics] {
        &self.clips
    }

    pub fn joins(&self) -> &[JoinReport] {
        &self.joins
    }

    pub fn mastering(&self) -> Option<&MasteringReport> {
        self.mastering.as_ref()
    }

    pub fn notices(&self) -> &[DegradationNotice] {
        &self.notices
    }

    /// Mastered audio, present only when ready
    pub fn waveform(&self) -> Option<&AudioBuffer> {
        match self.state {
            SongState::Ready => self.waveform.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn advance(&mut self, next: SongState) -> Result<()> {
        if !self.state.can_advance_to(&next) {
            return Err(SongError::backend(
                "pipeline",
                format!("illegal transition {} -> {}", self.state.label(), next.label()),
            ));
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Enter the terminal failed state, discarding any audio
    pub(crate) fn fail(&mut self, stage: Stage, clip_index: Option<usize>, error: &SongError) {
        self.waveform = None;
        if self.state.is_terminal() {
            return;
        }
        self.state = SongState::Failed {
            stage,
            clip_index,
            error_code: error.error_code().to_string(),
            message: error.friendly_message(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn set_backend(&mut self, backend: &str) {
        self.backend = Some(backend.to_string());
    }

    pub(crate) fn push_clip(&mut self, diagnostics: ClipDiagnostics) {
        self.clips.push(diagnostics);
    }

    pub(crate) fn push_notice(&mut self, notice: DegradationNotice) {
        self.notices.push(notice);
    }

    pub(crate) fn set_joins(&mut self, joins: Vec<JoinReport>) {
        self.joins = joins;
    }

    pub(crate) fn finish(&mut self, waveform: AudioBuffer, mastering: MasteringReport) -> Result<()> {
        self.advance(SongState::Ready)?;
        self.waveform = Some(waveform);
        self.mastering = Some(mastering);
        Ok(())
    }

    /// Write the mastered audio as WAV
    pub fn export_wav(&self, path: &Path, format: ExportFormat) -> Result<ExportReport> {
        let waveform = match (&self.state, &self.waveform) {
            (SongState::Ready, Some(waveform)) => waveform,
            _ => {
                return Err(SongError::NotExportable {
                    state: self.state.label(),
                })
            }
        };

        export_audio(waveform, path, format)?;
        let bytes = std::fs::read(path)?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let sample_rate = format.sample_rate.unwrap_or(waveform.sample_rate);
        let frames = if sample_rate == waveform.sample_rate {
            waveform.len()
        } else {
            waveform.resample(sample_rate).len()
        };

        let report = ExportReport {
            path: path.to_path_buf(),
            frames,
            duration_secs: frames as f64 / sample_rate as f64,
            sample_rate,
            channels: waveform.channels(),
            bit_depth: format.bit_depth,
            sha256,
        };
        info!(
            song = %self.id,
            path = %path.display(),
            frames = report.frames,
            sha256 = %report.sha256,
            "song exported"
        );
        Ok(report)
    }

    pub fn report(&self) -> SongReport {
        let waveform = self.waveform();
        SongReport {
            id: self.id,
            state: self.state.clone(),
            backend: self.backend.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            duration_secs: waveform.map(AudioBuffer::duration_secs),
            levels: waveform.map(SignalLevels::measure),
            clips: self.clips.clone(),
            joins: self.joins.clone(),
            mastering: self.mastering.clone(),
            notices: self.notices.clone(),
        }
    }
}
