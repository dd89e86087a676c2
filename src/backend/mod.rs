//! Generation backends
//!
//! Two structurally different generation capabilities sit behind one
//! trait. [`BackendSelector`] resolves which one a song uses, once, and
//! hands back a [`BackendHandle`] whose `generate` is identical for both:
//! callers never branch on the active variant.

pub mod bridge;
pub mod gpu;
pub mod mock;

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ConditioningSeed;
use crate::config::{BackendConfig, PipelineConfig};
use crate::engine::buffer::{secs_to_frames, AudioBuffer, ChannelLayout};
use crate::engine::AudioValidator;
use crate::error::{GenerationFailureKind, Result, SongError};
use crate::registry::{DeviceGate, ModelRegistry};
use crate::request::{BackendPreference, GenerationParams, GenerationRequest, PromptSpec};
use crate::song::{DegradationKind, DegradationNotice, Stage};
use crate::vocal::{VocalCompositor, VocalMix};

pub use gpu::{GpuInfo, HardwareClass, HardwareProbe};

/// How often a waiting caller re-checks cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Failure reported by a backend for a single call
#[derive(Debug, Clone, Error)]
#[error("{kind}: {reason}")]
pub struct GenerationFailure {
    pub kind: GenerationFailureKind,
    pub reason: String,
}

impl GenerationFailure {
    pub fn new(kind: GenerationFailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Attribute to a clip
    pub fn into_error(self, clip_index: usize) -> SongError {
        SongError::Generation {
            clip_index,
            kind: self.kind,
            reason: self.reason,
        }
    }
}

/// Which capability variant a backend implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Primary,
    Fallback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Primary => f.write_str("primary"),
            BackendKind::Fallback => f.write_str("fallback"),
        }
    }
}

/// Hardware a backend needs to run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requires", rename_all = "snake_case")]
pub enum HardwareRequirement {
    NvidiaGpu { min_vram_gb: f32 },
    Any,
}

impl HardwareRequirement {
    pub fn satisfied_by(&self, hardware: &HardwareClass) -> bool {
        match self {
            HardwareRequirement::Any => true,
            HardwareRequirement::NvidiaGpu { min_vram_gb } => match hardware {
                HardwareClass::NvidiaGpu { vram_gb } => vram_gb >= min_vram_gb,
                _ => false,
            },
        }
    }
}

/// Declared capability of a generation backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendCapability {
    /// GPU-class, sings the lyrics itself
    Primary {
        hardware: HardwareRequirement,
        native_vocals: bool,
        max_clip_secs: f64,
    },
    /// CPU-compatible, instrumental only
    Fallback {
        hardware: HardwareRequirement,
        native_vocals: bool,
        max_clip_secs: f64,
    },
}

impl BackendCapability {
    /// Primary capability with limits from configuration
    pub fn primary(config: &BackendConfig) -> Self {
        BackendCapability::Primary {
            hardware: HardwareRequirement::NvidiaGpu {
                min_vram_gb: config.primary_min_vram_gb,
            },
            native_vocals: true,
            max_clip_secs: config.primary_max_clip_secs,
        }
    }

    /// Fallback capability with limits from configuration
    pub fn fallback(config: &BackendConfig) -> Self {
        BackendCapability::Fallback {
            hardware: HardwareRequirement::Any,
            native_vocals: false,
            max_clip_secs: config.fallback_max_clip_secs,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendCapability::Primary { .. } => BackendKind::Primary,
            BackendCapability::Fallback { .. } => BackendKind::Fallback,
        }
    }

    pub fn hardware(&self) -> HardwareRequirement {
        match self {
            BackendCapability::Primary { hardware, .. }
            | BackendCapability::Fallback { hardware, .. } => *hardware,
        }
    }

    pub fn native_vocals(&self) -> bool {
        match self {
            BackendCapability::Primary { native_vocals, .. }
            | BackendCapability::Fallback { native_vocals, .. } => *native_vocals,
        }
    }

    pub fn max_clip_secs(&self) -> f64 {
        match self {
            BackendCapability::Primary { max_clip_secs, .. }
            | BackendCapability::Fallback { max_clip_secs, .. } => *max_clip_secs,
        }
    }
}

/// Everything a backend needs for one generation call
#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub prompt: String,
    pub lyrics: Option<String>,
    pub duration_secs: f64,
    pub conditioning: Option<AudioBuffer>,
    pub params: GenerationParams,
    /// Song rate; backends may return another rate and are resampled
    pub sample_rate: u32,
    pub layout: ChannelLayout,
}

/// A generation backend
///
/// `generate` must return an error rather than degrade silently; it is
/// never asked to produce audio for more than one song at a time.
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> BackendCapability;

    /// Cheap probe: installed, reachable, weights present
    fn is_available(&self) -> bool;

    /// Load weights / warm up. Called once before first use.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn generate(&self, call: &GenerationCall) -> std::result::Result<AudioBuffer, GenerationFailure>;

    /// Free device memory
    fn release(&self) {}
}

/// Why a deadline-bounded call did not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Timeout,
    Cancelled,
    Panicked,
    Spawn(String),
}

/// Run `work` on its own thread, waiting at most `timeout`
///
/// On timeout or cancellation the worker is abandoned; its result is
/// dropped when it eventually finishes. Anything `work` owns, such as a
/// device in-flight guard, lives until then.
pub(crate) fn call_with_deadline<T, F>(
    label: &str,
    work: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<T, Interrupted>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("songchain-{}", label))
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|e| Interrupted::Spawn(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Interrupted::Timeout);
        }
        match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err(Interrupted::Panicked),
        }
    }
}

/// Deadline and cancellation for one call
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// Output of one uniform generate call
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    pub waveform: AudioBuffer,
    pub notices: Vec<DegradationNotice>,
    /// Present when lyrics were rendered by the vocal compositor
    pub vocal_mix: Option<VocalMix>,
}

/// The backend a song runs on
#[derive(Clone)]
pub struct BackendHandle {
    backend: Arc<dyn GenerationBackend>,
    capability: BackendCapability,
    compositor: Option<VocalCompositor>,
    selection_notice: Option<DegradationNotice>,
    sample_rate: u32,
    layout: ChannelLayout,
    validator: AudioValidator,
    device: Arc<DeviceGate>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("backend", &self.backend.name())
            .field("capability", &self.capability)
            .field("vocals", &self.compositor.is_some())
            .finish()
    }
}

impl BackendHandle {
    pub fn kind(&self) -> BackendKind {
        self.capability.kind()
    }

    pub fn capability(&self) -> BackendCapability {
        self.capability
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Notice recorded when selection had to degrade
    pub fn selection_notice(&self) -> Option<&DegradationNotice> {
        self.selection_notice.as_ref()
    }

    /// Render one clip
    ///
    /// Lyrics go straight to a backend with native vocals. Otherwise the
    /// backend renders an instrumental, which must pass `post-generation`
    /// validation on its own, and the vocal compositor sings over it; if
    /// that fails the instrumental is returned with a notice.
    ///
    /// The device counts the backend call as running until it returns,
    /// even when the deadline or cancellation gives up on it first.
    pub fn generate(
        &self,
        clip_index: usize,
        prompt: &PromptSpec,
        seed: Option<&ConditioningSeed>,
        ctx: &CallContext<'_>,
    ) -> Result<GeneratedAudio> {
        let lyrics = prompt.lyrics.as_deref();
        let sing_natively = self.capability.native_vocals() || lyrics.is_none();
        let effective = if sing_natively {
            prompt.clone()
        } else {
            prompt.instrumental()
        };

        let call = GenerationCall {
            prompt: effective.text.clone(),
            lyrics: effective.lyrics.clone(),
            duration_secs: effective.duration_secs,
            conditioning: seed.map(|s| s.waveform().clone()),
            params: effective.params,
            sample_rate: self.sample_rate,
            layout: self.layout,
        };

        info!(
            clip = clip_index,
            backend = self.backend.name(),
            kind = %self.kind(),
            conditioned = seed.is_some(),
            lyrics = lyrics.is_some(),
            "generating clip"
        );

        let backend = Arc::clone(&self.backend);
        let in_flight = self.device.begin_call();
        let outcome = call_with_deadline(
            "generate",
            move || {
                let _in_flight = in_flight;
                backend.generate(&call)
            },
            ctx.timeout,
            ctx.cancel,
        );
        let instrumental = match outcome {
            Ok(Ok(waveform)) => waveform,
            Ok(Err(failure)) => return Err(failure.into_error(clip_index)),
            Err(interrupted) => return Err(interrupted_error(interrupted, clip_index, ctx.timeout)),
        };

        let mut notices = Vec::new();
        let lyrics = match lyrics {
            Some(lyrics) if !sing_natively => lyrics,
            _ => {
                return Ok(GeneratedAudio {
                    waveform: instrumental,
                    notices,
                    vocal_mix: None,
                })
            }
        };

        let Some(compositor) = &self.compositor else {
            warn!(clip = clip_index, "no vocal synthesizer registered, clip is instrumental");
            notices.push(DegradationNotice::new(
                Stage::Generating,
                Some(clip_index),
                DegradationKind::VocalsUnavailable,
                "no vocal synthesizer is registered; clip rendered instrumental-only",
            ));
            return Ok(GeneratedAudio {
                waveform: instrumental,
                notices,
                vocal_mix: None,
            });
        };

        // vocals must not mask an empty instrumental
        if instrumental.has_non_finite() {
            return Err(SongError::Generation {
                clip_index,
                kind: GenerationFailureKind::InvalidOutput,
                reason: "instrumental contains NaN or infinite samples".to_string(),
            });
        }
        self.validator
            .assert_valid(&instrumental, "post-generation", Some(clip_index))?;

        let requested_frames = secs_to_frames(effective.duration_secs, instrumental.sample_rate);
        match compositor.compose(lyrics, &prompt.style, ctx) {
            Ok(vocal) => {
                let mixed = compositor.mix_with_instrumental(&instrumental, &vocal)?;
                let mut waveform = mixed.waveform;
                let keep = instrumental.len().max(requested_frames);
                if waveform.len() > keep {
                    warn!(
                        clip = clip_index,
                        vocal_secs = vocal.duration_secs(),
                        "vocal longer than clip, trimming to clip length"
                    );
                    waveform.resize_frames(keep);
                }
                Ok(GeneratedAudio {
                    waveform,
                    notices,
                    vocal_mix: Some(mixed.mix),
                })
            }
            Err(SongError::Cancelled { stage }) => Err(SongError::Cancelled { stage }),
            Err(err) => {
                warn!(clip = clip_index, error = %err, "vocal synthesis failed, keeping instrumental");
                notices.push(DegradationNotice::new(
                    Stage::Generating,
                    Some(clip_index),
                    DegradationKind::VocalsUnavailable,
                    format!("vocal synthesis failed: {}", err),
                ));
                Ok(GeneratedAudio {
                    waveform: instrumental,
                    notices,
                    vocal_mix: None,
                })
            }
        }
    }
}

fn interrupted_error(interrupted: Interrupted, clip_index: usize, timeout: Duration) -> SongError {
    match interrupted {
        Interrupted::Cancelled => SongError::Cancelled {
            stage: Stage::Generating,
        },
        Interrupted::Timeout => SongError::Generation {
            clip_index,
            kind: GenerationFailureKind::Timeout,
            reason: format!("no result after {} ms", timeout.as_millis()),
        },
        Interrupted::Panicked => SongError::Generation {
            clip_index,
            kind: GenerationFailureKind::Backend,
            reason: "backend call panicked".to_string(),
        },
        Interrupted::Spawn(reason) => SongError::Generation {
            clip_index,
            kind: GenerationFailureKind::ResourceExhausted,
            reason: format!("could not start generation thread: {}", reason),
        },
    }
}

/// Resolves the backend for a song
pub struct BackendSelector<'a> {
    registry: &'a ModelRegistry,
    config: &'a PipelineConfig,
}

impl<'a> BackendSelector<'a> {
    pub fn new(registry: &'a ModelRegistry, config: &'a PipelineConfig) -> Self {
        Self { registry, config }
    }

    /// Pick the backend for a whole song
    ///
    /// The requested variant is used when usable; otherwise the other one
    /// is used with a degradation notice. Neither usable is fatal.
    pub fn select(&self, request: &GenerationRequest) -> Result<BackendHandle> {
        let clip_secs = request.layout().total_secs();
        let order = match request.backend_preference() {
            BackendPreference::Auto | BackendPreference::Primary => {
                [BackendKind::Primary, BackendKind::Fallback]
            }
            BackendPreference::Fallback => [BackendKind::Fallback, BackendKind::Primary],
        };

        let mut reasons = Vec::new();
        for (attempt, kind) in order.iter().enumerate() {
            match self.try_backend(*kind, clip_secs) {
                Ok(backend) => {
                    let notice = (attempt > 0).then(|| {
                        DegradationNotice::new(
                            Stage::Selecting,
                            None,
                            DegradationKind::BackendFallback,
                            format!(
                                "{} backend unusable ({}); using {}",
                                order[0],
                                reasons.join("; "),
                                kind
                            ),
                        )
                    });
                    if let Some(notice) = &notice {
                        warn!(backend = backend.name(), reason = %notice.message, "backend degraded");
                    } else {
                        info!(backend = backend.name(), kind = %kind, "backend selected");
                    }
                    return Ok(self.handle(backend, notice));
                }
                Err(reason) => {
                    debug!(kind = %kind, reason = %reason, "backend not usable");
                    reasons.push(format!("{}: {}", kind, reason));
                }
            }
        }

        Err(SongError::NoBackendAvailable {
            reason: format!(
                "{} on {}",
                reasons.join("; "),
                self.registry.hardware().class.label()
            ),
        })
    }

    /// Switch a Primary song to Fallback after a Primary generation failure
    pub fn degrade(
        &self,
        current: &BackendHandle,
        clip_index: usize,
        cause: &SongError,
        clip_secs: f64,
    ) -> Option<BackendHandle> {
        if current.kind() != BackendKind::Primary || !self.config.backends.degrade_on_primary_failure
        {
            return None;
        }
        if !matches!(cause, SongError::Generation { .. }) {
            return None;
        }
        match self.try_backend(BackendKind::Fallback, clip_secs) {
            Ok(backend) => {
                let notice = DegradationNotice::new(
                    Stage::Generating,
                    Some(clip_index),
                    DegradationKind::BackendFallback,
                    format!(
                        "primary backend failed at clip {} ({}); remaining clips use fallback",
                        clip_index, cause
                    ),
                );
                warn!(clip = clip_index, error = %cause, "degrading to fallback backend");
                Some(self.handle(backend, Some(notice)))
            }
            Err(reason) => {
                debug!(reason = %reason, "fallback not usable for degradation");
                None
            }
        }
    }

    fn try_backend(
        &self,
        kind: BackendKind,
        clip_secs: f64,
    ) -> std::result::Result<Arc<dyn GenerationBackend>, String> {
        let backend = self
            .registry
            .generation_backend(kind)
            .ok_or_else(|| "not registered".to_string())?;
        let capability = backend.capability();
        let hardware = &self.registry.hardware().class;

        if !capability.hardware().satisfied_by(hardware) {
            return Err(format!("requires {:?}, found {}", capability.hardware(), hardware.label()));
        }
        if clip_secs > capability.max_clip_secs() {
            return Err(format!(
                "clip of {:.1}s exceeds limit {:.1}s",
                clip_secs,
                capability.max_clip_secs()
            ));
        }
        if !backend.is_available() {
            return Err(format!("{} is not available", backend.name()));
        }
        self.registry
            .ensure_initialized(kind)
            .map_err(|e| format!("initialization failed: {}", e))?;
        Ok(backend)
    }

    fn handle(
        &self,
        backend: Arc<dyn GenerationBackend>,
        selection_notice: Option<DegradationNotice>,
    ) -> BackendHandle {
        let capability = backend.capability();
        let compositor = if capability.native_vocals() {
            None
        } else {
            self.registry
                .vocal_synthesizer()
                .map(|synth| {
                    VocalCompositor::new(synth, self.config.vocals.clone(), self.config.validator())
                })
        };
        BackendHandle {
            backend,
            capability,
            compositor,
            selection_notice,
            sample_rate: self.config.audio.sample_rate,
            layout: self.config.audio.layout,
            validator: self.config.validator(),
            device: self.registry.device_gate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_requirement() {
        let req = HardwareRequirement::NvidiaGpu { min_vram_gb: 8.0 };
        assert!(req.satisfied_by(&HardwareClass::NvidiaGpu { vram_gb: 12.0 }));
        assert!(!req.satisfied_by(&HardwareClass::NvidiaGpu { vram_gb: 4.0 }));
        assert!(!req.satisfied_by(&HardwareClass::OtherGpu {
            name: "Radeon".into()
        }));
        assert!(!req.satisfied_by(&HardwareClass::Cpu));
        assert!(HardwareRequirement::Any.satisfied_by(&HardwareClass::Cpu));
    }

    #[test]
    fn test_capability_accessors() {
        let config = BackendConfig::default();
        let primary = BackendCapability::primary(&config);
        let fallback = BackendCapability::fallback(&config);
        assert_eq!(primary.kind(), BackendKind::Primary);
        assert!(primary.native_vocals());
        assert_eq!(fallback.kind(), BackendKind::Fallback);
        assert!(!fallback.native_vocals());
        assert_eq!(fallback.hardware(), HardwareRequirement::Any);
    }

    #[test]
    fn test_call_with_deadline_returns_value() {
        let cancel = CancellationToken::new();
        let value = call_with_deadline("t", || 42, Duration::from_secs(5), &cancel);
        assert_eq!(value, Ok(42));
    }

    #[test]
    fn test_call_with_deadline_times_out() {
        let cancel = CancellationToken::new();
        let value = call_with_deadline(
            "t",
            || {
                thread::sleep(Duration::from_millis(500));
                1
            },
            Duration::from_millis(50),
            &cancel,
        );
        assert_eq!(value, Err(Interrupted::Timeout));
    }

    #[test]
    fn test_call_with_deadline_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let value = call_with_deadline(
            "t",
            || {
                thread::sleep(Duration::from_millis(200));
                1
            },
            Duration::from_secs(5),
            &cancel,
        );
        assert_eq!(value, Err(Interrupted::Cancelled));
    }
}
