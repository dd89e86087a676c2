//! Song requests and prompt composition
//!
//! A [`GenerationRequest`] is built once per song and never mutated. The
//! per-clip [`PromptSpec`] handed to a backend is derived from it.

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::engine::buffer::secs_to_frames;
use crate::error::{Result, SongError};

/// Per-clip duration split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipLayout {
    pub lead_in_secs: f64,
    pub main_secs: f64,
    pub lead_out_secs: f64,
}

impl Default for ClipLayout {
    fn default() -> Self {
        Self {
            lead_in_secs: 2.0,
            main_secs: 28.0,
            lead_out_secs: 2.0,
        }
    }
}

/// A clip layout resolved to frame counts at one sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipFrames {
    pub lead_in: usize,
    pub main: usize,
    pub lead_out: usize,
}

impl ClipFrames {
    pub fn total(&self) -> usize {
        self.lead_in + self.main + self.lead_out
    }
}

impl ClipLayout {
    pub fn new(lead_in_secs: f64, main_secs: f64, lead_out_secs: f64) -> Self {
        Self {
            lead_in_secs,
            main_secs,
            lead_out_secs,
        }
    }

    /// Lead-in + main + lead-out
    pub fn total_secs(&self) -> f64 {
        self.lead_in_secs + self.main_secs + self.lead_out_secs
    }

    /// Resolve to frames; the total is rounded once so sections always sum to it
    pub fn frames(&self, sample_rate: u32) -> ClipFrames {
        let lead_in = secs_to_frames(self.lead_in_secs, sample_rate);
        let lead_out = secs_to_frames(self.lead_out_secs, sample_rate);
        let total = secs_to_frames(self.total_secs(), sample_rate);
        ClipFrames {
            lead_in,
            main: total.saturating_sub(lead_in + lead_out),
            lead_out,
        }
    }
}

/// Descriptive attributes used to build the backend prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MusicalAttributes {
    pub genre: Option<String>,
    pub mood: Option<String>,
    pub tempo_bpm: Option<u32>,
    #[serde(default)]
    pub instruments: Vec<String>,
}

/// Sampling parameters forwarded to the backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub guidance_scale: f32,
    pub inference_steps: u32,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            guidance_scale: 7.0,
            inference_steps: 27,
            seed: None,
        }
    }
}

/// Which backend the caller would like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Primary when usable, otherwise Fallback
    #[default]
    Auto,
    Primary,
    Fallback,
}

impl std::str::FromStr for BackendPreference {
    type Err = SongError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "primary" => Ok(Self::Primary),
            "fallback" => Ok(Self::Fallback),
            other => Err(SongError::InvalidRequest {
                reason: format!("unknown backend preference '{}'", other),
            }),
        }
    }
}

/// Immutable description of one song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    prompt: String,
    lyrics: Option<String>,
    attributes: MusicalAttributes,
    clip_count: usize,
    layout: ClipLayout,
    params: GenerationParams,
    backend_preference: BackendPreference,
}

impl GenerationRequest {
    pub fn builder(prompt: impl Into<String>) -> GenerationRequestBuilder {
        GenerationRequestBuilder::new(prompt)
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn lyrics(&self) -> Option<&str> {
        self.lyrics.as_deref()
    }

    pub fn attributes(&self) -> &MusicalAttributes {
        &self.attributes
    }

    pub fn clip_count(&self) -> usize {
        self.clip_count
    }

    pub fn layout(&self) -> ClipLayout {
        self.layout
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn backend_preference(&self) -> BackendPreference {
        self.backend_preference
    }

    /// Check the request against song-wide settings
    pub fn validate_against(&self, config: &PipelineConfig) -> Result<()> {
        if self.clip_count > config.audio.max_clips {
            return Err(SongError::InvalidRequest {
                reason: format!(
                    "{} clips requested, at most {} allowed",
                    self.clip_count, config.audio.max_clips
                ),
            });
        }
        let crossfade = config.audio.crossfade_secs;
        if crossfade >= self.layout.lead_in_secs || crossfade >= self.layout.lead_out_secs {
            return Err(SongError::InvalidRequest {
                reason: format!(
                    "crossfade {:.3}s must be shorter than lead-in {:.3}s and lead-out {:.3}s",
                    crossfade, self.layout.lead_in_secs, self.layout.lead_out_secs
                ),
            });
        }
        Ok(())
    }
}

/// Builder for [`GenerationRequest`]
#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    prompt: String,
    lyrics: Option<String>,
    attributes: MusicalAttributes,
    clip_count: usize,
    layout: ClipLayout,
    params: GenerationParams,
    backend_preference: BackendPreference,
}

impl GenerationRequestBuilder {
    fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            lyrics: None,
            attributes: MusicalAttributes::default(),
            clip_count: 3,
            layout: ClipLayout::default(),
            params: GenerationParams::default(),
            backend_preference: BackendPreference::Auto,
        }
    }

    pub fn lyrics(mut self, lyrics: impl Into<String>) -> Self {
        let lyrics = lyrics.into();
        self.lyrics = if lyrics.trim().is_empty() {
            None
        } else {
            Some(lyrics)
        };
        self
    }

    pub fn genre(mut self, genre: impl Into<String>) -> Self {
        self.attributes.genre = Some(genre.into());
        self
    }

    pub fn mood(mut self, mood: impl Into<String>) -> Self {
        self.attributes.mood = Some(mood.into());
        self
    }

    pub fn tempo_bpm(mut self, bpm: u32) -> Self {
        self.attributes.tempo_bpm = Some(bpm);
        self
    }

    pub fn instruments<I, S>(mut self, instruments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.instruments = instruments.into_iter().map(Into::into).collect();
        self
    }

    pub fn attributes(mut self, attributes: MusicalAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn clip_count(mut self, clip_count: usize) -> Self {
        self.clip_count = clip_count;
        self
    }

    pub fn layout(mut self, layout: ClipLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.params.seed = Some(seed);
        self
    }

    pub fn backend_preference(mut self, preference: BackendPreference) -> Self {
        self.backend_preference = preference;
        self
    }

    /// Validate intrinsic constraints and freeze the request
    pub fn build(self) -> Result<GenerationRequest> {
        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        if self.clip_count == 0 {
            return Err(invalid("clip_count must be at least 1"));
        }
        let layout = self.layout;
        let sections = [layout.lead_in_secs, layout.main_secs, layout.lead_out_secs];
        if sections.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(invalid("lead-in, main and lead-out must all be positive"));
        }
        if !(self.params.temperature > 0.0) || !(self.params.guidance_scale > 0.0) {
            return Err(invalid("temperature and guidance_scale must be positive"));
        }
        if self.params.inference_steps == 0 {
            return Err(invalid("inference_steps must be at least 1"));
        }

        Ok(GenerationRequest {
            prompt: self.prompt.trim().to_string(),
            lyrics: self.lyrics,
            attributes: self.attributes,
            clip_count: self.clip_count,
            layout,
            params: self.params,
            backend_preference: self.backend_preference,
        })
    }
}

fn invalid(reason: &str) -> SongError {
    SongError::InvalidRequest {
        reason: reason.to_string(),
    }
}

/// Style hints passed to backends and the vocal synthesizer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleHints {
    pub genre: Option<String>,
    pub mood: Option<String>,
    pub tempo_bpm: Option<u32>,
}

/// What a backend is asked to render for one clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSpec {
    /// Full prompt text including the descriptive suffix
    pub text: String,
    pub lyrics: Option<String>,
    pub style: StyleHints,
    pub duration_secs: f64,
    pub params: GenerationParams,
}

impl PromptSpec {
    /// Compose the backend prompt for every clip of a request
    pub fn compose(request: &GenerationRequest) -> Self {
        let attributes = request.attributes();
        Self {
            text: compose_prompt_text(request.prompt(), attributes, request.lyrics().is_some()),
            lyrics: request.lyrics().map(str::to_string),
            style: StyleHints {
                genre: attributes.genre.clone(),
                mood: attributes.mood.clone(),
                tempo_bpm: attributes.tempo_bpm,
            },
            duration_secs: request.layout().total_secs(),
            params: request.params,
        }
    }

    /// Same clip without vocals, for backends that cannot sing
    pub fn instrumental(&self) -> Self {
        let mut spec = self.clone();
        spec.lyrics = None;
        if let Some(prefix) = spec.text.strip_suffix("with vocals") {
            spec.text = format!("{}instrumental", prefix);
        }
        spec
    }
}

/// `"<prompt>. <genre> music, <mood> mood, <pace> tempo, with <instruments>, with vocals|instrumental"`
pub fn compose_prompt_text(prompt: &str, attributes: &MusicalAttributes, has_vocals: bool) -> String {
    let mut parts = Vec::new();

    let genre = attributes.genre.as_deref().unwrap_or("pop");
    parts.push(format!("{} music", genre));

    if let Some(mood) = attributes.mood.as_deref() {
        if !mood.eq_ignore_ascii_case("neutral") && !mood.trim().is_empty() {
            parts.push(format!("{} mood", mood));
        }
    }

    if let Some(bpm) = attributes.tempo_bpm {
        let pace = if bpm < 90 {
            "slow"
        } else if bpm > 140 {
            "fast"
        } else {
            "medium"
        };
        parts.push(format!("{} tempo", pace));
    }

    if !attributes.instruments.is_empty() {
        parts.push(format!("with {}", attributes.instruments.join(", ")));
    }

    parts.push(if has_vocals { "with vocals" } else { "instrumental" }.to_string());

    let suffix = parts.join(", ");
    if prompt.trim().is_empty() {
        suffix
    } else {
        format!("{}. {}", prompt.trim(), suffix)
    }
}
