//! Songchain - multi-clip song generation
//!
//! Songchain turns one request into a song longer than any single
//! generation call by chaining fixed-length clips:
//!
//! 1. A [`backend::BackendSelector`] resolves the primary (GPU) or
//!    fallback generation backend once per song.
//! 2. Each clip is generated conditioned on the previous clip's lead-out,
//!    split into stems, enhanced per stem and mixed back.
//! 3. Clips are crossfaded into one waveform and mastered.
//!
//! # Architecture
//!
//! Every stage boundary runs [`engine::AudioValidator`]; a waveform below
//! the validity floor is an error, never replaced with silence. Long-lived
//! models live in a [`registry::ModelRegistry`] passed into the
//! [`pipeline::SongPipeline`].

pub mod backend;
pub mod chain;
pub mod cli;
pub mod clip;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod mastering;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod song;
pub mod stems;
pub mod telemetry;
pub mod vocal;

pub use config::PipelineConfig;
pub use error::{Result, SongError};
pub use estimator::{TimeEstimate, TimeEstimator};
pub use pipeline::SongPipeline;
pub use registry::ModelRegistry;
pub use request::{BackendPreference, ClipLayout, GenerationRequest};
pub use song::{Song, SongState, Stage};
