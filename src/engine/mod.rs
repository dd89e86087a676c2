//! Audio Engine Module
//!
//! Waveform plumbing shared by every stage:
//! - Audio buffer management
//! - Validity checks at stage boundaries
//! - WAV file I/O

pub mod buffer;
pub mod io;
pub mod validator;

pub use buffer::{AudioBuffer, ChannelLayout};
pub use io::{export_audio, generate_test_tone, import_audio, ExportFormat};
pub use validator::{AudioValidator, SignalLevels};
