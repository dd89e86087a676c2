//! Audio file I/O for Songchain
//!
//! WAV is the only container: finished songs are exported as WAV and the
//! bridge collaborators exchange audio as in-memory WAV payloads.

use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::engine::buffer::AudioBuffer;
use crate::error::{Result, SongError};

/// Export format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExportFormat {
    /// Target sample rate; `None` keeps the song rate
    pub sample_rate: Option<u32>,
    /// Bit depth: 16, 24 (PCM) or 32 (float)
    pub bit_depth: u16,
}

impl Default for ExportFormat {
    fn default() -> Self {
        ExportFormat {
            sample_rate: None,
            bit_depth: 16,
        }
    }
}

impl ExportFormat {
    /// Create a new export format
    pub fn new(sample_rate: Option<u32>, bit_depth: u16) -> Self {
        ExportFormat {
            sample_rate,
            bit_depth,
        }
    }

    /// CD quality (44.1kHz, 16-bit)
    pub fn cd_quality() -> Self {
        ExportFormat {
            sample_rate: Some(44_100),
            bit_depth: 16,
        }
    }

    /// 24-bit PCM at the song rate
    pub fn high_quality() -> Self {
        ExportFormat {
            sample_rate: None,
            bit_depth: 24,
        }
    }

    /// 32-bit float at the song rate
    pub fn float32() -> Self {
        ExportFormat {
            sample_rate: None,
            bit_depth: 32,
        }
    }
}

/// Import a WAV file as float samples at its native rate
pub fn import_audio(path: &Path) -> Result<AudioBuffer> {
    if !path.exists() {
        return Err(SongError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }
    let reader = WavReader::open(path)?;
    read_wav(reader)
}

/// Decode an in-memory WAV payload
pub fn decode_wav_bytes(bytes: &[u8]) -> Result<AudioBuffer> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    read_wav(reader)
}

/// Export an AudioBuffer to a WAV file
pub fn export_audio(buffer: &AudioBuffer, path: &Path, format: ExportFormat) -> Result<()> {
    let spec = wav_spec(buffer, format)?;
    let writer = WavWriter::create(path, spec)?;
    write_wav(writer, buffer, format)
}

/// Encode a buffer as an in-memory 32-bit float WAV payload
pub fn encode_wav_bytes(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let format = ExportFormat::float32();
    let spec = wav_spec(buffer, format)?;
    let mut cursor = Cursor::new(Vec::new());
    {
        let writer = WavWriter::new(&mut cursor, spec)?;
        write_wav(writer, buffer, format)?;
    }
    Ok(cursor.into_inner())
}

/// Generate a mono test tone (sine wave)
pub fn generate_test_tone(frequency: f32, duration_secs: f32, sample_rate: u32) -> AudioBuffer {
    let num_samples = (duration_secs * sample_rate as f32) as usize;
    let angular_freq = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
    let samples = (0..num_samples)
        .map(|i| (angular_freq * i as f32).sin())
        .collect();
    AudioBuffer::from_mono(samples, sample_rate)
}

// ============================================================================
// Internal helper functions
// ============================================================================

fn wav_spec(buffer: &AudioBuffer, format: ExportFormat) -> Result<WavSpec> {
    let sample_format = match format.bit_depth {
        16 | 24 => SampleFormat::Int,
        32 => SampleFormat::Float,
        other => {
            return Err(SongError::InvalidAudio {
                reason: format!("{}-bit export (only 16, 24, 32 supported)", other),
            })
        }
    };
    Ok(WavSpec {
        channels: buffer.channels() as u16,
        sample_rate: format.sample_rate.unwrap_or(buffer.sample_rate),
        bits_per_sample: format.bit_depth,
        sample_format,
    })
}

fn write_wav<W: Write + Seek>(
    mut writer: WavWriter<W>,
    buffer: &AudioBuffer,
    format: ExportFormat,
) -> Result<()> {
    let resampled;
    let source = match format.sample_rate {
        Some(rate) if rate != buffer.sample_rate => {
            resampled = buffer.resample(rate);
            &resampled
        }
        _ => buffer,
    };

    let interleaved = source.to_interleaved();
    match format.bit_depth {
        16 => {
            for sample in interleaved {
                writer.write_sample((sample * 32767.0).clamp(-32768.0, 32767.0) as i16)?;
            }
        }
        24 => {
            for sample in interleaved {
                // 24-bit stored as i32 in hound
                writer.write_sample((sample * 8388607.0).clamp(-8388608.0, 8388607.0) as i32)?;
            }
        }
        _ => {
            for sample in interleaved {
                writer.write_sample(sample)?;
            }
        }
    }

    writer.finalize()?;
    Ok(())
}

fn read_wav<R: Read>(mut reader: WavReader<R>) -> Result<AudioBuffer> {
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8388608.0))
            .collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 2147483648.0))
            .collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, bits) => {
            return Err(SongError::InvalidAudio {
                reason: format!("{}-bit integer audio", bits),
            })
        }
    };

    AudioBuffer::from_interleaved(&samples, channels, spec.sample_rate)
}

// ============================================================================
// Tests
// ============================================================================
