//! Audio Buffer Management
//!
//! Provides the waveform type passed between every pipeline stage.
//! Samples are stored non-interleaved as 32-bit floats; the sample rate
//! travels with the buffer so stages can reject mismatched inputs.

use crate::error::{Result, SongError};

// ============================================================================
// Constants
// ============================================================================

/// Default song sample rate (44.1kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

// ============================================================================
// Helper Functions
// ============================================================================

/// Convert decibels to linear amplitude
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear amplitude to decibels
///
/// Returns -f32::INFINITY for zero input.
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * linear.log10()
    }
}

/// Convert seconds to a frame count at the given rate (rounded)
#[inline]
pub fn secs_to_frames(secs: f64, sample_rate: u32) -> usize {
    (secs * sample_rate as f64).round().max(0.0) as usize
}

// ============================================================================
// Channel Layout
// ============================================================================

/// Audio channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    /// Single channel
    Mono,
    /// Two channels (left, right)
    Stereo,
}

impl ChannelLayout {
    /// Get the number of channels for this layout
    #[inline]
    pub fn num_channels(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }

    /// Create a ChannelLayout from a channel count
    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(ChannelLayout::Mono),
            2 => Some(ChannelLayout::Stereo),
            _ => None,
        }
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        ChannelLayout::Mono
    }
}

// ============================================================================
// Audio Buffer
// ============================================================================

/// Waveform buffer shared by all pipeline stages
///
/// # Example
/// ```
/// use songchain::engine::buffer::{AudioBuffer, ChannelLayout};
///
/// let buffer = AudioBuffer::silence(8_000, ChannelLayout::Stereo, 8_000);
/// assert_eq!(buffer.channels(), 2);
/// assert_eq!(buffer.len(), 8_000);
/// assert_eq!(buffer.duration_secs(), 1.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Sample data: outer Vec is channels, inner Vec is frames
    pub samples: Vec<Vec<f32>>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create a zeroed buffer
    pub fn silence(num_frames: usize, layout: ChannelLayout, sample_rate: u32) -> Self {
        Self {
            samples: vec![vec![0.0; num_frames]; layout.num_channels()],
            sample_rate,
        }
    }

    /// Wrap a single channel of samples
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: vec![samples],
            sample_rate,
        }
    }

    /// Build from planar channels, rejecting ragged input
    pub fn from_channels(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if channels.is_empty() {
            return Err(SongError::InvalidAudio {
                reason: "buffer has no channels".to_string(),
            });
        }
        let frames = channels[0].len();
        if channels.iter().any(|ch| ch.len() != frames) {
            return Err(SongError::InvalidAudio {
                reason: "channels have different lengths".to_string(),
            });
        }
        Ok(Self {
            samples: channels,
            sample_rate,
        })
    }

    /// Create an audio buffer from interleaved sample data
    pub fn from_interleaved(interleaved: &[f32], channels: usize, sample_rate: u32) -> Result<Self> {
        if channels == 0 || interleaved.len() % channels != 0 {
            return Err(SongError::InvalidAudio {
                reason: format!(
                    "interleaved length {} is not divisible by channel count {}",
                    interleaved.len(),
                    channels
                ),
            });
        }

        let frames = interleaved.len() / channels;
        let mut samples = vec![Vec::with_capacity(frames); channels];
        for frame in interleaved.chunks_exact(channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                samples[ch].push(sample);
            }
        }

        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// Convert the buffer to interleaved format
    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut interleaved = Vec::with_capacity(self.channels() * self.len());
        for frame in 0..self.len() {
            for channel in &self.samples {
                interleaved.push(channel[frame]);
            }
        }
        interleaved
    }

    /// Get the number of channels
    #[inline]
    pub fn channels(&self) -> usize {
        self.samples.len()
    }

    /// Get the number of frames per channel
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.first().map(|ch| ch.len()).unwrap_or(0)
    }

    /// Check if the buffer holds no frames
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the duration in seconds
    #[inline]
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.len() as f64 / self.sample_rate as f64
    }

    /// Get the channel layout
    pub fn channel_layout(&self) -> Option<ChannelLayout> {
        ChannelLayout::from_count(self.channels())
    }

    /// Get immutable access to a channel's samples
    ///
    /// # Panics
    /// Panics if the channel index is out of bounds
    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.samples[index]
    }

    /// Get mutable access to a channel's samples
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.samples[index]
    }

    /// Absolute peak across all channels (linear)
    pub fn peak(&self) -> f32 {
        self.samples
            .iter()
            .flat_map(|ch| ch.iter())
            .fold(0.0_f32, |acc, &s| acc.max(s.abs()))
    }

    /// RMS across all channels (linear)
    pub fn rms(&self) -> f32 {
        let total = self.channels() * self.len();
        if total == 0 {
            return 0.0;
        }
        let sum_squares: f64 = self
            .samples
            .iter()
            .flat_map(|ch| ch.iter())
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        (sum_squares / total as f64).sqrt() as f32
    }

    /// True if any sample is NaN or infinite
    pub fn has_non_finite(&self) -> bool {
        self.samples
            .iter()
            .flat_map(|ch| ch.iter())
            .any(|s| !s.is_finite())
    }

    /// Multiply every sample by a linear gain
    pub fn apply_gain(&mut self, gain: f32) {
        for channel in &mut self.samples {
            for sample in channel.iter_mut() {
                *sample *= gain;
            }
        }
    }

    /// Add `other * gain` into this buffer, frame for frame
    ///
    /// Both buffers must share rate, channel count and length.
    pub fn add_scaled(&mut self, other: &AudioBuffer, gain: f32) -> Result<()> {
        self.ensure_same_rate(other)?;
        if other.channels() != self.channels() || other.len() != self.len() {
            return Err(SongError::InvalidAudio {
                reason: format!(
                    "cannot sum {}x{} into {}x{}",
                    other.channels(),
                    other.len(),
                    self.channels(),
                    self.len()
                ),
            });
        }
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d += s * gain;
            }
        }
        Ok(())
    }

    /// Copy frames `[start, end)` into a new buffer (clamped to length)
    pub fn slice_frames(&self, start: usize, end: usize) -> AudioBuffer {
        let end = end.min(self.len());
        let start = start.min(end);
        AudioBuffer {
            samples: self
                .samples
                .iter()
                .map(|ch| ch[start..end].to_vec())
                .collect(),
            sample_rate: self.sample_rate,
        }
    }

    /// Copy the last `frames` frames
    pub fn tail(&self, frames: usize) -> AudioBuffer {
        let len = self.len();
        self.slice_frames(len.saturating_sub(frames), len)
    }

    /// Truncate or zero-pad every channel to exactly `frames`
    pub fn resize_frames(&mut self, frames: usize) {
        for channel in &mut self.samples {
            channel.resize(frames, 0.0);
        }
    }

    /// Append another buffer's frames
    pub fn append(&mut self, other: &AudioBuffer) -> Result<()> {
        self.ensure_same_rate(other)?;
        if other.channels() != self.channels() {
            return Err(SongError::InvalidAudio {
                reason: format!(
                    "cannot append {} channels to {} channels",
                    other.channels(),
                    self.channels()
                ),
            });
        }
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            dst.extend_from_slice(src);
        }
        Ok(())
    }

    /// Convert to the requested channel layout
    ///
    /// Mono is duplicated to stereo; stereo is averaged down to mono.
    pub fn to_layout(&self, layout: ChannelLayout) -> AudioBuffer {
        let target = layout.num_channels();
        if self.channels() == target || self.channels() == 0 {
            return self.clone();
        }
        let samples = match layout {
            ChannelLayout::Mono => {
                let scale = 1.0 / self.channels() as f32;
                let mut mixed = vec![0.0_f32; self.len()];
                for channel in &self.samples {
                    for (m, s) in mixed.iter_mut().zip(channel.iter()) {
                        *m += s * scale;
                    }
                }
                vec![mixed]
            }
            ChannelLayout::Stereo => vec![self.samples[0].clone(); target],
        };
        AudioBuffer {
            samples,
            sample_rate: self.sample_rate,
        }
    }

    /// Resample to a different rate with linear interpolation
    pub fn resample(&self, target_rate: u32) -> AudioBuffer {
        if target_rate == self.sample_rate || self.sample_rate == 0 {
            return self.clone();
        }
        let ratio = target_rate as f64 / self.sample_rate as f64;
        AudioBuffer {
            samples: self
                .samples
                .iter()
                .map(|ch| resample_linear(ch, ratio))
                .collect(),
            sample_rate: target_rate,
        }
    }

    /// Reject a buffer at a different rate
    pub fn ensure_same_rate(&self, other: &AudioBuffer) -> Result<()> {
        if self.sample_rate != other.sample_rate {
            return Err(SongError::SampleRateMismatch {
                expected: self.sample_rate,
                actual: other.sample_rate,
            });
        }
        Ok(())
    }
}

/// Linear interpolation resampling
///
/// Linear interpolation aliases when downsampling; backends normally
/// already deliver the song rate so this only bridges small mismatches.
fn resample_linear(samples: &[f32], ratio: f64) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let source_len = samples.len();
    let target_len = ((source_len as f64) * ratio).round() as usize;
    let mut output = Vec::with_capacity(target_len);

    for i in 0..target_len {
        let src_pos = i as f64 / ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = (src_pos - src_idx as f64) as f32;

        let sample = if src_idx + 1 < source_len {
            samples[src_idx] * (1.0 - frac) + samples[src_idx + 1] * frac
        } else if src_idx < source_len {
            samples[src_idx]
        } else {
            0.0
        };
        output.push(sample);
    }

    output
}

// ============================================================================
// Tests
// ============================================================================
