//! Typed audio blocks exchanged between the transport, the normalizer and the mix graph.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DuckmixError, Result};

/// Sample encoding of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 32-bit float in [-1.0, 1.0].
    F32,
    /// 16-bit signed integer.
    I16,
}

/// Channel arrangement of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// One buffer, frames stored `[l, r, l, r, ...]`.
    Interleaved,
    /// One buffer per channel.
    Planar,
}

/// Full description of a block's encoding. Used as the converter cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub layout: Layout,
}

/// The engine's canonical internal format: planar f32 at the output device rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl RenderFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// The equivalent `BlockFormat` (planar f32).
    pub fn block_format(&self) -> BlockFormat {
        BlockFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: SampleFormat::F32,
            layout: Layout::Planar,
        }
    }

    /// Number of frames covering `duration` at this rate (rounded up).
    pub fn frames_for(&self, duration: Duration) -> usize {
        let nanos = duration.as_nanos() * self.sample_rate as u128;
        nanos.div_ceil(1_000_000_000) as usize
    }
}

/// Backing storage of an `AudioBlock`.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    InterleavedF32(Vec<f32>),
    InterleavedI16(Vec<i16>),
    PlanarF32(Vec<Vec<f32>>),
    PlanarI16(Vec<Vec<i16>>),
}

impl SampleBuffer {
    pub fn sample_format(&self) -> SampleFormat {
        match self {
            SampleBuffer::InterleavedF32(_) | SampleBuffer::PlanarF32(_) => SampleFormat::F32,
            SampleBuffer::InterleavedI16(_) | SampleBuffer::PlanarI16(_) => SampleFormat::I16,
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            SampleBuffer::InterleavedF32(_) | SampleBuffer::InterleavedI16(_) => {
                Layout::Interleaved
            }
            SampleBuffer::PlanarF32(_) | SampleBuffer::PlanarI16(_) => Layout::Planar,
        }
    }
}

/// A chunk of audio at a known rate, channel count and encoding.
///
/// Blocks are treated as immutable once produced; stages take ownership or
/// borrow, never mutate a block another stage still holds.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: usize,
    pub data: SampleBuffer,
}

impl AudioBlock {
    /// Planar f32 block. Frame count is taken from the first channel.
    pub fn planar_f32(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.first().map(Vec::len).unwrap_or(0);
        Self {
            sample_rate,
            channels: channels.len() as u16,
            frames,
            data: SampleBuffer::PlanarF32(channels),
        }
    }

    /// Planar i16 block. Frame count is taken from the first channel.
    pub fn planar_i16(sample_rate: u32, channels: Vec<Vec<i16>>) -> Self {
        let frames = channels.first().map(Vec::len).unwrap_or(0);
        Self {
            sample_rate,
            channels: channels.len() as u16,
            frames,
            data: SampleBuffer::PlanarI16(channels),
        }
    }

    /// Interleaved f32 block. Trailing partial frames are not counted.
    pub fn interleaved_f32(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        let frames = samples.len().checked_div(channels as usize).unwrap_or(0);
        Self {
            sample_rate,
            channels,
            frames,
            data: SampleBuffer::InterleavedF32(samples),
        }
    }

    /// Interleaved i16 block. Trailing partial frames are not counted.
    pub fn interleaved_i16(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        let frames = samples.len().checked_div(channels as usize).unwrap_or(0);
        Self {
            sample_rate,
            channels,
            frames,
            data: SampleBuffer::InterleavedI16(samples),
        }
    }

    /// A silent planar f32 block in `format`.
    pub fn silence(format: RenderFormat, frames: usize) -> Self {
        Self::planar_f32(
            format.sample_rate,
            vec![vec![0.0; frames]; format.channels as usize],
        )
    }

    pub fn format(&self) -> BlockFormat {
        BlockFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: self.data.sample_format(),
            layout: self.data.layout(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Playback duration at the block's own sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames as f64 / self.sample_rate as f64)
    }

    /// Planar f32 channel data, if the block is planar f32 and the channel exists.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        match &self.data {
            SampleBuffer::PlanarF32(chans) => chans.get(index).map(Vec::as_slice),
            _ => None,
        }
    }

    /// Check that the declared channel/frame counts are backed by real data.
    ///
    /// # Errors
    /// `DuckmixError::MalformedBlock` when a channel is missing or short, the
    /// interleaved buffer is too small, or the rate/channel count is zero.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(DuckmixError::MalformedBlock("sample rate is zero".into()));
        }
        if self.channels == 0 {
            return Err(DuckmixError::MalformedBlock("channel count is zero".into()));
        }
        let ch = self.channels as usize;
        let needed = self.frames.checked_mul(ch);
        let ok = match &self.data {
            SampleBuffer::InterleavedF32(s) => needed.is_some_and(|n| s.len() >= n),
            SampleBuffer::InterleavedI16(s) => needed.is_some_and(|n| s.len() >= n),
            SampleBuffer::PlanarF32(c) => c.len() >= ch && c[..ch].iter().all(|v| v.len() >= self.frames),
            SampleBuffer::PlanarI16(c) => c.len() >= ch && c[..ch].iter().all(|v| v.len() >= self.frames),
        };
        if ok {
            Ok(())
        } else {
            Err(DuckmixError::MalformedBlock(format!(
                "{} channels x {} frames not backed by sample data",
                self.channels, self.frames
            )))
        }
    }

    /// Overwrite every sample with silence, keeping format and length.
    pub fn zero_in_place(&mut self) {
        match &mut self.data {
            SampleBuffer::InterleavedF32(s) => s.fill(0.0),
            SampleBuffer::InterleavedI16(s) => s.fill(0),
            SampleBuffer::PlanarF32(c) => c.iter_mut().for_each(|v| v.fill(0.0)),
            SampleBuffer::PlanarI16(c) => c.iter_mut().for_each(|v| v.fill(0)),
        }
    }

    /// Decode into planar f32 channels, preserving rate and channel count.
    pub fn to_planar_f32(&self) -> Result<Vec<Vec<f32>>> {
        self.validate()?;
        let ch = self.channels as usize;
        let frames = self.frames;
        let out = match &self.data {
            SampleBuffer::PlanarF32(c) => c[..ch].iter().map(|v| v[..frames].to_vec()).collect(),
            SampleBuffer::PlanarI16(c) => c[..ch]
                .iter()
                .map(|v| v[..frames].iter().map(|s| i16_to_f32(*s)).collect())
                .collect(),
            SampleBuffer::InterleavedF32(s) => (0..ch)
                .map(|c| (0..frames).map(|f| s[f * ch + c]).collect())
                .collect(),
            SampleBuffer::InterleavedI16(s) => (0..ch)
                .map(|c| (0..frames).map(|f| i16_to_f32(s[f * ch + c])).collect())
                .collect(),
        };
        Ok(out)
    }
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_frames_ignore_partial_tail() {
        let block = AudioBlock::interleaved_f32(48_000, 2, vec![0.0; 7]);
        assert_eq!(block.frames, 3);
        assert!(block.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_channel() {
        let mut block = AudioBlock::planar_f32(48_000, vec![vec![0.0; 4], vec![0.0; 4]]);
        block.channels = 3;
        assert!(matches!(
            block.validate(),
            Err(DuckmixError::MalformedBlock(_))
        ));
    }

    #[test]
    fn validate_rejects_frame_count_that_overflows() {
        let mut block = AudioBlock::interleaved_f32(48_000, 2, vec![0.1; 8]);
        block.frames = usize::MAX / 2 + 1;
        assert!(matches!(
            block.validate(),
            Err(DuckmixError::MalformedBlock(_))
        ));
        assert!(block.to_planar_f32().is_err());

        let mut block = AudioBlock::interleaved_i16(48_000, 3, vec![1; 9]);
        block.frames = usize::MAX / 3 + 1;
        assert!(block.validate().is_err());
    }

    #[test]
    fn to_planar_deinterleaves_and_scales_i16() {
        let block = AudioBlock::interleaved_i16(16_000, 2, vec![16384, -16384, 0, 32767]);
        let planar = block.to_planar_f32().expect("decode");
        assert_eq!(planar.len(), 2);
        assert_eq!(planar[0], vec![0.5, 0.0]);
        assert_eq!(planar[1][0], -0.5);
    }

    #[test]
    fn render_format_matches_planar_f32_blocks_only() {
        let render = RenderFormat::new(48_000, 2);
        let planar = AudioBlock::silence(render, 16);
        assert_eq!(planar.format(), render.block_format());

        let interleaved = AudioBlock::interleaved_f32(48_000, 2, vec![0.0; 32]);
        assert_ne!(interleaved.format(), render.block_format());
    }

    #[test]
    fn zero_in_place_keeps_shape() {
        let mut block = AudioBlock::interleaved_i16(16_000, 1, vec![1200, -40, 7]);
        block.zero_in_place();
        assert_eq!(block.frames, 3);
        assert_eq!(block.data, SampleBuffer::InterleavedI16(vec![0, 0, 0]));
    }

    #[test]
    fn duration_uses_block_rate() {
        let block = AudioBlock::planar_f32(16_000, vec![vec![0.0; 8_000]]);
        assert_eq!(block.duration(), Duration::from_millis(500));
    }
}
