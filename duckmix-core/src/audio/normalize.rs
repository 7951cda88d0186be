//! Conversion of arbitrary incoming blocks into the engine's `RenderFormat`.
//!
//! ## Pipeline (per block)
//!
//! ```text
//! validate → decode (i16/interleaved → planar f32) → channel map → resample
//! ```
//!
//! Blocks already in render format are copied, never aliased: transports
//! commonly recycle or zero their buffers as soon as delivery returns.
//!
//! Resamplers are stateful and created lazily, one per distinct source
//! `BlockFormat`, so a stream of small blocks converts without seams.

use std::collections::HashMap;

use tracing::debug;

use super::resample::RateConverter;
use crate::buffering::{AudioBlock, BlockFormat, RenderFormat, SampleBuffer};
use crate::error::{DuckmixError, Result};

/// Converts blocks to one fixed render format, caching converters by source format.
pub struct FormatNormalizer {
    render: RenderFormat,
    min_block_frames: usize,
    converters: HashMap<BlockFormat, RateConverter>,
}

impl FormatNormalizer {
    pub fn new(render: RenderFormat, min_block_frames: usize) -> Self {
        Self {
            render,
            min_block_frames: min_block_frames.max(1),
            converters: HashMap::new(),
        }
    }

    pub fn render_format(&self) -> RenderFormat {
        self.render
    }

    /// Number of cached stream converters.
    pub fn converter_count(&self) -> usize {
        self.converters.len()
    }

    /// Drop all cached converters (and their buffered remainders).
    pub fn clear(&mut self) {
        self.converters.clear();
    }

    /// Convert one streaming block to render format.
    ///
    /// # Errors
    /// `MalformedBlock` for inconsistent input, `Conversion` if the resampler
    /// cannot be created or fails. Callers drop the block on error.
    pub fn normalize(&mut self, block: &AudioBlock) -> Result<AudioBlock> {
        block.validate()?;
        let source = block.format();

        if source == self.render.block_format() {
            return Ok(copy_planar(block));
        }

        let planar = map_channels(block.to_planar_f32()?, self.render.channels as usize);
        if block.sample_rate == self.render.sample_rate {
            return Ok(AudioBlock::planar_f32(self.render.sample_rate, planar));
        }

        let capacity = destination_capacity(
            block.frames,
            block.sample_rate,
            self.render.sample_rate,
            self.min_block_frames,
        );

        let converter = match self.converters.entry(source) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                debug!(
                    source_rate = source.sample_rate,
                    source_channels = source.channels,
                    target_rate = self.render.sample_rate,
                    "creating stream converter"
                );
                e.insert(RateConverter::new(
                    source.sample_rate,
                    self.render.sample_rate,
                    stream_chunk_frames(source.sample_rate),
                    self.render.channels as usize,
                )?)
            }
        };

        let converted = converter.process(&planar)?;
        Ok(AudioBlock::planar_f32(
            self.render.sample_rate,
            with_capacity(converted, capacity),
        ))
    }

    /// Convert a complete, finite block (e.g. a decoded asset) in one pass.
    ///
    /// Uses a throwaway converter and flushes it, so the cache is untouched.
    pub fn convert_once(&self, block: &AudioBlock) -> Result<AudioBlock> {
        block.validate()?;
        if block.format() == self.render.block_format() {
            return Ok(copy_planar(block));
        }

        let planar = map_channels(block.to_planar_f32()?, self.render.channels as usize);
        if block.sample_rate == self.render.sample_rate {
            return Ok(AudioBlock::planar_f32(self.render.sample_rate, planar));
        }

        let mut converter = RateConverter::new(
            block.sample_rate,
            self.render.sample_rate,
            stream_chunk_frames(block.sample_rate),
            self.render.channels as usize,
        )?;
        let capacity = destination_capacity(
            block.frames,
            block.sample_rate,
            self.render.sample_rate,
            self.min_block_frames,
        );

        let mut out = with_capacity(converter.process(&planar)?, capacity);
        for (chan, tail) in out.iter_mut().zip(converter.flush()?) {
            chan.extend_from_slice(&tail);
        }
        Ok(AudioBlock::planar_f32(self.render.sample_rate, out))
    }
}

/// `max(minimum, ceil(source_frames * dst_rate / src_rate))`.
pub fn destination_capacity(
    source_frames: usize,
    source_rate: u32,
    target_rate: u32,
    minimum: usize,
) -> usize {
    if source_rate == 0 {
        return minimum;
    }
    let scaled = (source_frames as f64 * target_rate as f64 / source_rate as f64).ceil() as usize;
    scaled.max(minimum)
}

/// Rubato chunk for streaming conversion: 10 ms at the source rate.
fn stream_chunk_frames(source_rate: u32) -> usize {
    (source_rate as usize / 100).max(32)
}

fn copy_planar(block: &AudioBlock) -> AudioBlock {
    let channels = match &block.data {
        SampleBuffer::PlanarF32(chans) => chans[..block.channels as usize]
            .iter()
            .map(|c| c[..block.frames].to_vec())
            .collect(),
        // Only reached for planar f32 input.
        _ => Vec::new(),
    };
    AudioBlock::planar_f32(block.sample_rate, channels)
}

fn with_capacity(channels: Vec<Vec<f32>>, capacity: usize) -> Vec<Vec<f32>> {
    channels
        .into_iter()
        .map(|c| {
            let mut out = Vec::with_capacity(capacity.max(c.len()));
            out.extend_from_slice(&c);
            out
        })
        .collect()
}

/// Map `planar` onto `target` channels.
///
/// Fewer source channels are duplicated (`dst[c] = src[min(c, n-1)]`);
/// surplus channels are averaged into mono or truncated for multi-channel.
pub fn map_channels(planar: Vec<Vec<f32>>, target: usize) -> Vec<Vec<f32>> {
    let source = planar.len();
    if source == target || source == 0 {
        return planar;
    }
    if target == 1 {
        let frames = planar[0].len();
        let mut mono = vec![0f32; frames];
        for chan in &planar {
            for (m, s) in mono.iter_mut().zip(chan) {
                *m += *s;
            }
        }
        let scale = 1.0 / source as f32;
        mono.iter_mut().for_each(|m| *m *= scale);
        return vec![mono];
    }
    (0..target)
        .map(|c| planar[c.min(source - 1)].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::SampleFormat;

    fn render() -> RenderFormat {
        RenderFormat::new(48_000, 2)
    }

    #[test]
    fn matching_format_is_copied_not_aliased() {
        let mut norm = FormatNormalizer::new(render(), 1024);
        let block = AudioBlock::planar_f32(48_000, vec![vec![0.25; 64], vec![-0.25; 64]]);
        let out = norm.normalize(&block).expect("normalize");
        assert_eq!(out, block);
        // Distinct backing memory.
        assert_ne!(
            out.channel(0).unwrap().as_ptr(),
            block.channel(0).unwrap().as_ptr()
        );
        assert_eq!(norm.converter_count(), 0);
    }

    #[test]
    fn mono_i16_interleaved_same_rate_is_decoded_and_upmixed() {
        let mut norm = FormatNormalizer::new(render(), 1024);
        let block = AudioBlock::interleaved_i16(48_000, 1, vec![16384; 32]);
        let out = norm.normalize(&block).expect("normalize");
        assert_eq!(out.format(), render().block_format());
        assert_eq!(out.frames, 32);
        assert_eq!(out.channel(1).unwrap()[0], 0.5);
        assert_eq!(norm.converter_count(), 0);
    }

    #[test]
    fn rate_change_caches_one_converter_per_source_format() {
        let mut norm = FormatNormalizer::new(render(), 1024);
        let block = AudioBlock::planar_f32(16_000, vec![vec![0.1; 320]]);
        let out = norm.normalize(&block).expect("normalize");
        assert_eq!(out.sample_rate, 48_000);
        assert_eq!(out.channels, 2);
        norm.normalize(&block).expect("normalize again");
        assert_eq!(norm.converter_count(), 1);

        let other = AudioBlock::interleaved_i16(24_000, 1, vec![0; 480]);
        norm.normalize(&other).expect("normalize other");
        assert_eq!(norm.converter_count(), 2);

        norm.clear();
        assert_eq!(norm.converter_count(), 0);
    }

    #[test]
    fn malformed_block_is_rejected() {
        let mut norm = FormatNormalizer::new(render(), 1024);
        let mut block = AudioBlock::planar_f32(16_000, vec![vec![0.1; 320]]);
        block.frames = 400;
        assert!(norm.normalize(&block).is_err());
    }

    #[test]
    fn convert_once_flushes_whole_asset() {
        let norm = FormatNormalizer::new(render(), 1024);
        let block = AudioBlock::planar_f32(24_000, vec![vec![0.2; 1_000], vec![0.2; 1_000]]);
        let out = norm.convert_once(&block).expect("convert");
        assert!(
            (out.frames as isize - 2_000).unsigned_abs() <= 20,
            "frames={}",
            out.frames
        );
        assert_eq!(out.format().sample_format, SampleFormat::F32);
        assert_eq!(norm.converter_count(), 0);
    }

    #[test]
    fn destination_capacity_respects_minimum() {
        assert_eq!(destination_capacity(100, 16_000, 48_000, 1024), 1024);
        assert_eq!(destination_capacity(1_000, 16_000, 48_000, 1024), 3_000);
        assert_eq!(destination_capacity(1, 3, 4, 0), 2);
    }

    #[test]
    fn downmix_to_mono_averages() {
        let out = map_channels(vec![vec![1.0, 0.0], vec![0.0, 1.0]], 1);
        assert_eq!(out, vec![vec![0.5, 0.5]]);
    }
}
