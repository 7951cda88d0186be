//! Background loop asset: WAV decoding and the once-per-format conversion cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::audio::normalize::FormatNormalizer;
use crate::buffering::AudioBlock;
use crate::error::{DuckmixError, Result};

/// Decode a WAV file into an interleaved f32 block.
///
/// Accepts 32-bit float and 8/16/24/32-bit integer PCM.
pub fn load_wav(path: &Path) -> Result<AudioBlock> {
    let asset_err = |reason: String| DuckmixError::AssetLoad {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = hound::WavReader::open(path).map_err(|e| asset_err(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(asset_err("header declares zero channels or rate".into()));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| asset_err(e.to_string()))?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / (1i32 << (spec.bits_per_sample - 1)) as f32))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| asset_err(e.to_string()))?,
        hound::SampleFormat::Int => {
            let max = ((1i64 << (spec.bits_per_sample - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| asset_err(e.to_string()))?
        }
    };

    let block = AudioBlock::interleaved_f32(spec.sample_rate, spec.channels, samples);
    if block.is_empty() {
        return Err(asset_err("file contains no audio frames".into()));
    }
    Ok(block)
}

/// Where the loop comes from.
#[derive(Debug, Clone)]
enum MusicSource {
    None,
    File(PathBuf),
    Block(Arc<AudioBlock>),
}

/// The background loop, converted to render format at most once per format.
#[derive(Debug)]
pub struct MusicAsset {
    source: MusicSource,
    prepared: Option<Arc<AudioBlock>>,
}

impl MusicAsset {
    /// Load from a WAV file on first use.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: MusicSource::File(path.into()),
            prepared: None,
        }
    }

    /// Use an already decoded block.
    pub fn from_block(block: AudioBlock) -> Self {
        Self {
            source: MusicSource::Block(Arc::new(block)),
            prepared: None,
        }
    }

    /// No background music; ducking still runs.
    pub fn none() -> Self {
        Self {
            source: MusicSource::None,
            prepared: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.prepared.is_some()
    }

    /// The loop in `normalizer`'s render format, loading and converting it
    /// if needed. Failures are logged and yield `None`.
    pub fn prepare(&mut self, normalizer: &FormatNormalizer) -> Option<Arc<AudioBlock>> {
        let render = normalizer.render_format().block_format();
        if let Some(prepared) = &self.prepared {
            if prepared.format() == render {
                return Some(Arc::clone(prepared));
            }
        }

        let decoded = match &self.source {
            MusicSource::None => return None,
            MusicSource::Block(block) => Arc::clone(block),
            MusicSource::File(path) => match load_wav(path) {
                Ok(block) => Arc::new(block),
                Err(e) => {
                    warn!("background music unavailable, continuing without it: {e}");
                    return None;
                }
            },
        };

        match normalizer.convert_once(&decoded) {
            Ok(block) if !block.is_empty() => {
                info!(
                    frames = block.frames,
                    sample_rate = block.sample_rate,
                    "background music prepared"
                );
                let block = Arc::new(block);
                self.prepared = Some(Arc::clone(&block));
                Some(block)
            }
            Ok(_) => {
                warn!("background music converted to zero frames, skipping");
                None
            }
            Err(e) => {
                warn!("background music conversion failed, continuing without it: {e}");
                None
            }
        }
    }
}
