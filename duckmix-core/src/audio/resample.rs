//! Planar multi-channel sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Remote voice arrives at whatever rate the transport negotiated (often
//! 16 or 24 kHz) while the render graph runs at the output device rate
//! (commonly 48 kHz). `RateConverter` bridges that gap on the processing
//! queue, where allocation is allowed.
//!
//! Input is accumulated until a full rubato chunk is available; the
//! remainder is carried into the next call so a stream of small blocks
//! resamples without seams. `flush()` drains the remainder for one-shot
//! conversions such as the music asset.
//!
//! When source rate == target rate no rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{DuckmixError, Result};

/// Converts planar f32 audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Per-channel accumulation buffers holding partial input chunks.
    input_buf: Vec<Vec<f32>>,
    /// How many input frames rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[channels][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    channels: usize,
    ratio: f64,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `source_rate`: Sample rate of the incoming audio (Hz).
    /// - `target_rate`: Sample rate of the render graph (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `480`).
    /// - `channels`: Number of planar channels converted together.
    ///
    /// # Errors
    /// Returns `DuckmixError::Conversion` if rubato fails to initialise.
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        chunk_size: usize,
        channels: usize,
    ) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(DuckmixError::Conversion(format!(
                "invalid rate pair {source_rate} -> {target_rate}"
            )));
        }
        let channels = channels.max(1);
        let ratio = target_rate as f64 / source_rate as f64;

        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: vec![Vec::new(); channels],
                chunk_size,
                output_buf: Vec::new(),
                channels,
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            channels,
        )
        .map_err(|e| DuckmixError::Conversion(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; channels];

        tracing::debug!(
            source_rate,
            target_rate,
            chunk_size,
            channels,
            max_out,
            "rate converter created"
        );

        Ok(Self {
            resampler: Some(resampler),
            input_buf: vec![Vec::new(); channels],
            chunk_size,
            output_buf,
            channels,
            ratio,
        })
    }

    /// Process incoming planar samples, returning resampled planar output
    /// (channels may be empty while rubato is still accumulating).
    ///
    /// `input` must have exactly `channels` equally long channels.
    pub fn process(&mut self, input: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        if input.len() != self.channels {
            return Err(DuckmixError::Conversion(format!(
                "expected {} channels, got {}",
                self.channels,
                input.len()
            )));
        }

        let Some(ref mut resampler) = self.resampler else {
            return Ok(input.to_vec());
        };

        for (buf, chan) in self.input_buf.iter_mut().zip(input) {
            buf.extend_from_slice(chan);
        }

        let mut result = vec![Vec::new(); self.channels];

        while self.input_buf[0].len() >= self.chunk_size {
            let slices: Vec<&[f32]> = self
                .input_buf
                .iter()
                .map(|c| &c[..self.chunk_size])
                .collect();

            match resampler.process_into_buffer(&slices, &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    for (out, chan) in result.iter_mut().zip(&self.output_buf) {
                        out.extend_from_slice(&chan[..produced]);
                    }
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                    return Err(DuckmixError::Conversion(e.to_string()));
                }
            }

            for buf in &mut self.input_buf {
                buf.drain(..self.chunk_size);
            }
        }

        Ok(result)
    }

    /// Push any buffered remainder through the resampler (zero-padded) and
    /// return the tail. Used at the end of a finite conversion.
    pub fn flush(&mut self) -> Result<Vec<Vec<f32>>> {
        let Some(ref mut resampler) = self.resampler else {
            return Ok(vec![Vec::new(); self.channels]);
        };
        let remaining = self.input_buf[0].len();
        if remaining == 0 {
            return Ok(vec![Vec::new(); self.channels]);
        }

        let slices: Vec<&[f32]> = self.input_buf.iter().map(Vec::as_slice).collect();
        let (_consumed, produced) = resampler
            .process_partial_into_buffer(Some(&slices), &mut self.output_buf, None)
            .map_err(|e| DuckmixError::Conversion(e.to_string()))?;

        // Only the share of output that corresponds to real input.
        let keep = ((remaining as f64 * self.ratio).ceil() as usize).min(produced);
        let tail = self
            .output_buf
            .iter()
            .map(|chan| chan[..keep].to_vec())
            .collect();

        for buf in &mut self.input_buf {
            buf.clear();
        }
        Ok(tail)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Target/source rate ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}
