//! Peak/RMS hybrid level detector.
//!
//! ## Algorithm
//!
//! 1. Per channel: peak magnitude and mean square over the block.
//! 2. `peak` = max peak across channels; `rms` = sqrt(mean of the channel
//!    mean squares).
//! 3. `level = peak_weight * peak + rms_weight * rms`, clamped to [0, 1].
//!
//! Peak weighting gives a fast attack on speech onsets; the RMS term tracks
//! perceived loudness.

use super::LevelDetector;
use crate::buffering::{block::i16_to_f32, AudioBlock, SampleBuffer};

/// Default blend weights.
pub const DEFAULT_PEAK_WEIGHT: f32 = 0.7;
pub const DEFAULT_RMS_WEIGHT: f32 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct PeakRmsDetector {
    peak_weight: f32,
    rms_weight: f32,
}

impl PeakRmsDetector {
    pub fn new(peak_weight: f32, rms_weight: f32) -> Self {
        Self {
            peak_weight: peak_weight.max(0.0),
            rms_weight: rms_weight.max(0.0),
        }
    }

    /// Blend of max peak and mean RMS, or `None` for malformed input.
    fn measure(block: &AudioBlock) -> Option<(f32, f32)> {
        if block.frames == 0 || block.channels == 0 {
            return None;
        }
        block.validate().ok()?;

        let ch = block.channels as usize;
        let frames = block.frames;
        let mut max_peak = 0f32;
        let mut total_mean_sq = 0f32;

        for c in 0..ch {
            let (peak, mean_sq) = match &block.data {
                SampleBuffer::PlanarF32(chans) => channel_stats(chans[c][..frames].iter().copied()),
                SampleBuffer::PlanarI16(chans) => {
                    channel_stats(chans[c][..frames].iter().map(|s| i16_to_f32(*s)))
                }
                SampleBuffer::InterleavedF32(s) => {
                    channel_stats(s.iter().skip(c).step_by(ch).take(frames).copied())
                }
                SampleBuffer::InterleavedI16(s) => channel_stats(
                    s.iter().skip(c).step_by(ch).take(frames).map(|v| i16_to_f32(*v)),
                ),
            };
            max_peak = max_peak.max(peak);
            total_mean_sq += mean_sq;
        }

        let rms = (total_mean_sq / ch as f32).sqrt();
        Some((max_peak, rms))
    }
}

impl Default for PeakRmsDetector {
    fn default() -> Self {
        Self::new(DEFAULT_PEAK_WEIGHT, DEFAULT_RMS_WEIGHT)
    }
}

impl LevelDetector for PeakRmsDetector {
    fn level(&self, block: &AudioBlock) -> f32 {
        let Some((peak, rms)) = Self::measure(block) else {
            return 0.0;
        };
        let level = self.peak_weight * peak + self.rms_weight * rms;
        if level.is_finite() {
            level.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Peak magnitude and mean square of one channel.
fn channel_stats(samples: impl Iterator<Item = f32>) -> (f32, f32) {
    let mut peak = 0f32;
    let mut sum_sq = 0f32;
    let mut n = 0usize;
    for s in samples {
        peak = peak.max(s.abs());
        sum_sq += s * s;
        n += 1;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    (peak, sum_sq / n as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_block_is_zero() {
        let det = PeakRmsDetector::default();
        let block = AudioBlock::planar_f32(48_000, vec![vec![], vec![]]);
        assert_eq!(det.level(&block), 0.0);
    }

    #[test]
    fn missing_channel_data_is_zero() {
        let det = PeakRmsDetector::default();
        let mut block = AudioBlock::planar_f32(48_000, vec![vec![0.9; 64]]);
        block.channels = 2;
        assert_eq!(det.level(&block), 0.0);

        let mut short = AudioBlock::interleaved_f32(48_000, 2, vec![0.9; 64]);
        short.frames = 100;
        assert_eq!(det.level(&short), 0.0);

        let mut huge = AudioBlock::interleaved_f32(48_000, 2, vec![0.9; 64]);
        huge.frames = usize::MAX / 2 + 1;
        assert_eq!(det.level(&huge), 0.0);
    }

    #[test]
    fn constant_signal_level_equals_amplitude() {
        let det = PeakRmsDetector::default();
        let block = AudioBlock::planar_f32(48_000, vec![vec![0.05; 480], vec![0.05; 480]]);
        assert_abs_diff_eq!(det.level(&block), 0.05, epsilon = 1e-6);
    }

    #[test]
    fn peak_is_weighted_over_rms() {
        let det = PeakRmsDetector::default();
        // Single spike: peak 1.0, rms = sqrt(1/100) = 0.1
        let mut samples = vec![0.0f32; 100];
        samples[10] = 1.0;
        let block = AudioBlock::planar_f32(16_000, vec![samples]);
        assert_abs_diff_eq!(det.level(&block), 0.7 + 0.3 * 0.1, epsilon = 1e-5);
    }

    #[test]
    fn interleaved_and_planar_agree() {
        let det = PeakRmsDetector::default();
        let left: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin() * 0.4).collect();
        let right: Vec<f32> = (0..256).map(|i| (i as f32 * 0.05).cos() * 0.2).collect();
        let interleaved: Vec<f32> = left
            .iter()
            .zip(&right)
            .flat_map(|(l, r)| [*l, *r])
            .collect();

        let planar = AudioBlock::planar_f32(48_000, vec![left, right]);
        let inter = AudioBlock::interleaved_f32(48_000, 2, interleaved);
        assert_abs_diff_eq!(det.level(&planar), det.level(&inter), epsilon = 1e-6);
    }

    #[test]
    fn i16_full_scale_clamps_to_one() {
        let det = PeakRmsDetector::default();
        let block = AudioBlock::interleaved_i16(16_000, 1, vec![i16::MIN; 160]);
        assert_abs_diff_eq!(det.level(&block), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn rms_averages_channel_power() {
        // Channel power 0.25 and 0.0 → mean 0.125 → rms ≈ 0.3536; peak 0.5
        let det = PeakRmsDetector::new(0.0, 1.0);
        let block = AudioBlock::planar_f32(48_000, vec![vec![0.5; 32], vec![0.0; 32]]);
        assert_abs_diff_eq!(det.level(&block), 0.125f32.sqrt(), epsilon = 1e-6);
    }
}
