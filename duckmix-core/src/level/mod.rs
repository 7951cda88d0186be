//! Perceptual activity estimation for incoming audio.
//!
//! `LevelDetector` is the extensibility point: the default `PeakRmsDetector`
//! blends peak and RMS, and any other loudness model can be dropped in
//! without touching the engine. The smoothing filter that turns per-block
//! estimates into an `ActivityLevel` lives in [`smoothing`].

pub mod peak_rms;
pub mod smoothing;

pub use peak_rms::PeakRmsDetector;
pub use smoothing::ActivityLevel;

use crate::buffering::AudioBlock;

/// Trait for all block level estimators.
pub trait LevelDetector: Send + 'static {
    /// Activity estimate for `block` in [0, 1].
    ///
    /// Must never panic: empty or malformed blocks report 0.
    fn level(&self, block: &AudioBlock) -> f32;
}
