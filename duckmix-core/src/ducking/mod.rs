//! Background music ducking.
//!
//! ## Target selection (highest priority first)
//!
//! 1. Agent flagged speaking, or remote level active → `ai_speaking_volume`
//! 2. Microphone level active → `mic_speaking_volume`
//! 3. Otherwise → `idle_volume`
//!
//! A level is *active* when it crosses either its linear threshold or its
//! dB threshold (`20 * log10(max(level, 1e-7))`).
//!
//! ## Step function
//!
//! Called once per tick. Moves `current_volume` a fraction of the way toward
//! `target_volume`: a large fraction when ducking down, a small one when
//! recovering, and snaps once within `snap_epsilon`.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Floor used before taking log10 of a level.
const DB_FLOOR: f32 = 1e-7;

/// Minimum change before the target is rewritten.
const TARGET_HYSTERESIS: f32 = 0.001;

/// Tunable ducking parameters. All volumes are linear gains in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DuckingConfig {
    /// Music gain when nobody is talking.
    pub idle_volume: f32,
    /// Music gain while the remote agent is speaking.
    pub ai_speaking_volume: f32,
    /// Music gain while only the local user is speaking.
    pub mic_speaking_volume: f32,
    /// Linear activation threshold for the smoothed remote level.
    pub ai_rms_threshold: f32,
    /// Linear activation threshold for the smoothed mic level.
    pub mic_rms_threshold: f32,
    /// dB activation threshold for the smoothed remote level.
    pub ai_db_threshold: f32,
    /// dB activation threshold for the smoothed mic level.
    pub mic_db_threshold: f32,
    /// Fraction of the remaining distance covered per tick when ducking down.
    pub duck_rate: f32,
    /// Fraction of the remaining distance covered per tick when recovering.
    pub recover_rate: f32,
    /// Distance below which `current` snaps to `target`.
    pub snap_epsilon: f32,
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            idle_volume: 0.35,
            ai_speaking_volume: 0.10,
            mic_speaking_volume: 0.15,
            ai_rms_threshold: 0.001,
            mic_rms_threshold: 0.0015,
            ai_db_threshold: -60.0,
            mic_db_threshold: -50.0,
            duck_rate: 0.5,
            recover_rate: 0.15,
            snap_epsilon: 0.001,
        }
    }
}

impl DuckingConfig {
    /// Clamp every parameter into a usable range.
    pub fn normalize(&mut self) {
        self.idle_volume = clamp_unit(self.idle_volume, 0.35);
        self.ai_speaking_volume = clamp_unit(self.ai_speaking_volume, 0.10);
        self.mic_speaking_volume = clamp_unit(self.mic_speaking_volume, 0.15);
        self.ai_rms_threshold = clamp_unit(self.ai_rms_threshold, 0.001);
        self.mic_rms_threshold = clamp_unit(self.mic_rms_threshold, 0.0015);
        self.ai_db_threshold = clamp_db(self.ai_db_threshold, -60.0);
        self.mic_db_threshold = clamp_db(self.mic_db_threshold, -50.0);
        self.duck_rate = clamp_rate(self.duck_rate, 0.5);
        self.recover_rate = clamp_rate(self.recover_rate, 0.15);
        self.snap_epsilon = if self.snap_epsilon.is_finite() {
            self.snap_epsilon.clamp(1e-6, 0.1)
        } else {
            0.001
        };
    }

    /// Lowest and highest gain the controller can ever produce.
    pub fn volume_bounds(&self) -> (f32, f32) {
        let vols = [
            self.idle_volume,
            self.ai_speaking_volume,
            self.mic_speaking_volume,
        ];
        let lo = vols.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = vols.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (lo, hi)
    }
}

fn clamp_unit(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

fn clamp_rate(v: f32, fallback: f32) -> f32 {
    if v.is_finite() && v > 0.0 {
        v.min(1.0)
    } else {
        fallback
    }
}

fn clamp_db(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v.clamp(-140.0, 0.0)
    } else {
        fallback
    }
}

/// Convert a linear level to decibels with a floor.
pub fn level_to_db(level: f32) -> f32 {
    20.0 * level.max(DB_FLOOR).log10()
}

/// Which source currently determines the music volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuckReason {
    Idle,
    Agent,
    Microphone,
}

/// Mutable ducking state. Written only by `DuckingController`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckingState {
    pub target_volume: f32,
    pub current_volume: f32,
    pub agent_speaking: bool,
}

#[derive(Debug, Clone)]
pub struct DuckingController {
    config: DuckingConfig,
    state: DuckingState,
    reason: DuckReason,
}

impl DuckingController {
    pub fn new(mut config: DuckingConfig) -> Self {
        config.normalize();
        Self {
            state: DuckingState {
                target_volume: config.idle_volume,
                current_volume: config.idle_volume,
                agent_speaking: false,
            },
            reason: DuckReason::Idle,
            config,
        }
    }

    pub fn config(&self) -> &DuckingConfig {
        &self.config
    }

    pub fn state(&self) -> DuckingState {
        self.state
    }

    pub fn reason(&self) -> DuckReason {
        self.reason
    }

    pub fn set_agent_speaking(&mut self, speaking: bool) {
        self.state.agent_speaking = speaking;
    }

    /// Re-evaluate the target from the smoothed levels.
    ///
    /// Returns `true` if the target volume changed.
    pub fn update_target(&mut self, remote_level: f32, mic_level: f32) -> bool {
        let ai_db = level_to_db(remote_level);
        let mic_db = level_to_db(mic_level);

        let ai_active = self.state.agent_speaking
            || remote_level > self.config.ai_rms_threshold
            || ai_db > self.config.ai_db_threshold;
        let mic_active =
            mic_level > self.config.mic_rms_threshold || mic_db > self.config.mic_db_threshold;

        let (desired, reason) = if ai_active {
            (self.config.ai_speaking_volume, DuckReason::Agent)
        } else if mic_active {
            (self.config.mic_speaking_volume, DuckReason::Microphone)
        } else {
            (self.config.idle_volume, DuckReason::Idle)
        };
        self.reason = reason;

        if (desired - self.state.target_volume).abs() > TARGET_HYSTERESIS {
            debug!(
                remote_level,
                ai_db,
                mic_level,
                mic_db,
                ?reason,
                from = self.state.target_volume,
                to = desired,
                "ducking target changed"
            );
            self.state.target_volume = desired;
            return true;
        }
        false
    }

    /// One envelope step. Returns the new current volume.
    pub fn step(&mut self) -> f32 {
        let diff = self.state.target_volume - self.state.current_volume;
        if diff.abs() < self.config.snap_epsilon {
            self.state.current_volume = self.state.target_volume;
        } else {
            let rate = if diff < 0.0 {
                self.config.duck_rate
            } else {
                self.config.recover_rate
            };
            self.state.current_volume += diff * rate;
        }
        let (lo, hi) = self.config.volume_bounds();
        self.state.current_volume = self.state.current_volume.clamp(lo, hi);
        self.state.current_volume
    }

    /// Back to idle volume. The agent-speaking flag is an external input
    /// and survives; the next `update_target` applies it again.
    pub fn reset(&mut self) {
        self.state.target_volume = self.config.idle_volume;
        self.state.current_volume = self.config.idle_volume;
        self.reason = DuckReason::Idle;
    }
}

impl Default for DuckingController {
    fn default() -> Self {
        Self::new(DuckingConfig::default())
    }
}
