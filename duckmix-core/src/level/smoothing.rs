//! Exponential low-pass filter over per-block level estimates.

/// Smoothed activity for one source (remote agent or microphone).
///
/// `value` is always in [0, 1]: inputs are clamped before blending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityLevel {
    value: f32,
    /// Blend factor in (0, 1]. Higher reacts faster.
    alpha: f32,
}

impl ActivityLevel {
    pub fn new(alpha: f32) -> Self {
        Self {
            value: 0.0,
            alpha: sanitize_alpha(alpha),
        }
    }

    /// Fold one block estimate into the smoothed value and return it.
    pub fn update(&mut self, level: f32) -> f32 {
        let clamped = if level.is_finite() {
            level.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.value = self.value * (1.0 - self.alpha) + clamped * self.alpha;
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Back to silence. Only done on a full engine stop.
    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

fn sanitize_alpha(alpha: f32) -> f32 {
    if alpha.is_finite() {
        alpha.clamp(f32::EPSILON, 1.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn first_update_scales_by_alpha() {
        let mut level = ActivityLevel::new(0.3);
        assert_abs_diff_eq!(level.update(0.05), 0.015, epsilon = 1e-7);
    }

    #[test]
    fn stays_in_unit_range_for_wild_inputs() {
        let mut level = ActivityLevel::new(0.9);
        for input in [5.0, -3.0, f32::INFINITY, f32::NAN, 1e9, 0.5, -1e9, 2.0] {
            let v = level.update(input);
            assert!((0.0..=1.0).contains(&v), "value {v} escaped [0,1]");
        }
    }

    #[test]
    fn converges_toward_input() {
        let mut level = ActivityLevel::new(0.3);
        for _ in 0..100 {
            level.update(0.4);
        }
        assert_abs_diff_eq!(level.value(), 0.4, epsilon = 1e-4);
    }

    #[test]
    fn reset_returns_to_zero() {
        let mut level = ActivityLevel::new(0.5);
        level.update(1.0);
        level.reset();
        assert_eq!(level.value(), 0.0);
    }

    #[test]
    fn invalid_alpha_is_sanitized() {
        assert_eq!(ActivityLevel::new(7.0).alpha(), 1.0);
        assert!(ActivityLevel::new(0.0).alpha() > 0.0);
        assert_eq!(ActivityLevel::new(f32::NAN).alpha(), 1.0);
    }
}
