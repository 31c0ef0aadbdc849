//! Proportional gain law with hard safety bounds.
//!
//! `error = target_level - measured_level`, `gain += kp * error`, then clamp
//! to `[gain_min, gain_max]`. Proportional only; there is no integral term.

use tracing::warn;

use crate::config::Config;
use crate::level::LevelMeasurement;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainController {
    target_level: f32,
    kp: f32,
    gain_min: f32,
    gain_max: f32,
}

impl GainController {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_level: config.target_level,
            kp: config.kp,
            gain_min: config.gain_min,
            gain_max: config.gain_max,
        }
    }

    /// Next gain for a measured ambient level. Always within `[gain_min, gain_max]`.
    ///
    /// A non-finite measurement holds the current gain instead of
    /// propagating NaN/Inf into the gain state.
    pub fn next_gain(&self, measured_level: f32, current_gain: f32) -> f32 {
        if !measured_level.is_finite() {
            return self.hold(current_gain);
        }
        let error = self.target_level - measured_level;
        let candidate = current_gain + self.kp * error;
        if candidate.is_nan() {
            return self.hold(current_gain);
        }
        self.clamp(candidate)
    }

    pub fn clamp(&self, gain: f32) -> f32 {
        gain.clamp(self.gain_min, self.gain_max)
    }

    fn hold(&self, current_gain: f32) -> f32 {
        if current_gain.is_finite() {
            self.clamp(current_gain)
        } else {
            self.gain_min
        }
    }
}

/// Free-function form of [`GainController::next_gain`] for callers that only
/// hold a `Config`.
pub fn next_gain(measured_level: f32, current_gain: f32, config: &Config) -> f32 {
    GainController::from_config(config).next_gain(measured_level, current_gain)
}

/// Result of one gain update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainUpdate {
    pub gain: f32,
    /// The measurement was rejected and the previous gain was kept
    pub held: bool,
}

/// The persistent masking gain. Owned by the control loop; only
/// [`GainState::update`] writes it.
#[derive(Debug, Clone)]
pub struct GainState {
    gain: f32,
    controller: GainController,
}

impl GainState {
    pub fn new(config: &Config) -> Self {
        let controller = GainController::from_config(config);
        Self {
            gain: controller.clamp(config.initial_gain),
            controller,
        }
    }

    pub fn value(&self) -> f32 {
        self.gain
    }

    pub fn update(&mut self, level: LevelMeasurement) -> GainUpdate {
        let held = !level.value().is_finite();
        if held {
            warn!(level = ?level.value(), gain = self.gain, "non-finite level, holding gain");
        }
        self.gain = self.controller.next_gain(level.value(), self.gain);
        GainUpdate { gain: self.gain, held }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config {
            target_level: 300.0,
            kp: 0.0006,
            gain_min: 0.05,
            gain_max: 0.8,
            initial_gain: 0.3,
            ..Config::default()
        }
    }

    #[test]
    fn test_on_target_keeps_gain() {
        let g = next_gain(300.0, 0.3, &cfg());
        assert!((g - 0.3).abs() < 1e-6, "error=0 should leave gain unchanged: {}", g);
    }

    #[test]
    fn test_silence_raises_gain() {
        let g = next_gain(0.0, 0.3, &cfg());
        assert!((g - 0.48).abs() < 1e-5, "0.3 + 0.0006*300 = 0.48, got {}", g);
    }

    #[test]
    fn test_loud_ambient_clamps_to_min() {
        assert_eq!(next_gain(100_000.0, 0.3, &cfg()), 0.05);
    }

    #[test]
    fn test_boundedness() {
        let cfg = cfg();
        let levels = [0.0, 1.0, 150.0, 300.0, 450.0, 1e4, 1e9, f32::MAX, -5.0, -1e30];
        let gains = [0.05, 0.1, 0.3, 0.5, 0.79, 0.8];
        for &level in &levels {
            for &gain in &gains {
                let g = next_gain(level, gain, &cfg);
                assert!(
                    (cfg.gain_min..=cfg.gain_max).contains(&g),
                    "next_gain({}, {}) = {} escaped bounds",
                    level,
                    gain,
                    g
                );
            }
        }
    }

    #[test]
    fn test_monotonic_response() {
        let cfg = cfg();
        let mut prev = f32::INFINITY;
        for level in [250.0, 280.0, 300.0, 320.0, 350.0] {
            let g = next_gain(level, 0.4, &cfg);
            assert!(
                g <= prev,
                "louder ambient must not raise gain: {} at level {} after {}",
                g,
                level,
                prev
            );
            prev = g;
        }
    }

    #[test]
    fn test_clamp_is_exact() {
        let cfg = cfg();
        assert_eq!(next_gain(300.0, 5.0, &cfg), cfg.gain_max);
        assert_eq!(next_gain(300.0, 0.8001, &cfg), cfg.gain_max);
        assert_eq!(next_gain(300.0, -3.0, &cfg), cfg.gain_min);
        assert_eq!(next_gain(0.0, 0.8, &cfg), cfg.gain_max);
    }

    #[test]
    fn test_non_finite_level_holds_gain() {
        let cfg = cfg();
        assert_eq!(next_gain(f32::NAN, 0.37, &cfg), 0.37);
        assert_eq!(next_gain(f32::INFINITY, 0.37, &cfg), 0.37);
        assert_eq!(next_gain(f32::NEG_INFINITY, 0.37, &cfg), 0.37);
    }

    #[test]
    fn test_zero_kp_with_overflowing_error_holds_gain() {
        let cfg = Config { kp: 0.0, target_level: f32::MAX, ..cfg() };
        assert_eq!(next_gain(-f32::MAX, 0.4, &cfg), 0.4);
    }

    #[test]
    fn test_gain_state_update() {
        let mut state = GainState::new(&cfg());
        assert_eq!(state.value(), 0.3);

        let update = state.update(LevelMeasurement(0.0));
        assert!(!update.held);
        assert!((state.value() - 0.48).abs() < 1e-5);

        let update = state.update(LevelMeasurement(f32::NAN));
        assert!(update.held, "NaN level should be flagged as held");
        assert!((state.value() - 0.48).abs() < 1e-5, "gain must not be corrupted");
    }
}
