//! Slider noise reduction.
//!
//! Analog sliders jitter; this decides which reported changes are worth
//! turning into events.

/// How aggressively to suppress small slider movements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoiseReductionLevel {
    /// Trust the hardware, emit small changes.
    Low,
    #[default]
    Default,
    /// Noisy wiring, require a larger move.
    High,
}

impl NoiseReductionLevel {
    /// Parse the configured level. Unknown values fall back to the default.
    pub fn from_config(value: &str) -> Self {
        match value {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Default,
        }
    }

    fn threshold(self) -> f32 {
        match self {
            Self::Low => 0.015,
            Self::Default => 0.025,
            Self::High => 0.035,
        }
    }
}

/// Whether `next` differs enough from `prev` to be worth emitting.
///
/// The stored sentinel (-1.0) always reads as significant, so the first
/// observation of an index is never suppressed. Arriving exactly at either
/// end of the range also always counts, so a slider pushed to its stop
/// settles at a clean 0% or 100% instead of sticking just short of it.
pub fn significantly_different(prev: f32, next: f32, level: NoiseReductionLevel) -> bool {
    if (prev - next).abs() >= level.threshold() {
        return true;
    }

    (next == 1.0 && prev != 1.0) || (next == 0.0 && prev != 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_always_significant() {
        for level in [
            NoiseReductionLevel::Low,
            NoiseReductionLevel::Default,
            NoiseReductionLevel::High,
        ] {
            assert!(significantly_different(-1.0, 0.0, level));
            assert!(significantly_different(-1.0, 1.0, level));
            assert!(significantly_different(-1.0, 0.37, level));
        }
    }

    #[test]
    fn small_changes_are_suppressed() {
        assert!(!significantly_different(
            0.50,
            0.51,
            NoiseReductionLevel::Default
        ));
        assert!(!significantly_different(
            0.50,
            0.52,
            NoiseReductionLevel::High
        ));
    }

    #[test]
    fn changes_at_the_threshold_emit() {
        assert!(significantly_different(
            0.50,
            0.53,
            NoiseReductionLevel::Default
        ));
        assert!(significantly_different(
            0.50,
            0.52,
            NoiseReductionLevel::Low
        ));
    }

    #[test]
    fn levels_order_their_thresholds() {
        // 0.02 apart: significant only on the fine-grained tier.
        assert!(significantly_different(0.10, 0.12, NoiseReductionLevel::Low));
        assert!(!significantly_different(
            0.10,
            0.12,
            NoiseReductionLevel::Default
        ));
        assert!(!significantly_different(
            0.10,
            0.12,
            NoiseReductionLevel::High
        ));
    }

    #[test]
    fn range_edges_always_emit() {
        assert!(significantly_different(
            0.99,
            1.0,
            NoiseReductionLevel::High
        ));
        assert!(significantly_different(
            0.01,
            0.0,
            NoiseReductionLevel::High
        ));
        assert!(!significantly_different(
            1.0,
            1.0,
            NoiseReductionLevel::High
        ));
    }

    #[test]
    fn unknown_config_value_falls_back() {
        assert_eq!(
            NoiseReductionLevel::from_config("aggressive"),
            NoiseReductionLevel::Default
        );
        assert_eq!(
            NoiseReductionLevel::from_config("low"),
            NoiseReductionLevel::Low
        );
        assert_eq!(
            NoiseReductionLevel::from_config("high"),
            NoiseReductionLevel::High
        );
    }
}
