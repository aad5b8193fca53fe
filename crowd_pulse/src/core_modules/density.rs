// THEORY:
// Two different questions are answered with the same ordinal scale:
// "how crowded is this camera relative to its operator-set threshold?" and
// "how full is this zone relative to its physical capacity?". They use different
// breakpoint tables and are kept as two separately named policies so neither can
// silently replace the other.

use serde::{Deserialize, Serialize};

/// Ordinal crowding classification, `None < Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DensityTier {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl DensityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            DensityTier::None => "NONE",
            DensityTier::Low => "LOW",
            DensityTier::Medium => "MEDIUM",
            DensityTier::High => "HIGH",
            DensityTier::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for DensityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of change between two consecutive occupancy readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    pub fn between(previous: usize, current: usize) -> Self {
        match current.cmp(&previous) {
            std::cmp::Ordering::Greater => Trend::Increasing,
            std::cmp::Ordering::Less => Trend::Decreasing,
            std::cmp::Ordering::Equal => Trend::Stable,
        }
    }
}

/// Per-camera tiering of a raw people count against the camera's threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountTierPolicy {
    /// Counts strictly below `low_fraction * threshold` are LOW.
    pub low_fraction: f64,
    /// Counts strictly below `medium_fraction * threshold` are MEDIUM.
    pub medium_fraction: f64,
}

impl Default for CountTierPolicy {
    fn default() -> Self {
        Self {
            low_fraction: 0.5,
            medium_fraction: 0.8,
        }
    }
}

impl CountTierPolicy {
    pub fn classify(&self, count: usize, threshold: u32) -> DensityTier {
        let count_f = count as f64;
        let threshold_f = threshold as f64;
        if count == 0 {
            DensityTier::None
        } else if count_f < threshold_f * self.low_fraction {
            DensityTier::Low
        } else if count_f < threshold_f * self.medium_fraction {
            DensityTier::Medium
        } else if count_f < threshold_f {
            DensityTier::High
        } else {
            DensityTier::Critical
        }
    }
}

/// Zone-level tiering of an occupancy percentage. Each bound is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyTierPolicy {
    pub critical_percent: f64,
    pub high_percent: f64,
    pub medium_percent: f64,
    pub low_percent: f64,
}

impl Default for OccupancyTierPolicy {
    fn default() -> Self {
        Self {
            critical_percent: 90.0,
            high_percent: 70.0,
            medium_percent: 40.0,
            low_percent: 10.0,
        }
    }
}

impl OccupancyTierPolicy {
    pub fn classify(&self, percentage: f64) -> DensityTier {
        if percentage >= self.critical_percent {
            DensityTier::Critical
        } else if percentage >= self.high_percent {
            DensityTier::High
        } else if percentage >= self.medium_percent {
            DensityTier::Medium
        } else if percentage >= self.low_percent {
            DensityTier::Low
        } else {
            DensityTier::None
        }
    }
}

/// `count * 100 / capacity`. A zero capacity yields 0 rather than infinity.
pub fn occupancy_percentage(count: usize, capacity: u32) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    count as f64 * 100.0 / capacity as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tier_boundaries_at_threshold_twenty() {
        let policy = CountTierPolicy::default();
        assert_eq!(policy.classify(0, 20), DensityTier::None);
        assert_eq!(policy.classify(1, 20), DensityTier::Low);
        assert_eq!(policy.classify(9, 20), DensityTier::Low);
        // 0.5 * 20 = 10 is exclusive for LOW
        assert_eq!(policy.classify(10, 20), DensityTier::Medium);
        assert_eq!(policy.classify(15, 20), DensityTier::Medium);
        // 0.8 * 20 = 16 is exclusive for MEDIUM
        assert_eq!(policy.classify(16, 20), DensityTier::High);
        assert_eq!(policy.classify(19, 20), DensityTier::High);
        assert_eq!(policy.classify(20, 20), DensityTier::Critical);
        assert_eq!(policy.classify(25, 20), DensityTier::Critical);
    }

    #[test]
    fn count_tier_is_monotonic() {
        let policy = CountTierPolicy::default();
        for threshold in [1u32, 3, 7, 10, 20, 33, 100] {
            let mut previous = DensityTier::None;
            for count in 0..(threshold as usize * 2) {
                let tier = policy.classify(count, threshold);
                assert!(tier >= previous, "count {count} threshold {threshold}");
                previous = tier;
            }
        }
    }

    #[test]
    fn count_tier_with_fractional_breakpoints() {
        let policy = CountTierPolicy::default();
        // threshold 5: LOW below 2.5, MEDIUM below 4.0, HIGH below 5
        assert_eq!(policy.classify(2, 5), DensityTier::Low);
        assert_eq!(policy.classify(3, 5), DensityTier::Medium);
        assert_eq!(policy.classify(4, 5), DensityTier::High);
        assert_eq!(policy.classify(5, 5), DensityTier::Critical);
    }

    #[test]
    fn occupancy_tier_breakpoints_are_inclusive() {
        let policy = OccupancyTierPolicy::default();
        assert_eq!(policy.classify(0.0), DensityTier::None);
        assert_eq!(policy.classify(9.99), DensityTier::None);
        assert_eq!(policy.classify(10.0), DensityTier::Low);
        assert_eq!(policy.classify(40.0), DensityTier::Medium);
        assert_eq!(policy.classify(69.9), DensityTier::Medium);
        assert_eq!(policy.classify(70.0), DensityTier::High);
        assert_eq!(policy.classify(90.0), DensityTier::Critical);
        assert_eq!(policy.classify(150.0), DensityTier::Critical);
    }

    #[test]
    fn policies_disagree_on_the_same_numbers() {
        // 15 people against threshold 20 is MEDIUM by count, but 15% of a
        // 100-capacity zone is only LOW by occupancy.
        let by_count = CountTierPolicy::default().classify(15, 20);
        let by_occupancy = OccupancyTierPolicy::default().classify(occupancy_percentage(15, 100));
        assert_eq!(by_count, DensityTier::Medium);
        assert_eq!(by_occupancy, DensityTier::Low);
    }

    #[test]
    fn trend_compares_previous_reading() {
        assert_eq!(Trend::between(3, 5), Trend::Increasing);
        assert_eq!(Trend::between(5, 3), Trend::Decreasing);
        assert_eq!(Trend::between(4, 4), Trend::Stable);
    }

    #[test]
    fn tier_serializes_screaming_case() {
        let json = serde_json::to_string(&DensityTier::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
    }
}
