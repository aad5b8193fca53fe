// THEORY:
// The anomaly layer runs three independent geometric checks over one frame's
// detections. None of them depend on each other's output, so they are simply
// run in sequence and their results concatenated.
//
// 1.  **Fallen person** is a per-box shape test: a box much wider than tall.
// 2.  **Stampede** is a temporal test against the detection history. It compares
//     the current set with the set two frames back (not the immediately previous
//     one) and measures the mean nearest-neighbour displacement.
// 3.  **High-density cluster** is a spatial test over all pairs of centers.
//
// Every anomaly location is clamped into the frame.

use crate::config::AnomalyConfig;
use crate::core_modules::detection::{BBox, Detection};
use crate::core_modules::history::DetectionHistory;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    FallenPerson,
    Stampede,
    HighDensityCluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub location: [f32; 2],
    pub confidence: f32,
    pub message: String,
    /// Only set for fallen-person anomalies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    /// Runs every check. `history` must not yet contain `current`.
    pub fn detect(
        &self,
        current: &[Detection],
        history: &DetectionHistory,
        frame_width: u32,
        frame_height: u32,
    ) -> Vec<Anomaly> {
        let bounds = Bounds::new(frame_width, frame_height);
        let mut anomalies = self.fallen_persons(current, &bounds);
        anomalies.extend(self.stampede(current, history, &bounds));
        anomalies.extend(self.density_cluster(current, &bounds));
        anomalies
    }

    fn fallen_persons(&self, current: &[Detection], bounds: &Bounds) -> Vec<Anomaly> {
        current
            .iter()
            .filter(|d| d.bbox.aspect_ratio() < self.config.fallen_aspect_ratio)
            .map(|d| Anomaly {
                kind: AnomalyKind::FallenPerson,
                severity: Severity::High,
                location: bounds.clamp(d.center),
                confidence: d.confidence,
                message: "Possible fallen person detected".to_string(),
                bbox: Some(d.bbox),
            })
            .collect()
    }

    fn stampede(&self, current: &[Detection], history: &DetectionHistory, bounds: &Bounds) -> Option<Anomaly> {
        if history.len() < self.config.stampede_min_history {
            return None;
        }
        let prior = history.back(1)?;
        let min = self.config.stampede_min_detections;
        if current.len() <= min || prior.len() <= min {
            return None;
        }

        let total: f32 = current
            .iter()
            .map(|d| {
                prior
                    .iter()
                    .map(|p| distance(d.center, p.center))
                    .fold(f32::INFINITY, f32::min)
            })
            .sum();
        let avg_movement = total / current.len() as f32;
        if avg_movement <= self.config.stampede_movement_px {
            return None;
        }

        Some(Anomaly {
            kind: AnomalyKind::Stampede,
            severity: Severity::Critical,
            location: bounds.clamp([(bounds.width / 2) as f32, (bounds.height / 2) as f32]),
            confidence: 0.8,
            message: format!("Possible stampede detected - avg movement: {avg_movement:.1}px"),
            bbox: None,
        })
    }

    fn density_cluster(&self, current: &[Detection], bounds: &Bounds) -> Option<Anomaly> {
        let n = current.len();
        if n <= self.config.cluster_min_detections {
            return None;
        }

        let mut sum = 0.0f64;
        let mut pairs = 0u64;
        for (i, a) in current.iter().enumerate() {
            for b in &current[i + 1..] {
                sum += distance(a.center, b.center) as f64;
                pairs += 1;
            }
        }
        let mean = (sum / pairs as f64) as f32;
        if mean >= self.config.cluster_distance_px {
            return None;
        }

        let (sx, sy) = current
            .iter()
            .fold((0.0f32, 0.0f32), |(x, y), d| (x + d.center[0], y + d.center[1]));
        Some(Anomaly {
            kind: AnomalyKind::HighDensityCluster,
            severity: Severity::Medium,
            location: bounds.clamp([sx / n as f32, sy / n as f32]),
            confidence: 0.7,
            message: format!("High density cluster detected - {n} people in close proximity"),
            bbox: None,
        })
    }
}

struct Bounds {
    width: u32,
    height: u32,
}

impl Bounds {
    fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn clamp(&self, [x, y]: [f32; 2]) -> [f32; 2] {
        let max_x = self.width.saturating_sub(1) as f32;
        let max_y = self.height.saturating_sub(1) as f32;
        [x.clamp(0.0, max_x), y.clamp(0.0, max_y)]
    }
}

fn distance(a: [f32; 2], b: [f32; 2]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::person;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyConfig::default())
    }

    fn row(n: usize, x0: f32, spacing: f32, y: f32) -> Vec<Detection> {
        (0..n)
            .map(|i| {
                let x = x0 + i as f32 * spacing;
                person(x, y, x + 10.0, y + 30.0, 0.9)
            })
            .collect()
    }

    fn history_of(sets: &[Vec<Detection>]) -> DetectionHistory {
        let mut history = DetectionHistory::new(10);
        for set in sets {
            history.push(set.clone());
        }
        history
    }

    #[test]
    fn fallen_person_fires_below_ratio() {
        // 100 wide, 20 tall: ratio 0.2
        let lying = person(10.0, 100.0, 110.0, 120.0, 0.85);
        let found = detector().detect(&[lying], &DetectionHistory::new(10), 640, 480);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, AnomalyKind::FallenPerson);
        assert_eq!(found[0].severity, Severity::High);
        assert_eq!(found[0].confidence, 0.85);
        assert_eq!(found[0].location, [60.0, 110.0]);
        assert_eq!(found[0].bbox, Some(lying.bbox));
    }

    #[test]
    fn fallen_person_boundary_is_exclusive() {
        // exactly 0.3
        let edge = person(0.0, 0.0, 100.0, 30.0, 0.9);
        assert!(detector().detect(&[edge], &DetectionHistory::new(10), 640, 480).is_empty());
        let standing = person(0.0, 0.0, 20.0, 60.0, 0.9);
        assert!(detector().detect(&[standing], &DetectionHistory::new(10), 640, 480).is_empty());
    }

    #[test]
    fn zero_width_box_counts_as_fallen() {
        let sliver = person(50.0, 50.0, 50.0, 90.0, 0.6);
        let found = detector().detect(&[sliver], &DetectionHistory::new(10), 640, 480);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, AnomalyKind::FallenPerson);
    }

    #[test]
    fn fallen_location_is_clamped_into_frame() {
        let off_edge = person(600.0, 470.0, 700.0, 480.0, 0.9);
        let found = detector().detect(&[off_edge], &DetectionHistory::new(10), 640, 480);
        assert_eq!(found[0].location, [639.0, 475.0]);
    }

    #[test]
    fn stampede_compares_against_two_frames_back() {
        let far = row(6, 0.0, 40.0, 0.0);
        let near = row(6, 0.0, 40.0, 300.0);
        // history: [near, far, near]; back(1) is `far`, current `near` is 300px away
        let history = history_of(&[near.clone(), far, near.clone()]);
        let found = detector().detect(&near, &history, 640, 480);
        let stampede: Vec<_> = found.iter().filter(|a| a.kind == AnomalyKind::Stampede).collect();
        assert_eq!(stampede.len(), 1);
        assert_eq!(stampede[0].severity, Severity::Critical);
        assert_eq!(stampede[0].location, [320.0, 240.0]);
        assert_eq!(stampede[0].message, "Possible stampede detected - avg movement: 300.0px");
    }

    #[test]
    fn stampede_needs_enough_history() {
        let far = row(6, 0.0, 40.0, 0.0);
        let near = row(6, 0.0, 40.0, 300.0);
        let history = history_of(&[far.clone(), far]);
        assert!(detector().detect(&near, &history, 640, 480).is_empty());
    }

    #[test]
    fn stampede_needs_more_than_five_people_in_both_sets() {
        let far = row(5, 0.0, 40.0, 0.0);
        let near = row(6, 0.0, 40.0, 300.0);
        let history = history_of(&[far.clone(), far.clone(), far]);
        assert!(detector().detect(&near, &history, 640, 480).is_empty());

        let far6 = row(6, 0.0, 40.0, 0.0);
        let near5 = row(5, 0.0, 40.0, 300.0);
        let history = history_of(&[far6.clone(), far6.clone(), far6]);
        assert!(detector().detect(&near5, &history, 640, 480).is_empty());
    }

    #[test]
    fn small_movement_is_not_a_stampede() {
        let a = row(6, 0.0, 40.0, 100.0);
        let b = row(6, 0.0, 40.0, 110.0);
        let history = history_of(&[a.clone(), a.clone(), a]);
        assert!(detector().detect(&b, &history, 640, 480).is_empty());
    }

    #[test]
    fn tight_group_of_eleven_is_a_cluster() {
        let group = row(11, 100.0, 3.0, 100.0);
        let found = detector().detect(&group, &DetectionHistory::new(10), 640, 480);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, AnomalyKind::HighDensityCluster);
        assert_eq!(found[0].severity, Severity::Medium);
        assert_eq!(found[0].message, "High density cluster detected - 11 people in close proximity");
        // centroid x: 100 + 5 + 3*5 = 120, y: 115
        assert_eq!(found[0].location, [120.0, 115.0]);
    }

    #[test]
    fn ten_people_never_form_a_cluster() {
        let group = row(10, 100.0, 1.0, 100.0);
        assert!(detector().detect(&group, &DetectionHistory::new(10), 640, 480).is_empty());
    }

    #[test]
    fn spread_out_crowd_is_not_a_cluster() {
        let spread = row(12, 0.0, 50.0, 100.0);
        assert!(detector().detect(&spread, &DetectionHistory::new(10), 640, 480).is_empty());
    }
}
