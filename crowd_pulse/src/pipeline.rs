// THEORY:
// The `pipeline` module is the per-source analysis engine. One `FrameAnalyzer`
// exists per camera and is driven by that camera's worker thread, so it needs no
// locking. It encapsulates the analysis stack behind a single call: give it a
// frame and its detections, get back an immutable `FrameAnalysis`.
//
// Key architectural principles:
// 1.  **Stateless layers, stateful shell**: density tiering, anomaly checks and
//     heatmap generation are pure functions of their input. The analyzer owns the
//     only per-source state: the detection history, the frame counter and the
//     time of the last heatmap.
// 2.  **Capture time is the clock**: heatmap throttling is measured against the
//     frame's capture timestamp, so replayed and live sources behave alike.
// 3.  **Faults degrade, never stop**: a detector error or malformed box turns the
//     frame into an empty one. The fault is handed back for counting and logging.

use crate::config::CrowdConfig;
use crate::core_modules::anomaly::AnomalyDetector;
use crate::core_modules::density::CountTierPolicy;
use crate::core_modules::detection::{self, DetectionFault, Detector, Frame};
use crate::core_modules::heatmap::{HeatmapGenerator, HeatmapMode};
use crate::core_modules::history::DetectionHistory;
use chrono::{DateTime, Utc};
use serde::Serialize;

// Re-export key data structures for the public API.
pub use crate::core_modules::anomaly::{Anomaly, AnomalyKind, Severity};
pub use crate::core_modules::density::DensityTier;
pub use crate::core_modules::detection::Detection;
pub use crate::core_modules::heatmap::{HeatmapData, Hotspot};

/// Source id plus the analyzer's monotonic frame counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FrameId {
    pub source_id: String,
    pub counter: u64,
}

/// The structured result of analyzing one frame.
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub frame_id: FrameId,
    pub timestamp: DateTime<Utc>,
    pub people_count: usize,
    pub detections: Vec<Detection>,
    pub density_tier: DensityTier,
    pub anomalies: Vec<Anomaly>,
    /// Present on the first frame and then at most once per heatmap interval.
    pub heatmap: Option<HeatmapData>,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl FrameAnalysis {
    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            frame: self.frame_id.counter,
            timestamp: self.timestamp,
            people_count: self.people_count,
            density_tier: self.density_tier,
            anomaly_count: self.anomalies.len(),
        }
    }
}

/// Compact record kept in a worker's recent-results queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub frame: u64,
    #[serde(serialize_with = "crate::messages::serialize_utc")]
    pub timestamp: DateTime<Utc>,
    pub people_count: usize,
    pub density_tier: DensityTier,
    pub anomaly_count: usize,
}

/// The main per-source analysis engine.
pub struct FrameAnalyzer {
    source_id: String,
    counter: u64,
    count_policy: CountTierPolicy,
    anomaly: AnomalyDetector,
    heatmap: HeatmapGenerator,
    heatmap_interval: chrono::Duration,
    last_heatmap_at: Option<DateTime<Utc>>,
    history: DetectionHistory,
}

impl FrameAnalyzer {
    pub fn new(source_id: impl Into<String>, config: &CrowdConfig) -> Self {
        let heatmap_interval = chrono::Duration::from_std(config.heatmap.interval())
            .unwrap_or_else(|_| chrono::Duration::seconds(2));
        Self {
            source_id: source_id.into(),
            counter: 0,
            count_policy: config.density.count,
            anomaly: AnomalyDetector::new(config.anomaly.clone()),
            heatmap: HeatmapGenerator::new(config.heatmap.clone(), config.density.occupancy),
            heatmap_interval,
            last_heatmap_at: None,
            history: DetectionHistory::new(config.anomaly.history_depth),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Runs the detector and analyzes the result. A detector fault yields an
    /// analysis with zero detections plus the fault.
    pub fn analyze_with(
        &mut self,
        detector: &dyn Detector,
        frame: &Frame,
        threshold: u32,
        zone_capacity: Option<u32>,
    ) -> (FrameAnalysis, Option<DetectionFault>) {
        let (detections, fault) = detection::detect_frame(detector, frame);
        (self.analyze(frame, detections, threshold, zone_capacity), fault)
    }

    /// Analyzes a frame whose detections are already validated.
    pub fn analyze(
        &mut self,
        frame: &Frame,
        detections: Vec<Detection>,
        threshold: u32,
        zone_capacity: Option<u32>,
    ) -> FrameAnalysis {
        let now = frame.captured_at;
        let (width, height) = (frame.width(), frame.height());
        self.counter += 1;

        // Stage 1: Count-based density tier
        let density_tier = self.count_policy.classify(detections.len(), threshold);

        // Stage 2: Anomalies against the history as it was before this frame
        let anomalies = self.anomaly.detect(&detections, &self.history, width, height);

        // Stage 3: Throttled heatmap
        let heatmap_due = match self.last_heatmap_at {
            None => true,
            Some(last) => now - last > self.heatmap_interval,
        };
        let heatmap = heatmap_due.then(|| {
            self.last_heatmap_at = Some(now);
            let mode = match zone_capacity {
                Some(capacity) if capacity > 0 => HeatmapMode::Zone { capacity },
                _ => HeatmapMode::Frame,
            };
            self.heatmap.generate(&detections, width, height, mode, now)
        });

        // Stage 4: Remember this frame
        self.history.push(detections.clone());

        FrameAnalysis {
            frame_id: FrameId {
                source_id: self.source_id.clone(),
                counter: self.counter,
            },
            timestamp: now,
            people_count: detections.len(),
            detections,
            density_tier,
            anomalies,
            heatmap,
            frame_width: width,
            frame_height: height,
        }
    }
}
