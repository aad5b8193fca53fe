// THEORY:
// All tunables of the pipeline live in one serde tree. Every section and every
// field carries a default, so an empty JSON object is a complete configuration
// and a partial file only overrides what it names.
//
// Key architectural principles:
// 1.  **Load, then validate**: `CrowdConfig::load` parses and immediately runs
//     `validate`; nothing downstream re-checks ranges.
// 2.  **Per-camera and per-zone records are separate**: `CameraConfig` and
//     `ZoneConfig` are validated at the point they are handed to the monitor,
//     because they are added and changed at runtime.

use crate::core_modules::density::{CountTierPolicy, OccupancyTierPolicy};
use crate::dedup::AlertKind;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    pub count: CountTierPolicy,
    pub occupancy: OccupancyTierPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Height/width ratio below which a box is treated as a fallen person.
    pub fallen_aspect_ratio: f32,
    /// Mean nearest-neighbour displacement (px) that signals a stampede.
    pub stampede_movement_px: f32,
    /// Both compared sets must hold strictly more detections than this.
    pub stampede_min_detections: usize,
    /// History entries required before stampede is evaluated.
    pub stampede_min_history: usize,
    /// Clustering runs only above this many detections.
    pub cluster_min_detections: usize,
    /// Mean pairwise distance (px) under which the crowd is a cluster.
    pub cluster_distance_px: f32,
    /// Depth of the per-source detection history ring.
    pub history_depth: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            fallen_aspect_ratio: 0.3,
            stampede_movement_px: 50.0,
            stampede_min_detections: 5,
            stampede_min_history: 3,
            cluster_min_detections: 10,
            cluster_distance_px: 50.0,
            history_depth: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    pub interval_secs: f64,
    pub cell_size: u32,
    pub frame_sigma: f32,
    pub frame_hotspot_threshold: f32,
    pub zone_resolution: usize,
    pub zone_sigma: f32,
    pub zone_hotspot_threshold: f32,
    pub min_hotspot_radius: f32,
    pub max_hotspot_radius: f32,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2.0,
            cell_size: 4,
            frame_sigma: 2.0,
            frame_hotspot_threshold: 0.5,
            zone_resolution: 50,
            zone_sigma: 1.5,
            zone_hotspot_threshold: 0.6,
            min_hotspot_radius: 10.0,
            max_hotspot_radius: 50.0,
        }
    }
}

impl HeatmapConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub frame_skip: u32,
    pub max_result_queue: usize,
    pub capture_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub stop_timeout_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            max_result_queue: 30,
            capture_timeout_ms: 1000,
            reconnect_delay_ms: 1000,
            stop_timeout_ms: 2000,
            jpeg_quality: 70,
        }
    }
}

impl ProcessingConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Debounce windows per alert kind, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub live_count_secs: f64,
    pub threshold_breach_secs: f64,
    pub anomaly_secs: f64,
    pub heatmap_secs: f64,
    pub zone_update_secs: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            live_count_secs: 2.0,
            threshold_breach_secs: 10.0,
            anomaly_secs: 15.0,
            heatmap_secs: 5.0,
            zone_update_secs: 2.0,
        }
    }
}

impl DebounceConfig {
    pub fn for_kind(&self, kind: AlertKind) -> Duration {
        let secs = match kind {
            AlertKind::LiveCountUpdate => self.live_count_secs,
            AlertKind::ThresholdBreach => self.threshold_breach_secs,
            AlertKind::AnomalyAlert => self.anomaly_secs,
            AlertKind::HeatmapAlert => self.heatmap_secs,
            AlertKind::ZoneUpdate => self.zone_update_secs,
        };
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub send_timeout_ms: u64,
    pub ping_interval_secs: u64,
    /// Capacity of each subscriber's outbound queue.
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 250,
            ping_interval_secs: 30,
            subscriber_buffer: 64,
        }
    }
}

impl HubConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Root configuration of the analytics pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrowdConfig {
    pub density: DensityConfig,
    pub anomaly: AnomalyConfig,
    pub heatmap: HeatmapConfig,
    pub processing: ProcessingConfig,
    pub debounce: DebounceConfig,
    pub hub: HubConfig,
    /// Threshold given to cameras started without one.
    pub default_people_threshold: u32,
    /// Zones created when the monitor starts.
    pub zones: Vec<ZoneConfig>,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            density: DensityConfig::default(),
            anomaly: AnomalyConfig::default(),
            heatmap: HeatmapConfig::default(),
            processing: ProcessingConfig::default(),
            debounce: DebounceConfig::default(),
            hub: HubConfig::default(),
            default_people_threshold: 20,
            zones: Vec::new(),
        }
    }
}

impl CrowdConfig {
    /// Reads a JSON config file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CrowdConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let count = &self.density.count;
        if !(count.low_fraction > 0.0 && count.low_fraction < count.medium_fraction) {
            return Err(ConfigError::invalid(
                "density.count.low_fraction",
                "must be positive and below medium_fraction",
            ));
        }
        if count.medium_fraction > 1.0 {
            return Err(ConfigError::invalid(
                "density.count.medium_fraction",
                "must not exceed 1.0",
            ));
        }
        let occ = &self.density.occupancy;
        if !(occ.low_percent <= occ.medium_percent
            && occ.medium_percent <= occ.high_percent
            && occ.high_percent <= occ.critical_percent)
        {
            return Err(ConfigError::invalid(
                "density.occupancy",
                "breakpoints must be non-decreasing from low to critical",
            ));
        }
        if self.anomaly.history_depth < self.anomaly.stampede_min_history {
            return Err(ConfigError::invalid(
                "anomaly.history_depth",
                "must be at least stampede_min_history",
            ));
        }
        if self.heatmap.cell_size == 0 {
            return Err(ConfigError::invalid("heatmap.cell_size", "must be positive"));
        }
        if self.heatmap.zone_resolution == 0 {
            return Err(ConfigError::invalid("heatmap.zone_resolution", "must be positive"));
        }
        if !(self.heatmap.frame_sigma > 0.0 && self.heatmap.zone_sigma > 0.0) {
            return Err(ConfigError::invalid("heatmap.sigma", "must be positive"));
        }
        if self.heatmap.min_hotspot_radius > self.heatmap.max_hotspot_radius {
            return Err(ConfigError::invalid(
                "heatmap.min_hotspot_radius",
                "must not exceed max_hotspot_radius",
            ));
        }
        if !self.heatmap.interval_secs.is_finite() || self.heatmap.interval_secs < 0.0 {
            return Err(ConfigError::invalid("heatmap.interval_secs", "must be a non-negative number"));
        }
        if self.processing.frame_skip == 0 {
            return Err(ConfigError::invalid("processing.frame_skip", "must be at least 1"));
        }
        if self.processing.max_result_queue == 0 {
            return Err(ConfigError::invalid("processing.max_result_queue", "must be positive"));
        }
        if !(1..=100).contains(&self.processing.jpeg_quality) {
            return Err(ConfigError::invalid("processing.jpeg_quality", "must be within 1..=100"));
        }
        let debounce = &self.debounce;
        for secs in [
            debounce.live_count_secs,
            debounce.threshold_breach_secs,
            debounce.anomaly_secs,
            debounce.heatmap_secs,
            debounce.zone_update_secs,
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::invalid("debounce", "intervals must be non-negative"));
            }
        }
        if self.hub.subscriber_buffer == 0 {
            return Err(ConfigError::invalid("hub.subscriber_buffer", "must be positive"));
        }
        if self.hub.ping_interval_secs == 0 {
            return Err(ConfigError::invalid("hub.ping_interval_secs", "must be positive"));
        }
        if self.default_people_threshold == 0 {
            return Err(ConfigError::invalid("default_people_threshold", "must be positive"));
        }
        let mut seen = std::collections::HashSet::new();
        for zone in &self.zones {
            zone.validate()?;
            if !seen.insert(zone.id.as_str()) {
                return Err(ConfigError::DuplicateZone(zone.id.clone()));
            }
        }
        Ok(())
    }
}

/// Per-camera settings supplied when monitoring starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    /// URI or path the frame source was opened from.
    pub source: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    pub threshold: u32,
    pub frame_skip: u32,
}

impl CameraConfig {
    /// A camera using the global default threshold and frame skip.
    pub fn new(camera_id: impl Into<String>, source: impl Into<String>, config: &CrowdConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            source: source.into(),
            zone_id: None,
            threshold: config.default_people_threshold,
            frame_skip: config.processing.frame_skip,
        }
    }

    pub fn with_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_frame_skip(mut self, frame_skip: u32) -> Self {
        self.frame_skip = frame_skip;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera_id.trim().is_empty() {
            return Err(ConfigError::invalid("camera_id", "must not be empty"));
        }
        if self.threshold == 0 {
            return Err(ConfigError::invalid("threshold", "must be positive"));
        }
        if self.frame_skip == 0 {
            return Err(ConfigError::invalid("frame_skip", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    #[default]
    Active,
    Inactive,
}

/// Static description of a physical zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    pub name: String,
    pub capacity: u32,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub status: ZoneStatus,
}

impl ZoneConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capacity,
            coordinates: None,
            status: ZoneStatus::Active,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::invalid("zone.id", "must not be empty"));
        }
        if self.capacity == 0 {
            return Err(ConfigError::NonPositiveCapacity {
                zone_id: self.id.clone(),
            });
        }
        Ok(())
    }
}
