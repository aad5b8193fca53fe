// THEORY:
// The `Monitor` is the single owner of every piece of mutable system state: the
// configuration, the detector, the broadcast hub, the zone registry, the
// deduplicator and one `SourceWorker` per camera. Nothing is global; callers
// (the server, the replay tester, tests) hold a `Monitor` and go through it.
//
// Key architectural principles:
// 1.  **Validate at the door**: every configuration change is checked before it
//     touches state and is rejected with a `ConfigError` otherwise.
// 2.  **No lock across a join**: stopping a camera removes its worker from the map
//     first and only then waits for the thread, so other cameras stay reachable.
// 3.  **Cascading cleanup**: removing a camera or a zone also forgets its
//     deduplication records.

use crate::config::{CameraConfig, CrowdConfig, ZoneConfig, ZoneStatus};
use crate::core_modules::anomaly::Severity;
use crate::core_modules::detection::Detector;
use crate::dedup::AlertDeduplicator;
use crate::dispatch::{AlertDispatcher, BroadcastReceipt, EmergencyRequest, InstructionsRequest, RuntimeDispatch};
use crate::error::{ConfigError, MonitorError};
use crate::hub::{BroadcastHub, ConnectionCounts, HubStats};
use crate::messages::{EmergencyType, serialize_utc};
use crate::worker::{FrameSource, SourceWorker, WorkerContext, WorkerStatus};
use crate::zones::{RerouteSuggestion, ZoneRegistry, ZoneSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub cameras: Vec<WorkerStatus>,
    pub connections: ConnectionCounts,
    pub hub: HubStats,
    pub zones: usize,
    pub dedup_records: usize,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

pub struct Monitor {
    config: Arc<CrowdConfig>,
    detector: Arc<dyn Detector>,
    hub: Arc<BroadcastHub>,
    zones: Arc<ZoneRegistry>,
    dedup: Arc<AlertDeduplicator>,
    dispatcher: Arc<AlertDispatcher>,
    runtime: Handle,
    workers: Mutex<HashMap<String, SourceWorker>>,
    keepalive: JoinHandle<()>,
}

impl Monitor {
    /// Validates `config`, warms the detector up and registers the configured
    /// zones. `runtime` must be a multi-threaded tokio runtime.
    pub fn new(config: CrowdConfig, detector: Arc<dyn Detector>, runtime: Handle) -> Result<Self, MonitorError> {
        config.validate()?;
        detector.warm_up()?;

        let zones = Arc::new(ZoneRegistry::new(config.density.occupancy));
        for zone in &config.zones {
            zones.create(zone.clone())?;
        }
        let hub = Arc::new(BroadcastHub::new(&config.hub));
        let dedup = Arc::new(AlertDeduplicator::new(config.debounce.clone()));
        let dispatcher = Arc::new(AlertDispatcher::new(
            Arc::clone(&hub),
            Arc::clone(&dedup),
            Arc::clone(&zones),
            config.processing.jpeg_quality,
        ));
        let keepalive = {
            let _guard = runtime.enter();
            hub.spawn_keepalive(config.hub.ping_interval())
        };
        tracing::info!(zones = zones.len(), "monitor ready");

        Ok(Self {
            config: Arc::new(config),
            detector,
            hub,
            zones,
            dedup,
            dispatcher,
            runtime,
            workers: Mutex::new(HashMap::new()),
            keepalive,
        })
    }

    pub fn config(&self) -> &CrowdConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn zone_registry(&self) -> &Arc<ZoneRegistry> {
        &self.zones
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, SourceWorker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a worker for `camera`. Returns `false` if that camera is already
    /// running; a finished worker for the same id is replaced.
    pub fn start_monitoring(&self, camera: CameraConfig, source: Box<dyn FrameSource>) -> Result<bool, MonitorError> {
        camera.validate()?;
        if let Some(zone_id) = camera.zone_id.as_deref() {
            if !self.zones.contains(zone_id) {
                return Err(ConfigError::UnknownZone(zone_id.to_string()).into());
            }
        }

        let camera_id = camera.camera_id.clone();
        let stale = {
            let mut workers = self.workers();
            match workers.get(&camera_id) {
                Some(worker) if worker.is_running() => return Ok(false),
                _ => workers.remove(&camera_id),
            }
        };
        drop(stale);

        let ctx = WorkerContext {
            detector: Arc::clone(&self.detector),
            sink: Arc::new(RuntimeDispatch::new(Arc::clone(&self.dispatcher), self.runtime.clone())),
            zones: Arc::clone(&self.zones),
            config: Arc::clone(&self.config),
        };
        let mut worker = SourceWorker::new(camera, source, ctx);
        worker.start()?;

        let mut workers = self.workers();
        if workers.contains_key(&camera_id) {
            // lost a race with a concurrent start for the same camera
            drop(workers);
            worker.stop();
            return Ok(false);
        }
        workers.insert(camera_id, worker);
        Ok(true)
    }

    pub fn stop_monitoring(&self, camera_id: &str) -> Result<(), MonitorError> {
        let mut worker = self
            .workers()
            .remove(camera_id)
            .ok_or_else(|| MonitorError::UnknownCamera(camera_id.to_string()))?;
        worker.stop();
        let forgotten = self.dedup.forget_source(camera_id);
        tracing::info!(camera_id, forgotten, "monitoring stopped");
        Ok(())
    }

    pub fn update_threshold(&self, camera_id: &str, threshold: u32) -> Result<(), MonitorError> {
        if threshold == 0 {
            return Err(ConfigError::invalid("threshold", "must be greater than 0").into());
        }
        let workers = self.workers();
        let worker = workers
            .get(camera_id)
            .ok_or_else(|| MonitorError::UnknownCamera(camera_id.to_string()))?;
        worker.set_threshold(threshold);
        tracing::info!(camera_id, threshold, "threshold updated");
        Ok(())
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_monitoring(&self, camera_id: &str) -> bool {
        self.workers().get(camera_id).is_some_and(SourceWorker::is_running)
    }

    pub fn camera_status(&self, camera_id: &str) -> Option<WorkerStatus> {
        self.workers().get(camera_id).map(SourceWorker::status)
    }

    pub fn status(&self) -> SystemStatus {
        let mut cameras: Vec<WorkerStatus> = self.workers().values().map(SourceWorker::status).collect();
        cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        SystemStatus {
            cameras,
            connections: self.hub.connection_counts(),
            hub: self.hub.stats(),
            zones: self.zones.len(),
            dedup_records: self.dedup.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn create_zone(&self, zone: ZoneConfig) -> Result<ZoneSnapshot, MonitorError> {
        Ok(self.zones.create(zone)?)
    }

    pub fn update_zone_capacity(&self, zone_id: &str, capacity: u32) -> Result<ZoneSnapshot, MonitorError> {
        Ok(self.zones.update_capacity(zone_id, capacity)?)
    }

    pub fn set_zone_status(&self, zone_id: &str, status: ZoneStatus) -> Result<ZoneSnapshot, MonitorError> {
        Ok(self.zones.set_status(zone_id, status)?)
    }

    /// Cameras that still point at the zone keep running; their zone updates are
    /// skipped from then on.
    pub fn remove_zone(&self, zone_id: &str) -> Result<ZoneSnapshot, MonitorError> {
        let removed = self.zones.remove(zone_id)?;
        let forgotten = self.dedup.forget_source(zone_id);
        tracing::info!(zone_id, forgotten, "zone removed");
        Ok(removed)
    }

    pub fn zone(&self, zone_id: &str) -> Option<ZoneSnapshot> {
        self.zones.get(zone_id)
    }

    pub fn zones(&self) -> Vec<ZoneSnapshot> {
        self.zones.snapshot()
    }

    pub fn reroute_suggestions(&self, zone_id: &str, limit: usize) -> Result<Vec<RerouteSuggestion>, MonitorError> {
        Ok(self.zones.suggestions_for(zone_id, limit)?)
    }

    pub fn congestion_suggestions(&self, limit: usize) -> Vec<RerouteSuggestion> {
        self.zones.suggestions_for_congested(limit)
    }

    pub async fn send_emergency(&self, request: EmergencyRequest) -> Result<BroadcastReceipt, MonitorError> {
        Ok(self.dispatcher.broadcast_emergency(request).await?)
    }

    pub async fn send_instructions(&self, request: InstructionsRequest) -> Result<BroadcastReceipt, MonitorError> {
        if request.instructions.trim().is_empty() {
            return Err(ConfigError::invalid("instructions", "must not be empty").into());
        }
        Ok(self.dispatcher.broadcast_instructions(request).await?)
    }

    /// Convenience for an emergency tied to a configured zone's coordinates.
    pub fn emergency_at_zone(
        &self,
        zone_id: &str,
        emergency_type: EmergencyType,
        message: impl Into<String>,
        priority: Severity,
    ) -> Result<EmergencyRequest, MonitorError> {
        let zone = self
            .zones
            .get(zone_id)
            .ok_or_else(|| ConfigError::UnknownZone(zone_id.to_string()))?;
        Ok(EmergencyRequest {
            emergency_type,
            message: message.into(),
            location: zone.zone_name,
            priority,
            camera_id: None,
            coordinates: zone.coordinates,
        })
    }

    /// Stops every worker and the keep-alive task.
    pub fn shutdown(&self) {
        let workers: Vec<(String, SourceWorker)> = self.workers().drain().collect();
        for (camera_id, mut worker) in workers {
            worker.stop();
            self.dedup.forget_source(&camera_id);
        }
        self.keepalive.abort();
        tracing::info!("monitor shut down");
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
