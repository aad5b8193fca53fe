// THEORY:
// The dispatcher turns one `FrameAnalysis` into outbound traffic. It is the only
// place that knows the order in which a frame's consequences are announced:
//
// Stage 1: fold the analysis into the camera's zone and announce it on the live
//          map.
// Stage 2: a live count update when the count changed since the last frame.
// Stage 3: a threshold breach whenever the count is above the threshold.
// Stage 4: one anomaly alert per anomaly.
// Stage 5: the heatmap, when the analyzer produced one.
// Stage 6: the annotated live frame, only for cameras that have viewers.
//
// Stages 1-5 pass through the deduplicator; stage 6 is gated on subscribers
// instead, so frames are never encoded for nobody.

use crate::config::Coordinates;
use crate::core_modules::anomaly::Severity;
use crate::core_modules::detection::Frame;
use crate::dedup::{AlertDeduplicator, AlertKind, content_hash};
use crate::error::DispatchError;
use crate::frame_codec;
use crate::hub::{BroadcastHub, Channel};
use crate::messages::{
    AnomalyAlert, EmergencyAlert, EmergencyInstructions, EmergencyLocation, EmergencyType, GeoPoint,
    HeatmapAlert, LiveCountUpdate, LiveFrame, OutboundMessage, ThresholdBreach, ThresholdStatus,
    ZoneUpdate, alert_id,
};
use crate::pipeline::FrameAnalysis;
use crate::worker::AnalysisSink;
use crate::zones::{ZoneRegistry, ZoneSnapshot};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Severity of a breach above this multiple of the threshold is HIGH.
const BREACH_HIGH_FACTOR: f64 = 1.2;

/// The per-camera facts the dispatcher needs besides the analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraView {
    pub camera_id: String,
    pub zone_id: Option<String>,
    pub threshold: u32,
    /// People count of the previously analyzed frame (0 before the first).
    pub previous_count: usize,
}

/// What one dispatch round actually sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub zone_update: bool,
    pub live_count: bool,
    pub threshold_breach: bool,
    pub anomalies: usize,
    pub heatmap: bool,
    pub live_frame: bool,
    pub suppressed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyRequest {
    pub emergency_type: EmergencyType,
    pub message: String,
    pub location: String,
    pub priority: Severity,
    pub camera_id: Option<String>,
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstructionsRequest {
    pub instructions: String,
    pub priority: Severity,
    pub duration_secs: u64,
}

/// Returned to whoever raised an emergency broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastReceipt {
    pub id: String,
    pub recipients: usize,
    pub message: OutboundMessage,
}

pub struct AlertDispatcher {
    hub: Arc<BroadcastHub>,
    dedup: Arc<AlertDeduplicator>,
    zones: Arc<ZoneRegistry>,
    jpeg_quality: u8,
}

impl AlertDispatcher {
    pub fn new(
        hub: Arc<BroadcastHub>,
        dedup: Arc<AlertDeduplicator>,
        zones: Arc<ZoneRegistry>,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            hub,
            dedup,
            zones,
            jpeg_quality,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Publishes `message` on `channel` if the deduplicator admits it.
    async fn gated<T: Serialize>(
        &self,
        kind: AlertKind,
        source_id: &str,
        hash_of: &T,
        channel: &Channel,
        message: OutboundMessage,
        outcome: &mut DispatchOutcome,
    ) -> Result<bool, DispatchError> {
        let hash = content_hash(hash_of)?;
        if !self.dedup.admit(kind, source_id, &hash) {
            outcome.suppressed += 1;
            tracing::trace!(source_id, kind = ?kind, "suppressed duplicate");
            return Ok(false);
        }
        self.hub.publish(channel, &message).await?;
        Ok(true)
    }

    pub async fn dispatch(
        &self,
        analysis: &FrameAnalysis,
        frame: &Frame,
        camera: &CameraView,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut outcome = DispatchOutcome::default();
        let camera_id = camera.camera_id.as_str();
        let count = analysis.people_count;
        let ts = analysis.timestamp;

        // Stage 1: zone aggregation
        if let Some(zone_id) = camera.zone_id.as_deref() {
            match self.zones.record_analysis(zone_id, count, analysis.density_tier, ts) {
                Ok(zone) => {
                    let stable = ZoneSnapshot {
                        last_update: None,
                        ..zone.clone()
                    };
                    let message = OutboundMessage::ZoneUpdate(ZoneUpdate { zone, timestamp: ts });
                    outcome.zone_update = self
                        .gated(AlertKind::ZoneUpdate, zone_id, &stable, &Channel::LiveMap, message, &mut outcome)
                        .await?;
                }
                Err(err) => tracing::debug!(camera_id, zone_id, error = %err, "zone update skipped"),
            }
        }

        // Stage 2: live count
        if count != camera.previous_count {
            let message = OutboundMessage::LiveCountUpdate(LiveCountUpdate {
                camera_id: camera_id.to_string(),
                current_count: count,
                previous_count: camera.previous_count,
                change: count as i64 - camera.previous_count as i64,
                density_level: analysis.density_tier,
                threshold: camera.threshold,
                threshold_status: if count > camera.threshold as usize {
                    ThresholdStatus::Exceeded
                } else {
                    ThresholdStatus::Normal
                },
                timestamp: ts,
            });
            outcome.live_count = self
                .gated(AlertKind::LiveCountUpdate, camera_id, &message, &Channel::Alerts, message.clone(), &mut outcome)
                .await?;
        }

        // Stage 3: threshold breach
        if count > camera.threshold as usize {
            let severity = if count as f64 > camera.threshold as f64 * BREACH_HIGH_FACTOR {
                Severity::High
            } else {
                Severity::Medium
            };
            let message = OutboundMessage::ThresholdBreach(ThresholdBreach {
                id: alert_id("alert", Utc::now()),
                camera_id: camera_id.to_string(),
                severity,
                message: format!("People count ({count}) exceeds threshold ({})", camera.threshold),
                people_count: count,
                threshold: camera.threshold,
                density_level: analysis.density_tier,
                timestamp: ts,
            });
            outcome.threshold_breach = self
                .gated(AlertKind::ThresholdBreach, camera_id, &message, &Channel::Alerts, message.clone(), &mut outcome)
                .await?;
        }

        // Stage 4: anomalies
        for anomaly in &analysis.anomalies {
            let message = OutboundMessage::AnomalyAlert(AnomalyAlert {
                id: alert_id("alert", Utc::now()),
                camera_id: camera_id.to_string(),
                anomaly_type: anomaly.kind,
                severity: anomaly.severity,
                message: anomaly.message.clone(),
                location: anomaly.location,
                confidence: anomaly.confidence,
                timestamp: ts,
            });
            if self
                .gated(AlertKind::AnomalyAlert, camera_id, &message, &Channel::Alerts, message.clone(), &mut outcome)
                .await?
            {
                outcome.anomalies += 1;
            }
        }

        // Stage 5: heatmap
        if let Some(heatmap) = &analysis.heatmap {
            let message = OutboundMessage::HeatmapAlert(HeatmapAlert {
                id: alert_id("alert", Utc::now()),
                camera_id: camera_id.to_string(),
                severity: if count > camera.threshold as usize {
                    Severity::High
                } else {
                    Severity::Medium
                },
                message: format!("Crowd density heatmap update - {count} people detected"),
                heatmap_data: heatmap.clone(),
                timestamp: ts,
            });
            outcome.heatmap = self
                .gated(AlertKind::HeatmapAlert, camera_id, &message, &Channel::Alerts, message.clone(), &mut outcome)
                .await?;
        }

        // Stage 6: live frame
        let quality = self.jpeg_quality;
        let report = self
            .hub
            .publish_with(&Channel::Frames(camera_id.to_string()), || {
                let frame_url = frame_codec::live_frame_data_url(frame, analysis, quality)?;
                Ok(Some(OutboundMessage::LiveFrame(LiveFrame {
                    camera_id: camera_id.to_string(),
                    frame: frame_url,
                    people_count: count,
                    density_level: analysis.density_tier,
                    timestamp: ts,
                })))
            })
            .await?;
        outcome.live_frame = report.delivered > 0;

        Ok(outcome)
    }

    pub async fn broadcast_emergency(&self, request: EmergencyRequest) -> Result<BroadcastReceipt, DispatchError> {
        let now = Utc::now();
        let id = alert_id("emergency", now);
        let message = OutboundMessage::EmergencyAlert(EmergencyAlert {
            id: id.clone(),
            priority: request.priority,
            emergency_type: request.emergency_type,
            title: request.emergency_type.title().to_string(),
            message: request.message,
            location: EmergencyLocation {
                description: request.location,
                coordinates: request.coordinates.map(|c| GeoPoint {
                    latitude: c.lat,
                    longitude: c.lng,
                }),
                camera_id: request.camera_id,
            },
            status: "ACTIVE",
            timestamp: now,
        });
        let report = self.hub.publish(&Channel::Alerts, &message).await?;
        tracing::warn!(alert_id = %id, recipients = report.delivered, "emergency alert broadcast");
        Ok(BroadcastReceipt {
            id,
            recipients: report.delivered,
            message,
        })
    }

    /// Instructions go to the instructions channel and, as a fallback, to alerts.
    pub async fn broadcast_instructions(&self, request: InstructionsRequest) -> Result<BroadcastReceipt, DispatchError> {
        let now = Utc::now();
        let id = alert_id("instruction", now);
        let message = OutboundMessage::EmergencyInstructions(EmergencyInstructions {
            id: id.clone(),
            priority: request.priority,
            instructions: request.instructions,
            duration: request.duration_secs,
            timestamp: now,
        });
        let to_instructions = self.hub.publish(&Channel::Instructions, &message).await?;
        let to_alerts = self.hub.publish(&Channel::Alerts, &message).await?;
        let recipients = to_instructions.delivered + to_alerts.delivered;
        tracing::warn!(alert_id = %id, recipients, "emergency instructions broadcast");
        Ok(BroadcastReceipt { id, recipients, message })
    }
}

/// Drives an [`AlertDispatcher`] from a source worker's OS thread.
///
/// The handle must belong to a multi-threaded runtime: the worker blocks on it
/// while the hub's send timeouts are driven by the runtime's own threads.
pub struct RuntimeDispatch {
    dispatcher: Arc<AlertDispatcher>,
    runtime: tokio::runtime::Handle,
}

impl RuntimeDispatch {
    pub fn new(dispatcher: Arc<AlertDispatcher>, runtime: tokio::runtime::Handle) -> Self {
        Self { dispatcher, runtime }
    }
}

impl AnalysisSink for RuntimeDispatch {
    fn handle(&self, analysis: &FrameAnalysis, frame: &Frame, camera: &CameraView) -> Result<DispatchOutcome, DispatchError> {
        self.runtime.block_on(self.dispatcher.dispatch(analysis, frame, camera))
    }
}
