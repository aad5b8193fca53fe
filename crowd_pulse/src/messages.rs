// THEORY:
// Every byte the system sends to a subscriber is one of the variants of
// `OutboundMessage`. The enum is closed: a new kind of message is a new variant,
// never an ad hoc JSON object. Serde's internal tagging writes the variant name
// into the `type` field, so the payload structs stay free of it.
//
// Timestamps are always UTC ISO-8601 with millisecond precision and a trailing
// `Z`. Alert-bearing messages carry a fresh `{prefix}_{millis}_{8 hex}` id.

use crate::core_modules::anomaly::{AnomalyKind, Severity};
use crate::core_modules::density::DensityTier;
use crate::core_modules::heatmap::HeatmapData;
use crate::zones::ZoneSnapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Serialize, Serializer};

pub fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `serialize_with` helper for UTC timestamps.
pub fn serialize_utc<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_utc(ts))
}

pub fn serialize_utc_opt<S: Serializer>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serializer.serialize_str(&format_utc(ts)),
        None => serializer.serialize_none(),
    }
}

/// `{prefix}_{unix millis}_{8 lowercase hex}`.
pub fn alert_id(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{prefix}_{}_{suffix:08x}", now.timestamp_millis())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdStatus {
    Exceeded,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveCountUpdate {
    pub camera_id: String,
    pub current_count: usize,
    pub previous_count: usize,
    pub change: i64,
    pub density_level: DensityTier,
    pub threshold: u32,
    pub threshold_status: ThresholdStatus,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdBreach {
    pub id: String,
    pub camera_id: String,
    pub severity: Severity,
    pub message: String,
    pub people_count: usize,
    pub threshold: u32,
    pub density_level: DensityTier,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyAlert {
    pub id: String,
    pub camera_id: String,
    pub anomaly_type: AnomalyKind,
    pub severity: Severity,
    pub message: String,
    pub location: [f32; 2],
    pub confidence: f32,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapAlert {
    pub id: String,
    pub camera_id: String,
    pub severity: Severity,
    pub message: String,
    pub heatmap_data: HeatmapData,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveFrame {
    pub camera_id: String,
    /// `data:image/jpeg;base64,...`
    pub frame: String,
    pub people_count: usize,
    pub density_level: DensityTier,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneUpdate {
    pub zone: ZoneSnapshot,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyType {
    Medical,
    Fire,
    Security,
    Evacuation,
    Other,
}

impl EmergencyType {
    pub fn title(self) -> &'static str {
        match self {
            EmergencyType::Medical => "Medical Emergency",
            EmergencyType::Fire => "Fire Emergency",
            EmergencyType::Security => "Security Emergency",
            EmergencyType::Evacuation => "Evacuation Emergency",
            EmergencyType::Other => "Other Emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyLocation {
    pub description: String,
    pub coordinates: Option<GeoPoint>,
    pub camera_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyAlert {
    pub id: String,
    pub priority: Severity,
    pub emergency_type: EmergencyType,
    pub title: String,
    pub message: String,
    pub location: EmergencyLocation,
    pub status: &'static str,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyInstructions {
    pub id: String,
    pub priority: Severity,
    pub instructions: String,
    /// Seconds clients should keep showing the instructions.
    pub duration: u64,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionEstablished {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

/// Everything that can be sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    LiveCountUpdate(LiveCountUpdate),
    ThresholdBreach(ThresholdBreach),
    AnomalyAlert(AnomalyAlert),
    HeatmapAlert(HeatmapAlert),
    LiveFrame(LiveFrame),
    ZoneUpdate(ZoneUpdate),
    EmergencyAlert(EmergencyAlert),
    EmergencyInstructions(EmergencyInstructions),
    ConnectionEstablished(ConnectionEstablished),
    Ping(Ping),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::LiveCountUpdate(_) => "LIVE_COUNT_UPDATE",
            OutboundMessage::ThresholdBreach(_) => "THRESHOLD_BREACH",
            OutboundMessage::AnomalyAlert(_) => "ANOMALY_ALERT",
            OutboundMessage::HeatmapAlert(_) => "HEATMAP_ALERT",
            OutboundMessage::LiveFrame(_) => "LIVE_FRAME",
            OutboundMessage::ZoneUpdate(_) => "ZONE_UPDATE",
            OutboundMessage::EmergencyAlert(_) => "EMERGENCY_ALERT",
            OutboundMessage::EmergencyInstructions(_) => "EMERGENCY_INSTRUCTIONS",
            OutboundMessage::ConnectionEstablished(_) => "CONNECTION_ESTABLISHED",
            OutboundMessage::Ping(_) => "PING",
        }
    }

    pub fn ping(camera_id: Option<String>, now: DateTime<Utc>) -> Self {
        OutboundMessage::Ping(Ping { camera_id, timestamp: now })
    }

    pub fn connected(message: impl Into<String>, camera_id: Option<String>, now: DateTime<Utc>) -> Self {
        OutboundMessage::ConnectionEstablished(ConnectionEstablished {
            message: message.into(),
            camera_id,
            timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn timestamps_are_millisecond_utc_with_z() {
        let ts = at_millis(1_700_000_000_123);
        assert_eq!(format_utc(&ts), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn alert_id_shape() {
        let id = alert_id("alert", at_millis(1_700_000_000_123));
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "alert");
        assert_eq!(parts[1], "1700000000123");
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn variant_name_becomes_type_field() {
        let msg = OutboundMessage::ThresholdBreach(ThresholdBreach {
            id: "alert_1_00000000".into(),
            camera_id: "cam".into(),
            severity: Severity::High,
            message: "People count (25) exceeds threshold (20)".into(),
            people_count: 25,
            threshold: 20,
            density_level: DensityTier::Critical,
            timestamp: at_millis(0),
        });
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "THRESHOLD_BREACH");
        assert_eq!(v["severity"], "HIGH");
        assert_eq!(v["density_level"], "CRITICAL");
        assert_eq!(v["timestamp"], "1970-01-01T00:00:00.000Z");
        assert_eq!(msg.type_name(), "THRESHOLD_BREACH");
    }

    #[test]
    fn ping_omits_absent_camera() {
        let global: Value = serde_json::to_value(OutboundMessage::ping(None, at_millis(0))).unwrap();
        assert_eq!(global["type"], "PING");
        assert!(global.get("camera_id").is_none());

        let per_camera: Value =
            serde_json::to_value(OutboundMessage::ping(Some("cam-2".into()), at_millis(0))).unwrap();
        assert_eq!(per_camera["camera_id"], "cam-2");
    }

    #[test]
    fn emergency_alert_layout() {
        let msg = OutboundMessage::EmergencyAlert(EmergencyAlert {
            id: "emergency_1_abcdef01".into(),
            priority: Severity::Critical,
            emergency_type: EmergencyType::Medical,
            title: EmergencyType::Medical.title().into(),
            message: "Person down near gate 3".into(),
            location: EmergencyLocation {
                description: "Gate 3".into(),
                coordinates: None,
                camera_id: Some("cam-3".into()),
            },
            status: "ACTIVE",
            timestamp: at_millis(0),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "EMERGENCY_ALERT");
        assert_eq!(v["title"], "Medical Emergency");
        assert_eq!(v["emergency_type"], "MEDICAL");
        assert!(v["location"]["coordinates"].is_null());
        assert_eq!(v["location"]["camera_id"], "cam-3");
    }
}
