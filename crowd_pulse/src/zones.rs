// THEORY:
// A zone is a physical area with a fixed capacity that one or more cameras look
// at. The registry maps every analysis from a bound camera onto its zone and keeps
// the derived occupancy figures current.
//
// Key architectural principles:
// 1.  **Two-level locking**: the id -> zone map is read-mostly and guarded by an
//     `RwLock`; each zone has its own `Mutex`, so updates from cameras in
//     different zones never contend.
// 2.  **Snapshots out, never references**: callers receive `ZoneSnapshot` values.
//     Re-routing is a pure function over such snapshots.
// 3.  **No occupancy data yet**: a freshly created zone has no `last_update`
//     until its first analysis arrives.

use crate::config::{Coordinates, ZoneConfig, ZoneStatus};
use crate::core_modules::density::{DensityTier, OccupancyTierPolicy, Trend, occupancy_percentage};
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Candidates at or above this occupancy are never suggested.
const REROUTE_MAX_OCCUPANCY: f64 = 90.0;
const BASE_WAIT_MINUTES: f64 = 5.0;
const MAX_ALTERNATIVES: usize = 2;
pub const DEFAULT_SUGGESTIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub zone_id: String,
    pub zone_name: String,
    pub capacity: u32,
    pub coordinates: Option<Coordinates>,
    pub status: ZoneStatus,
    pub current_occupancy: usize,
    pub occupancy_percentage: f64,
    /// Count-policy tier of the last analysis that touched this zone.
    #[serde(rename = "density_level")]
    pub density_tier: DensityTier,
    pub occupancy_tier: DensityTier,
    pub trend: Trend,
    #[serde(serialize_with = "crate::messages::serialize_utc_opt")]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Zone {
    config: ZoneConfig,
    current_occupancy: usize,
    occupancy_percentage: f64,
    density_tier: DensityTier,
    occupancy_tier: DensityTier,
    trend: Trend,
    last_update: Option<DateTime<Utc>>,
}

impl Zone {
    fn new(config: ZoneConfig) -> Self {
        Self {
            config,
            current_occupancy: 0,
            occupancy_percentage: 0.0,
            density_tier: DensityTier::None,
            occupancy_tier: DensityTier::None,
            trend: Trend::Stable,
            last_update: None,
        }
    }

    fn rederive(&mut self, policy: &OccupancyTierPolicy) {
        self.occupancy_percentage = occupancy_percentage(self.current_occupancy, self.config.capacity);
        self.occupancy_tier = policy.classify(self.occupancy_percentage);
    }

    fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_id: self.config.id.clone(),
            zone_name: self.config.name.clone(),
            capacity: self.config.capacity,
            coordinates: self.config.coordinates,
            status: self.config.status,
            current_occupancy: self.current_occupancy,
            occupancy_percentage: self.occupancy_percentage,
            density_tier: self.density_tier,
            occupancy_tier: self.occupancy_tier,
            trend: self.trend,
            last_update: self.last_update,
        }
    }
}

pub struct ZoneRegistry {
    occupancy: OccupancyTierPolicy,
    zones: RwLock<HashMap<String, Arc<Mutex<Zone>>>>,
}

impl ZoneRegistry {
    pub fn new(occupancy: OccupancyTierPolicy) -> Self {
        Self {
            occupancy,
            zones: RwLock::new(HashMap::new()),
        }
    }

    fn zone(&self, zone_id: &str) -> Option<Arc<Mutex<Zone>>> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(zone_id)
            .cloned()
    }

    fn with_zone<T>(&self, zone_id: &str, f: impl FnOnce(&mut Zone) -> T) -> Result<T, ConfigError> {
        let zone = self
            .zone(zone_id)
            .ok_or_else(|| ConfigError::UnknownZone(zone_id.to_string()))?;
        let mut guard = zone.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    pub fn create(&self, config: ZoneConfig) -> Result<ZoneSnapshot, ConfigError> {
        config.validate()?;
        let mut zones = self.zones.write().unwrap_or_else(PoisonError::into_inner);
        if zones.contains_key(&config.id) {
            return Err(ConfigError::DuplicateZone(config.id));
        }
        let zone = Zone::new(config);
        let snapshot = zone.snapshot();
        zones.insert(snapshot.zone_id.clone(), Arc::new(Mutex::new(zone)));
        tracing::info!(zone_id = %snapshot.zone_id, capacity = snapshot.capacity, "zone created");
        Ok(snapshot)
    }

    /// Changes capacity and immediately re-derives percentage and occupancy tier.
    pub fn update_capacity(&self, zone_id: &str, capacity: u32) -> Result<ZoneSnapshot, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::NonPositiveCapacity {
                zone_id: zone_id.to_string(),
            });
        }
        let policy = self.occupancy;
        self.with_zone(zone_id, |zone| {
            zone.config.capacity = capacity;
            zone.rederive(&policy);
            zone.snapshot()
        })
    }

    pub fn set_status(&self, zone_id: &str, status: ZoneStatus) -> Result<ZoneSnapshot, ConfigError> {
        self.with_zone(zone_id, |zone| {
            zone.config.status = status;
            zone.snapshot()
        })
    }

    pub fn remove(&self, zone_id: &str) -> Result<ZoneSnapshot, ConfigError> {
        let removed = self
            .zones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(zone_id)
            .ok_or_else(|| ConfigError::UnknownZone(zone_id.to_string()))?;
        let snapshot = removed.lock().unwrap_or_else(PoisonError::into_inner).snapshot();
        tracing::info!(zone_id, "zone removed");
        Ok(snapshot)
    }

    pub fn get(&self, zone_id: &str) -> Option<ZoneSnapshot> {
        self.with_zone(zone_id, |zone| zone.snapshot()).ok()
    }

    pub fn contains(&self, zone_id: &str) -> bool {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(zone_id)
    }

    pub fn capacity(&self, zone_id: &str) -> Option<u32> {
        self.with_zone(zone_id, |zone| zone.config.capacity).ok()
    }

    pub fn len(&self) -> usize {
        self.zones.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All zones, ordered by id.
    pub fn snapshot(&self) -> Vec<ZoneSnapshot> {
        let handles: Vec<Arc<Mutex<Zone>>> = self
            .zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut out: Vec<ZoneSnapshot> = handles
            .iter()
            .map(|z| z.lock().unwrap_or_else(PoisonError::into_inner).snapshot())
            .collect();
        out.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        out
    }

    /// Folds one analysis from a bound camera into its zone.
    pub fn record_analysis(
        &self,
        zone_id: &str,
        people_count: usize,
        density_tier: DensityTier,
        timestamp: DateTime<Utc>,
    ) -> Result<ZoneSnapshot, ConfigError> {
        let policy = self.occupancy;
        self.with_zone(zone_id, |zone| {
            zone.trend = match zone.last_update {
                Some(_) => Trend::between(zone.current_occupancy, people_count),
                None => Trend::Stable,
            };
            zone.current_occupancy = people_count;
            zone.density_tier = density_tier;
            zone.rederive(&policy);
            zone.last_update = Some(timestamp);
            zone.snapshot()
        })
    }

    pub fn suggestions_for(&self, zone_id: &str, limit: usize) -> Result<Vec<RerouteSuggestion>, ConfigError> {
        let all = self.snapshot();
        let from = all
            .iter()
            .find(|z| z.zone_id == zone_id)
            .ok_or_else(|| ConfigError::UnknownZone(zone_id.to_string()))?;
        Ok(reroute_suggestions(from, &all, limit))
    }

    /// Suggestions away from every zone whose density tier is HIGH or CRITICAL.
    pub fn suggestions_for_congested(&self, limit: usize) -> Vec<RerouteSuggestion> {
        let all = self.snapshot();
        all.iter()
            .filter(|z| z.density_tier >= DensityTier::High)
            .flat_map(|from| reroute_suggestions(from, &all, limit))
            .collect()
    }

    pub fn suggestion_between(&self, from_zone: &str, to_zone: &str) -> Result<RerouteSuggestion, ConfigError> {
        let all = self.snapshot();
        let find = |id: &str| {
            all.iter()
                .find(|z| z.zone_id == id)
                .ok_or_else(|| ConfigError::UnknownZone(id.to_string()))
        };
        let (from, to) = (find(from_zone)?, find(to_zone)?);
        Ok(suggest(from, to, &all))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerouteSuggestion {
    pub from_zone: String,
    pub to_zone: String,
    pub reason: String,
    pub urgency: Urgency,
    pub estimated_wait_minutes: i64,
    /// Names of up to two other LOW-tier zones.
    pub alternative_routes: Vec<String>,
}

/// Top `limit` destinations for people leaving `from`, best first.
pub fn reroute_suggestions(from: &ZoneSnapshot, all: &[ZoneSnapshot], limit: usize) -> Vec<RerouteSuggestion> {
    let mut candidates: Vec<&ZoneSnapshot> = all
        .iter()
        .filter(|z| {
            z.zone_id != from.zone_id
                && z.status == ZoneStatus::Active
                && z.density_tier != DensityTier::Critical
                && z.occupancy_percentage < REROUTE_MAX_OCCUPANCY
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.density_tier
            .cmp(&b.density_tier)
            .then(a.occupancy_percentage.total_cmp(&b.occupancy_percentage))
    });
    candidates
        .into_iter()
        .take(limit)
        .map(|to| suggest(from, to, all))
        .collect()
}

pub fn suggest(from: &ZoneSnapshot, to: &ZoneSnapshot, all: &[ZoneSnapshot]) -> RerouteSuggestion {
    let wait = estimated_wait_minutes(to);
    RerouteSuggestion {
        from_zone: from.zone_id.clone(),
        to_zone: to.zone_id.clone(),
        reason: reroute_reason(from, to, wait),
        urgency: urgency(from.density_tier, to.density_tier),
        estimated_wait_minutes: wait,
        alternative_routes: all
            .iter()
            .filter(|z| z.zone_id != from.zone_id && z.zone_id != to.zone_id && z.density_tier == DensityTier::Low)
            .take(MAX_ALTERNATIVES)
            .map(|z| z.zone_name.clone())
            .collect(),
    }
}

pub fn urgency(from: DensityTier, to: DensityTier) -> Urgency {
    match (from, to) {
        (DensityTier::Critical, DensityTier::Low) => Urgency::Critical,
        (DensityTier::High, DensityTier::Low) => Urgency::High,
        (DensityTier::Medium, DensityTier::Low) => Urgency::Medium,
        _ => Urgency::Low,
    }
}

pub fn estimated_wait_minutes(zone: &ZoneSnapshot) -> i64 {
    let multiplier = match zone.density_tier {
        DensityTier::None | DensityTier::Low => 1.0,
        DensityTier::Medium => 1.5,
        DensityTier::High => 2.0,
        DensityTier::Critical => 3.0,
    };
    (BASE_WAIT_MINUTES * zone.occupancy_percentage / 100.0 * multiplier).round() as i64
}

fn reroute_reason(from: &ZoneSnapshot, to: &ZoneSnapshot, wait: i64) -> String {
    if from.density_tier == DensityTier::Critical {
        format!(
            "Critical crowd density detected. Redirecting to {} for safety.",
            to.zone_name
        )
    } else if from.occupancy_percentage > 80.0 {
        format!(
            "High occupancy ({:.1}%). {} has better capacity.",
            from.occupancy_percentage, to.zone_name
        )
    } else {
        format!(
            "Better crowd conditions at {}. Estimated wait time: {wait} minutes.",
            to.zone_name
        )
    }
}
