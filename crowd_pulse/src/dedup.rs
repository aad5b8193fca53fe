// THEORY:
// The deduplicator is a content-hash + time-window gate in front of the hub.
// For every (alert kind, source) pair it remembers the hash of the last admitted
// payload and when it was admitted. A payload is suppressed only when it is the
// same content as last time AND the debounce window has not yet elapsed.
//
// Key architectural principles:
// 1.  **Suppression is passive**: a suppressed call leaves the record untouched,
//     so a steady stream of identical alerts is re-admitted once per window
//     rather than being starved forever.
// 2.  **Content, not instance**: the hash is taken over canonical JSON with the
//     per-instance keys (`id`, `timestamp`, `generated_at`) removed, so two alerts
//     describing the same situation hash identically.
// 3.  **Per-key locking**: a read-mostly map hands out one mutex per key; two
//     cameras never contend on each other's records.

use crate::config::DebounceConfig;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

const VOLATILE_KEYS: [&str; 3] = ["id", "timestamp", "generated_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    LiveCountUpdate,
    ThresholdBreach,
    AnomalyAlert,
    HeatmapAlert,
    ZoneUpdate,
}

#[derive(Debug, Clone)]
struct AlertRecord {
    hash: String,
    sent_at: Instant,
}

type Key = (AlertKind, String);

pub struct AlertDeduplicator {
    debounce: DebounceConfig,
    records: RwLock<HashMap<Key, Arc<Mutex<Option<AlertRecord>>>>>,
    admitted: AtomicU64,
    suppressed: AtomicU64,
}

impl AlertDeduplicator {
    pub fn new(debounce: DebounceConfig) -> Self {
        Self {
            debounce,
            records: RwLock::new(HashMap::new()),
            admitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Gate using the configured debounce window for `kind`.
    pub fn admit(&self, kind: AlertKind, source_id: &str, content_hash: &str) -> bool {
        self.should_send(kind, source_id, content_hash, self.debounce.for_kind(kind))
    }

    pub fn should_send(&self, kind: AlertKind, source_id: &str, content_hash: &str, debounce: Duration) -> bool {
        self.should_send_at(kind, source_id, content_hash, debounce, Instant::now())
    }

    pub fn should_send_at(
        &self,
        kind: AlertKind,
        source_id: &str,
        content_hash: &str,
        debounce: Duration,
        now: Instant,
    ) -> bool {
        let entry = self.entry(kind, source_id);
        let mut record = entry.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(prev) = record.as_ref() {
            let elapsed = now.saturating_duration_since(prev.sent_at);
            if prev.hash == content_hash && elapsed < debounce {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        *record = Some(AlertRecord {
            hash: content_hash.to_string(),
            sent_at: now,
        });
        self.admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn entry(&self, kind: AlertKind, source_id: &str) -> Arc<Mutex<Option<AlertRecord>>> {
        let key = (kind, source_id.to_string());
        {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = records.get(&key) {
                return Arc::clone(entry);
            }
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(records.entry(key).or_default())
    }

    /// Drops every record for a camera or zone.
    pub fn forget_source(&self, source_id: &str) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|(_, source), _| source != source_id);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

/// SHA-256 hex digest of the canonical JSON of `payload`, ignoring volatile keys.
pub fn content_hash<T: Serialize>(payload: &T) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(payload)?;
    strip_volatile(&mut value);
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical)?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

fn strip_volatile(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in VOLATILE_KEYS {
                map.remove(key);
            }
            map.values_mut().for_each(strip_volatile);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_volatile),
        _ => {}
    }
}

/// Compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
