//! Activated units: the entries of the navigation stack.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One navigation stack entry.
///
/// `depth` is the 1-based stack position; `0` means deactivated. Any change
/// to depth or payload clears the materialized flag.
#[derive(Debug)]
pub struct ActivatedUnit {
    id: Uuid,
    kind: String,
    depth: AtomicUsize,
    materialized: AtomicBool,
    lazy_initialization: AtomicBool,
    payload: RwLock<serde_json::Value>,
}

impl ActivatedUnit {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            depth: AtomicUsize::new(0),
            materialized: AtomicBool::new(false),
            lazy_initialization: AtomicBool::new(false),
            payload: RwLock::new(payload),
        }
    }

    /// Build a unit from a typed payload.
    pub fn with_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub(crate) fn from_record(record: UnitRecord) -> Self {
        let unit = Self::new(record.kind, record.payload);
        unit.depth.store(record.depth, Ordering::SeqCst);
        unit
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub(crate) fn set_depth(&self, depth: usize) {
        if self.depth.swap(depth, Ordering::SeqCst) != depth {
            self.materialized.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_activated(&self) -> bool {
        self.depth() != 0
    }

    /// Final deactivation.
    pub(crate) fn deactivate(&self) {
        self.set_depth(0);
    }

    /// Whether the current value is known to be durably saved.
    pub fn is_materialized(&self) -> bool {
        self.materialized.load(Ordering::SeqCst)
    }

    pub(crate) fn set_materialized(&self, materialized: bool) {
        self.materialized.store(materialized, Ordering::SeqCst);
    }

    /// Flag the unit as changed so the next save persists it.
    pub fn notify_state_changed(&self) {
        self.set_materialized(false);
    }

    pub fn lazy_initialization(&self) -> bool {
        self.lazy_initialization.load(Ordering::SeqCst)
    }

    pub fn set_lazy_initialization(&self, lazy: bool) {
        self.lazy_initialization.store(lazy, Ordering::SeqCst);
    }

    pub fn payload(&self) -> serde_json::Value {
        match self.payload.read() {
            Ok(payload) => payload.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Decode the payload into its concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload())
    }

    /// Replace the payload; the unit becomes dirty.
    pub fn set_payload(&self, payload: serde_json::Value) {
        match self.payload.write() {
            Ok(mut guard) => *guard = payload,
            Err(poisoned) => *poisoned.into_inner() = payload,
        }
        self.notify_state_changed();
    }

    pub(crate) fn to_record(&self) -> UnitRecord {
        UnitRecord {
            kind: self.kind.clone(),
            depth: self.depth(),
            payload: self.payload(),
        }
    }
}

/// Persisted form of a unit (`ss/<depth>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    #[serde(rename = "k")]
    pub kind: String,
    #[serde(rename = "d")]
    pub depth: usize,
    #[serde(rename = "p", default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn depth_change_clears_materialized() {
        let unit = ActivatedUnit::new("detail", json!({}));
        unit.set_depth(2);
        unit.set_materialized(true);

        unit.set_depth(2);
        assert!(unit.is_materialized());

        unit.set_depth(3);
        assert!(!unit.is_materialized());
    }

    #[test]
    fn payload_update_clears_materialized() {
        let unit = ActivatedUnit::new("detail", json!({"id": 1}));
        unit.set_materialized(true);
        unit.set_payload(json!({"id": 2}));
        assert!(!unit.is_materialized());
        assert_eq!(unit.payload()["id"], 2);
    }

    #[test]
    fn deactivated_unit_has_zero_depth() {
        let unit = ActivatedUnit::new("m", json!(null));
        assert!(!unit.is_activated());
        unit.set_depth(1);
        assert!(unit.is_activated());
        unit.deactivate();
        assert!(!unit.is_activated());
    }

    #[test]
    fn record_preserves_kind_depth_payload() {
        let unit = ActivatedUnit::new("list", json!({"page": 4}));
        unit.set_depth(2);
        let restored = ActivatedUnit::from_record(unit.to_record());
        assert_eq!(restored.kind(), "list");
        assert_eq!(restored.depth(), 2);
        assert_eq!(restored.payload(), json!({"page": 4}));
        assert_ne!(restored.id(), unit.id());
    }

    #[test]
    fn typed_payload_access() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Detail {
            id: u32,
        }
        let unit = ActivatedUnit::with_payload("detail", &Detail { id: 9 }).unwrap();
        assert_eq!(unit.payload_as::<Detail>().unwrap(), Detail { id: 9 });
    }
}
