//! Persisted state summaries (`s`).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::Timestamped;

/// Result of probing for a restorable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Nothing usable was saved.
    NoStateSaved,
    /// A recent state exists; restore without asking.
    AutomaticRestore,
    /// An older state exists; ask before restoring.
    PromptForRestore,
}

/// Base summary written next to the saved stack entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMetadataSummary {
    #[serde(rename = "_t")]
    pub timestamp: DateTime<Utc>,
    /// Deepest stack depth persisted by the last metadata write.
    #[serde(rename = "dad", default)]
    pub deepest_depth: usize,
    /// Stack generation at the last metadata write.
    #[serde(skip)]
    pub generation: u64,
    /// Length of the savable stack prefix computed by the current save.
    #[serde(skip)]
    pub max_navigable_depth_pre_save: usize,
}

impl Default for StateMetadataSummary {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            deepest_depth: 0,
            generation: 0,
            max_navigable_depth_pre_save: 0,
        }
    }
}

impl StateMetadataSummary {
    pub fn is_valid(&self) -> bool {
        self.deepest_depth >= 1
    }

    pub fn has_changes(&self) -> bool {
        self.deepest_depth != self.max_navigable_depth_pre_save
    }

    pub fn update_for_saving(&mut self, generation: u64) {
        self.generation = generation;
        self.deepest_depth = self.max_navigable_depth_pre_save;
        self.timestamp = Utc::now();
    }
}

impl Timestamped for StateMetadataSummary {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn set_timestamp(&mut self, at: DateTime<Utc>) {
        self.timestamp = at;
    }
}

/// Summary types the checkpointer can persist.
///
/// Implementors embed a [`StateMetadataSummary`] and may extend validity and
/// change detection with their own fields.
pub trait StateMetadata:
    Serialize + DeserializeOwned + Timestamped + Default + Send + Sync + 'static
{
    fn summary(&self) -> &StateMetadataSummary;

    fn summary_mut(&mut self) -> &mut StateMetadataSummary;

    fn is_valid(&self) -> bool {
        self.summary().is_valid()
    }

    fn has_changes(&self) -> bool {
        self.summary().has_changes()
    }

    fn update_for_saving(&mut self, generation: u64) {
        self.summary_mut().update_for_saving(generation);
    }
}

impl StateMetadata for StateMetadataSummary {
    fn summary(&self) -> &StateMetadataSummary {
        self
    }

    fn summary_mut(&mut self) -> &mut StateMetadataSummary {
        self
    }
}

/// Summary that also tracks how many navigation engines were persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NavigationMetadata {
    #[serde(flatten)]
    pub base: StateMetadataSummary,
    #[serde(rename = "nec", default)]
    pub navigation_engine_count: usize,
    /// Engine count computed by the current save.
    #[serde(skip)]
    pub navigation_engines_pre_save: usize,
}

impl Timestamped for NavigationMetadata {
    fn timestamp(&self) -> DateTime<Utc> {
        self.base.timestamp
    }

    fn set_timestamp(&mut self, at: DateTime<Utc>) {
        self.base.timestamp = at;
    }
}

impl StateMetadata for NavigationMetadata {
    fn summary(&self) -> &StateMetadataSummary {
        &self.base
    }

    fn summary_mut(&mut self) -> &mut StateMetadataSummary {
        &mut self.base
    }

    fn is_valid(&self) -> bool {
        self.navigation_engine_count >= 1 || self.base.is_valid()
    }

    fn has_changes(&self) -> bool {
        self.base.has_changes() || self.navigation_engine_count != self.navigation_engines_pre_save
    }

    fn update_for_saving(&mut self, generation: u64) {
        self.base.update_for_saving(generation);
        self.navigation_engine_count = self.navigation_engines_pre_save;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CompressionHint, decode, encode};

    #[test]
    fn summary_validity_requires_depth() {
        let mut summary = StateMetadataSummary::default();
        assert!(!summary.is_valid());
        summary.deepest_depth = 1;
        assert!(summary.is_valid());
    }

    #[test]
    fn update_for_saving_adopts_pre_save_depth() {
        let mut summary = StateMetadataSummary {
            max_navigable_depth_pre_save: 3,
            ..Default::default()
        };
        assert!(summary.has_changes());
        summary.update_for_saving(7);
        assert_eq!(summary.deepest_depth, 3);
        assert_eq!(summary.generation, 7);
        assert!(!summary.has_changes());
    }

    #[test]
    fn summary_persists_short_field_names_only() {
        let summary = StateMetadataSummary {
            deepest_depth: 2,
            generation: 9,
            max_navigable_depth_pre_save: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["dad"], 2);
        assert!(object.contains_key("_t"));
    }

    #[test]
    fn navigation_metadata_valid_with_engines_only() {
        let metadata = NavigationMetadata {
            navigation_engine_count: 1,
            ..Default::default()
        };
        assert!(metadata.is_valid());
        assert!(!NavigationMetadata::default().is_valid());
    }

    #[test]
    fn navigation_metadata_tracks_engine_changes() {
        let mut metadata = NavigationMetadata {
            navigation_engines_pre_save: 2,
            ..Default::default()
        };
        assert!(metadata.has_changes());
        metadata.update_for_saving(1);
        assert_eq!(metadata.navigation_engine_count, 2);
        assert!(!metadata.has_changes());
    }

    #[test]
    fn navigation_metadata_compact_round_trip() {
        let metadata = NavigationMetadata {
            base: StateMetadataSummary {
                deepest_depth: 4,
                ..Default::default()
            },
            navigation_engine_count: 2,
            navigation_engines_pre_save: 0,
        };
        let bytes = encode("s", &metadata, CompressionHint::Compact).unwrap();
        let back: NavigationMetadata = decode("s", &bytes, CompressionHint::Compact).unwrap();
        assert_eq!(back.base.deepest_depth, 4);
        assert_eq!(back.navigation_engine_count, 2);
        assert_eq!(back.base.timestamp, metadata.base.timestamp);
    }
}
