//! Host hooks and the persisted key layout.

use std::sync::Arc;

use async_trait::async_trait;

use crate::checkpoint::metadata::StateMetadata;
use crate::navigation::ActivatedUnit;
use crate::store::{ObjectStore, join_key};

/// Number of restore-attempt markers before restoring is abandoned.
pub const RESTORE_ATTEMPT_MARKERS: usize = 3;

/// Logical keys below the state area.
#[derive(Debug, Clone)]
pub struct StateArea {
    root: String,
}

impl StateArea {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Metadata summary.
    pub fn summary(&self) -> String {
        join_key(&[&self.root, "s"])
    }

    /// Folder holding one slot per stack depth.
    pub fn slots(&self) -> String {
        join_key(&[&self.root, "ss"])
    }

    pub fn slot(&self, depth: usize) -> String {
        join_key(&[&self.root, "ss", &depth.to_string()])
    }

    /// Auxiliary navigation data.
    pub fn navigation(&self) -> String {
        join_key(&[&self.root, "n"])
    }

    /// Auxiliary navigation batches.
    pub fn navigation_batches(&self) -> String {
        join_key(&[&self.root, "nb"])
    }

    /// Restore-attempt marker `index` (1-based).
    pub fn marker(&self, index: usize) -> String {
        join_key(&[&self.root, &format!("ra{index}")])
    }
}

/// Host-specific behaviour plugged into the checkpoint protocol.
///
/// Every method has a no-op default.
#[async_trait]
pub trait CheckpointHooks<M: StateMetadata>: Send + Sync + 'static {
    /// Persist host data alongside the stack (`n`, `nb`).
    async fn save_auxiliary_data(
        &self,
        _store: &dyn ObjectStore,
        _area: &StateArea,
        _metadata: &mut M,
    ) -> bool {
        true
    }

    /// Load host data before the stack is rebuilt.
    async fn restore_auxiliary_data(
        &self,
        _store: &dyn ObjectStore,
        _area: &StateArea,
        _metadata: &M,
    ) -> bool {
        true
    }

    /// Reattach host resources to a restored unit at 1-based `depth`.
    fn link_unit(&self, _unit: &Arc<ActivatedUnit>, _depth: usize) -> bool {
        true
    }

    /// Called once after every restore attempt, successful or not.
    fn cleanup_after_restoration(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl<M: StateMetadata> CheckpointHooks<M> for NoopHooks {}
