//! Durable navigation checkpoints.
//!
//! - `metadata`: persisted summaries and restore status
//! - `hooks`: host hooks and the key layout of the state area
//! - `checkpointer`: `StateCheckpointer`: save throttling, restore protocol, crash-loop breaker

pub mod checkpointer;
pub mod hooks;
pub mod metadata;

pub use checkpointer::StateCheckpointer;
pub use hooks::{CheckpointHooks, NoopHooks, RESTORE_ATTEMPT_MARKERS, StateArea};
pub use metadata::{NavigationMetadata, RestoreStatus, StateMetadata, StateMetadataSummary};
