//! Execution engines: one background loop per instance.
//!
//! Core components:
//! - `state`: Engine state machine (NotStarted → Running ⇄ Idle, Faulted, Stopped)
//! - `runner`: `ExecutionEngine`: loop, tick policy, fault recovery, freeze barrier

pub mod runner;
pub mod state;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use runner::{EngineFailure, ExecutionEngine};
pub use state::{EngineState, EngineTransition};

/// Work performed by an engine on every tick.
#[async_trait]
pub trait EngineWork: Send + Sync + 'static {
    /// Perform one round of work.
    ///
    /// Returns the remaining workload: `0` lets the engine go idle, anything
    /// else keeps it running at the active cadence. Errors (and panics) fault
    /// the engine until its recovery delay elapses.
    async fn tick(&self, cancel: &CancellationToken) -> anyhow::Result<usize>;
}
