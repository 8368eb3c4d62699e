//! Operation scheduling.
//!
//! - `operation`: `Operation` lifecycle (Waiting → Running → Completed/Faulted)
//! - `pool`: grow-only worker pool, least-loaded dispatch
//! - `manager`: `OperationScheduler`: Immediate, Pending and Named-Queue disciplines

pub mod manager;
pub mod operation;
pub mod pool;

pub use manager::{OperationScheduler, SchedulerSnapshot};
pub use operation::{Operation, OperationFuture, OperationSender, OperationStatus};
pub use pool::WorkerPool;
