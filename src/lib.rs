//! statekeep: background engines, operation scheduling and durable
//! navigation checkpoints.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod navigation;
pub mod scheduler;
pub mod store;

mod util;

pub use context::CoreContext;
pub use error::{Error, Result};
