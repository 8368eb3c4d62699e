//! Navigation state.
//!
//! - `unit`: `ActivatedUnit` entries and their persisted record form
//! - `stack`: `NavigationStack`: ordering, renumbering, delayed deactivation
//! - `registry`: `UnitKindRegistry`: kind tags → payload types and navigators

pub mod registry;
pub mod stack;
pub mod unit;

pub use registry::{PlatformHandle, UnitKindRegistry, UnitNavigator};
pub use stack::NavigationStack;
pub use unit::{ActivatedUnit, UnitRecord};
