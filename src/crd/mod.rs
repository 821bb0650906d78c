//! Custom Resource Definitions for the Ghost operator

mod ghost;
mod types;

pub use ghost::{Ghost, GhostSpec, GhostStatus};
pub use types::{Condition, ConditionStatus, GhostPhase};
