//! Journeys: a chosen route plus the alarms materialized for it.

pub mod lifecycle;
mod materializer;
mod types;

pub use lifecycle::{LifecyclePolicy, SweepReport};
pub use materializer::materialize;
pub use types::*;
