//! # Overlord Core Library
//!
//! Plans "wake up and leave" alarm sequences for a transit departure and makes
//! sure each one rings at the right wall-clock instant, across restarts and clock
//! changes. The CLI binary is a thin layer over this library.
//!
//! ## Architecture
//!
//! - **Profiles**: named sets of alarm templates. A template's offset is either
//!   fixed or a gap relative to another template; the resolver keeps derived
//!   offsets consistent after every edit
//! - **Journeys**: a chosen route plus the alarms materialized from a profile
//! - **Alarms**: the scheduling gateway, the delivery state machine and recovery
//! - **Storage**: SQLite persistence and TOML configuration
//!
//! ## Key Components
//!
//! - [`AlarmService`]: the operations front-ends call
//! - [`ProfileCatalog`]: profile and template management
//! - [`AlarmDb`]: persistence
//! - [`Config`]: application configuration

pub mod alarm;
pub mod clock;
pub mod error;
pub mod events;
pub mod journey;
pub mod profile;
pub mod service;
pub mod storage;

pub use alarm::{AlarmKey, Outcome, RecoveryTrigger};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, DatabaseError, ConfigError, GraphError, SchedulingError, ValidationError};
pub use events::{Event, EventBus};
pub use journey::{JourneyReceipt, JourneyStatus, RouteSelection};
pub use profile::{AlarmProfile, AlarmTemplate, OffsetRule, ProfileCatalog, TemplateDraft};
pub use service::{AlarmAdjustment, AlarmService};
pub use storage::{AlarmDb, Config, SharedDb};
