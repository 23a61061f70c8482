//! Arming, ringing and resolving alarms.
//!
//! - [`gateway`]: one wake registration per alarm key, with exact → inexact fallback
//! - [`delivery`]: the alert session state machine and its exactly-once resolve
//! - [`recovery`]: re-arming everything still due after boot or a clock change
//! - [`sink`]: the alert outputs delivery drives

pub mod delivery;
pub mod gateway;
pub mod recovery;
pub mod sink;
mod types;

pub use delivery::{DeliveryEngine, DeliverySettings, ResolveResult};
pub use gateway::{
    Deliverable, ManualWakeScheduler, PendingWake, SchedulingGateway, TokioWakeScheduler,
    WakeHandler, WakePrecision, WakeScheduler,
};
pub use recovery::{RecoveryCoordinator, RecoveryReport, RecoveryTrigger};
pub use sink::{AlertSink, LogAlertSink, RecordingAlertSink, SinkCall};
pub use types::*;
