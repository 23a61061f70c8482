//! Alarm profiles: reusable sets of templates positioned relative to departure.

mod catalog;
pub mod defaults;
pub mod resolver;
mod types;

pub use catalog::ProfileCatalog;
pub use types::*;
