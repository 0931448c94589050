//! Scheduler service: the control API and the expiry reaper.

pub mod api;
pub mod reaper;

pub use api::{SchedulerApi, SchedulerState};
pub use reaper::Reaper;
