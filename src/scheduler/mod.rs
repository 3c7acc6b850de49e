//! Wall-clock trigger scheduling for extraction and verification

mod engine;
mod triggers;

pub use engine::{SchedulerComponents, SchedulerEngine, SchedulerState, SchedulerStatus};
pub use triggers::{build_triggers, next_occurrence, Trigger, TriggerKind};
