use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::domain::Cadence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Extraction,
    Verification,
}

/// A wall-clock instant (UTC time of day) at which a handler runs daily
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trigger {
    pub cadence: Cadence,
    pub kind: TriggerKind,
    pub time_of_day: NaiveTime,
    pub next_run: DateTime<Utc>,
}

/// First instant at or after `from` whose UTC time of day is `time`
pub fn next_occurrence(time: NaiveTime, from: DateTime<Utc>) -> DateTime<Utc> {
    let today = from.date_naive().and_time(time).and_utc();
    if today >= from {
        today
    } else {
        today + Duration::days(1)
    }
}

impl Trigger {
    pub fn new(cadence: Cadence, kind: TriggerKind, time_of_day: NaiveTime, now: DateTime<Utc>) -> Self {
        Self {
            cadence,
            kind,
            time_of_day,
            next_run: next_occurrence(time_of_day, now),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_run
    }

    /// Move to the first occurrence strictly after `now`; missed runs are
    /// not replayed
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.next_run = next_occurrence(self.time_of_day, now + Duration::seconds(1));
    }
}

/// One extraction trigger per trigger time of every non-empty bucket, each
/// followed by a verification trigger `verification_delay` later
pub fn build_triggers(
    buckets: &BTreeMap<Cadence, Vec<String>>,
    verification_delay: Duration,
    now: DateTime<Utc>,
) -> Vec<Trigger> {
    let mut triggers = Vec::new();
    for (cadence, instruments) in buckets {
        if instruments.is_empty() {
            continue;
        }
        for time in cadence.trigger_times() {
            triggers.push(Trigger::new(*cadence, TriggerKind::Extraction, time, now));
            triggers.push(Trigger::new(
                *cadence,
                TriggerKind::Verification,
                time + verification_delay,
                now,
            ));
        }
    }
    triggers
}
