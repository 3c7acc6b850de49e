use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::FundwatchError;

/// Settlement interval class of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cadence {
    #[serde(rename = "1h")]
    Hourly,
    #[serde(rename = "4h")]
    FourHour,
    #[serde(rename = "8h")]
    EightHour,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Hourly, Cadence::FourHour, Cadence::EightHour];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Hourly => "1h",
            Cadence::FourHour => "4h",
            Cadence::EightHour => "8h",
        }
    }

    pub fn hours(&self) -> u32 {
        match self {
            Cadence::Hourly => 1,
            Cadence::FourHour => 4,
            Cadence::EightHour => 8,
        }
    }

    /// Length of one settlement period
    pub fn period(&self) -> Duration {
        Duration::hours(i64::from(self.hours()))
    }

    /// Freshness window: one period plus a fixed grace
    pub fn max_age(&self, grace: Duration) -> Duration {
        self.period() + grace
    }

    /// High-frequency cadences tolerate more noise before escalating
    pub fn is_high_frequency(&self) -> bool {
        matches!(self, Cadence::Hourly)
    }

    /// Wall-clock UTC instants (time of day) at which extraction runs.
    ///
    /// Pure data: 8h settles at 00/08/16, 4h at every multiple of four,
    /// 1h on every whole hour.
    pub fn trigger_times(&self) -> Vec<NaiveTime> {
        let step = self.hours();
        (0..24)
            .step_by(step as usize)
            .filter_map(|hour| NaiveTime::from_hms_opt(hour, 0, 0))
            .collect()
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = FundwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1h" => Ok(Cadence::Hourly),
            "4h" => Ok(Cadence::FourHour),
            "8h" => Ok(Cadence::EightHour),
            other => Err(FundwatchError::Classification(format!(
                "unknown cadence '{}'",
                other
            ))),
        }
    }
}

/// Decide an instrument's cadence from the UTC hour of its next settlement.
///
/// Hours 4, 12 and 20 only occur on a 4h schedule. Hours 0, 8 and 16 are
/// shared by both schedules and resolve to 8h. Anything else is not a valid
/// settlement hour and falls back to 8h.
pub fn determine_cadence(next_settlement_hour: u32) -> Cadence {
    if next_settlement_hour % 4 != 0 {
        return Cadence::EightHour;
    }
    if next_settlement_hour % 8 == 0 {
        Cadence::EightHour
    } else {
        Cadence::FourHour
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_trigger_sets() {
        let eight: Vec<u32> = Cadence::EightHour
            .trigger_times()
            .iter()
            .map(|t| chrono::Timelike::hour(t))
            .collect();
        assert_eq!(eight, vec![0, 8, 16]);
        assert_eq!(Cadence::FourHour.trigger_times().len(), 6);
        assert_eq!(Cadence::Hourly.trigger_times().len(), 24);
    }

    #[test]
    fn test_max_age() {
        let grace = Duration::minutes(5);
        assert_eq!(
            Cadence::EightHour.max_age(grace),
            Duration::hours(8) + Duration::minutes(5)
        );
        assert_eq!(Cadence::Hourly.max_age(grace), Duration::minutes(65));
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("4h".parse::<Cadence>().unwrap(), Cadence::FourHour);
        assert_eq!(" 8H ".parse::<Cadence>().unwrap(), Cadence::EightHour);
        assert!("2h".parse::<Cadence>().is_err());

        let json = serde_json::to_string(&Cadence::Hourly).unwrap();
        assert_eq!(json, "\"1h\"");
        let back: Cadence = serde_json::from_str("\"8h\"").unwrap();
        assert_eq!(back, Cadence::EightHour);
    }

    #[test]
    fn test_ambiguous_hours_resolve_to_eight() {
        for hour in [0, 8, 16] {
            assert_eq!(determine_cadence(hour), Cadence::EightHour);
        }
        for hour in [4, 12, 20] {
            assert_eq!(determine_cadence(hour), Cadence::FourHour);
        }
    }

    proptest! {
        #[test]
        fn prop_cadence_rule(hour in 0u32..24) {
            let cadence = determine_cadence(hour);
            if [4, 12, 20].contains(&hour) {
                prop_assert_eq!(cadence, Cadence::FourHour);
            } else {
                prop_assert_eq!(cadence, Cadence::EightHour);
            }
        }
    }
}
