use serde::Serialize;
use std::time::Duration;

use super::Cadence;

/// Outcome of one extraction run over a cadence bucket
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
    pub total_count: usize,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl BatchResult {
    pub fn success_count(&self) -> usize {
        self.successful.len()
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 1.0;
        }
        self.success_count() as f64 / self.total_count as f64
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Freshness classification of one cadence bucket
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub cadence: Cadence,
    pub total: usize,
    pub fresh: Vec<String>,
    /// No record at all
    pub missing: Vec<String>,
    /// Record present but older than the freshness window
    pub stale: Vec<String>,
    pub success_rate: f64,
}

impl VerificationResult {
    pub fn verified_count(&self) -> usize {
        self.fresh.len()
    }

    /// Missing and stale, reported together for alerting
    pub fn problematic(&self) -> Vec<String> {
        self.missing
            .iter()
            .chain(self.stale.iter())
            .cloned()
            .collect()
    }

    pub fn problematic_count(&self) -> usize {
        self.missing.len() + self.stale.len()
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
