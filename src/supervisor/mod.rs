//! Supervision of data freshness
//!
//! - Alert gateway with de-duplication and throttling
//! - Threshold policy deciding which events reach operators
//! - Freshness verifier run after each settlement boundary

pub mod alert_manager;
pub mod policy;
pub mod verifier;

pub use alert_manager::{Alert, AlertLevel, AlertManager, Notifier};
pub use policy::AlertPolicy;
pub use verifier::FreshnessVerifier;
