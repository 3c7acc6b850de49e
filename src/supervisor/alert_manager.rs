//! Alert gateway
//!
//! Renders scheduler and verifier events into titled messages and hands them
//! to the configured notifier. Duplicate alerts are rate limited by key, the
//! total volume is capped per minute, and delivery failures are only logged.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AlertPolicyConfig;
use crate::domain::{BatchResult, Cadence, VerificationResult};
use crate::error::Result;

/// Failed/problematic instruments listed in a message body before truncating
const MAX_LISTED: usize = 10;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    /// Get emoji prefix for alert level
    pub fn emoji(&self) -> &'static str {
        match self {
            AlertLevel::Info => "\u{2139}\u{fe0f}",
            AlertLevel::Warning => "\u{26a0}\u{fe0f}",
            AlertLevel::Error => "\u{274c}",
            AlertLevel::Critical => "\u{1f6a8}",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outbound delivery channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, title: &str, body: &str, level: AlertLevel) -> Result<()>;
}

/// Alert payload
#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        level: AlertLevel,
        component: &str,
        title: &str,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            timestamp,
        }
    }

    /// Body handed to the notifier
    pub fn format_body(&self) -> String {
        format!(
            "Component: {}\nTime: {}\n\n{}",
            self.component,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.message
        )
    }
}

fn list_truncated(items: &[String]) -> String {
    if items.len() <= MAX_LISTED {
        return items.join(", ");
    }
    format!(
        "{} ... and {} more",
        items[..MAX_LISTED].join(", "),
        items.len() - MAX_LISTED
    )
}

/// Rate limiter state for an alert key
#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

pub struct AlertManager {
    config: AlertPolicyConfig,
    clock: Arc<dyn Clock>,
    notifier: Option<Arc<dyn Notifier>>,
    rate_limits: RwLock<HashMap<String, RateLimitState>>,
    alerts_this_minute: RwLock<Vec<DateTime<Utc>>>,
    /// Last delivery per caller-chosen throttle key
    throttles: RwLock<HashMap<String, DateTime<Utc>>>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertPolicyConfig, clock: Arc<dyn Clock>) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            clock,
            notifier: None,
            rate_limits: RwLock::new(HashMap::new()),
            alerts_this_minute: RwLock::new(Vec::new()),
            throttles: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Subscribe to every alert, including ones suppressed before delivery
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.component, alert.level, alert.title)
    }

    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        let key = Self::rate_limit_key(alert);
        let now = self.clock.now();
        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds();
            if elapsed < self.config.rate_limit_secs as i64 {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.title, state.suppressed_count
                );
                return true;
            }
            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }
        false
    }

    async fn is_throttled(&self) -> bool {
        let now = self.clock.now();
        let minute_ago = now - Duration::minutes(1);
        let mut alerts = self.alerts_this_minute.write().await;

        alerts.retain(|t| *t > minute_ago);
        if alerts.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                "Alert throttling: {} alerts in last minute (max: {})",
                alerts.len(),
                self.config.max_alerts_per_minute
            );
            return true;
        }
        alerts.push(now);
        false
    }

    /// True at most once per `window` for a given key
    pub async fn throttle_allows(&self, key: &str, window: Duration) -> bool {
        let now = self.clock.now();
        let mut throttles = self.throttles.write().await;
        match throttles.get(key) {
            Some(last) if now.signed_duration_since(*last) < window => {
                debug!("Throttled '{}' until {}", key, *last + window);
                false
            }
            _ => {
                throttles.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Log, broadcast and deliver an alert
    pub async fn alert(&self, alert: Alert) {
        let _ = self.event_tx.send(alert.clone());

        match alert.level {
            AlertLevel::Info => info!("[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error => {
                error!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Critical => {
                error!(
                    "CRITICAL [{}] {}: {}",
                    alert.component, alert.title, alert.message
                )
            }
        }

        if self.should_rate_limit(&alert).await || self.is_throttled().await {
            return;
        }

        if let Some(ref notifier) = self.notifier {
            let title = format!("{} {}", alert.level.emoji(), alert.title);
            if let Err(e) = notifier.send(&title, &alert.format_body(), alert.level).await {
                error!("Failed to deliver alert '{}': {}", alert.title, e);
            }
        }
    }

    fn build(&self, level: AlertLevel, component: &str, title: &str, message: &str) -> Alert {
        Alert::new(level, component, title, message, self.clock.now())
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(self.build(AlertLevel::Info, component, title, message))
            .await;
    }

    pub async fn warning(&self, component: &str, title: &str, message: &str) {
        self.alert(self.build(AlertLevel::Warning, component, title, message))
            .await;
    }

    pub async fn error(&self, component: &str, title: &str, message: &str) {
        self.alert(self.build(AlertLevel::Error, component, title, message))
            .await;
    }

    /// Startup summary of bucket sizes
    pub async fn startup(&self, buckets: &BTreeMap<Cadence, usize>) {
        let total: usize = buckets.values().sum();
        let lines: Vec<String> = buckets
            .iter()
            .map(|(cadence, count)| format!("{}: {} instruments", cadence, count))
            .collect();
        self.info(
            "scheduler",
            "Funding scheduler started",
            &format!("Tracking {} instruments\n{}", total, lines.join("\n")),
        )
        .await;
    }

    pub async fn cycle_start(
        &self,
        cadence: Cadence,
        instrument_count: usize,
        next_boundary: DateTime<Utc>,
    ) {
        self.info(
            "scheduler",
            &format!("{} cycle started", cadence),
            &format!(
                "Extracting {} instruments\nNext boundary: {}",
                instrument_count,
                next_boundary.format("%Y-%m-%d %H:%M UTC")
            ),
        )
        .await;
    }

    pub async fn cycle_result(&self, cadence: Cadence, result: &BatchResult) {
        let level = if result.is_complete() {
            AlertLevel::Info
        } else {
            AlertLevel::Warning
        };
        let mut message = format!(
            "Success: {}/{} ({:.1}%)\nDuration: {:.1}s",
            result.success_count(),
            result.total_count,
            result.success_rate() * 100.0,
            result.duration.as_secs_f64()
        );
        if !result.failed.is_empty() {
            message.push_str(&format!("\nFailed: {}", list_truncated(&result.failed)));
        }
        self.alert(self.build(
            level,
            "extraction",
            &format!("{} cycle finished", cadence),
            &message,
        ))
        .await;
    }

    pub async fn verification_alert(&self, result: &VerificationResult) {
        let problematic = result.problematic();
        self.warning(
            "verifier",
            &format!("{} freshness check failed", result.cadence),
            &format!(
                "Expected: {}\nFresh: {}\nMissing: {} | Stale: {}\nProblematic: {}",
                result.total,
                result.verified_count(),
                result.missing.len(),
                result.stale.len(),
                list_truncated(&problematic)
            ),
        )
        .await;
    }

    pub async fn verification_error(&self, cadence: Cadence, err: &str) {
        self.error(
            "verifier",
            &format!("{} verification error", cadence),
            err,
        )
        .await;
    }

    /// Suppressed alert counts per key
    pub async fn get_suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FundwatchError;
    use chrono::TimeZone;
    use mockall::predicate::*;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Info < AlertLevel::Warning);
        assert!(AlertLevel::Warning < AlertLevel::Error);
        assert!(AlertLevel::Error < AlertLevel::Critical);
    }

    #[test]
    fn test_list_truncated() {
        let items: Vec<String> = (0..13).map(|i| format!("S{}", i)).collect();
        let text = list_truncated(&items);
        assert!(text.starts_with("S0, S1"));
        assert!(text.ends_with("and 3 more"));
        assert_eq!(list_truncated(&items[..2]), "S0, S1");
    }

    #[tokio::test]
    async fn test_rate_limiting() {
        let manager = AlertManager::new(AlertPolicyConfig::default(), clock());
        let alert = manager.build(AlertLevel::Warning, "test", "Test", "Message");

        assert!(!manager.should_rate_limit(&alert).await);
        assert!(manager.should_rate_limit(&alert).await);
        assert_eq!(manager.get_suppressed_counts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_throttle_window() {
        let clock = clock();
        let manager = AlertManager::new(AlertPolicyConfig::default(), clock.clone());

        assert!(manager.throttle_allows("verify-error:1h", Duration::hours(6)).await);
        clock.advance(Duration::hours(5));
        assert!(!manager.throttle_allows("verify-error:1h", Duration::hours(6)).await);
        assert!(manager.throttle_allows("verify-error:4h", Duration::hours(6)).await);
        clock.advance(Duration::hours(1));
        assert!(manager.throttle_allows("verify-error:1h", Duration::hours(6)).await);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .with(always(), always(), eq(AlertLevel::Warning))
            .times(1)
            .returning(|_, _, _| Err(FundwatchError::Network("telegram down".into())));

        let manager =
            AlertManager::new(AlertPolicyConfig::default(), clock()).with_notifier(Arc::new(notifier));
        let result = VerificationResult {
            cadence: Cadence::EightHour,
            total: 3,
            fresh: vec!["A".into()],
            missing: vec!["C".into()],
            stale: vec!["B".into()],
            success_rate: 1.0 / 3.0,
        };
        manager.verification_alert(&result).await;
    }

    #[tokio::test]
    async fn test_cycle_result_level_and_body() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .withf(|title, body, level| {
                title.contains("4h cycle finished")
                    && body.contains("Success: 1/2")
                    && body.contains("Failed: ETHUSDT")
                    && *level == AlertLevel::Warning
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let manager =
            AlertManager::new(AlertPolicyConfig::default(), clock()).with_notifier(Arc::new(notifier));
        let result = BatchResult {
            successful: vec!["BTCUSDT".into()],
            failed: vec!["ETHUSDT".into()],
            total_count: 2,
            duration: std::time::Duration::from_secs(3),
        };
        manager.cycle_result(Cadence::FourHour, &result).await;
    }

    #[tokio::test]
    async fn test_global_cap_per_minute() {
        let mut notifier = MockNotifier::new();
        notifier.expect_send().times(2).returning(|_, _, _| Ok(()));
        let config = AlertPolicyConfig {
            max_alerts_per_minute: 2,
            ..AlertPolicyConfig::default()
        };
        let manager = AlertManager::new(config, clock()).with_notifier(Arc::new(notifier));
        let mut rx = manager.subscribe();

        for i in 0..4 {
            manager.info("test", &format!("distinct {}", i), "body").await;
        }
        let mut broadcast = 0;
        while rx.try_recv().is_ok() {
            broadcast += 1;
        }
        assert_eq!(broadcast, 4);
    }
}
