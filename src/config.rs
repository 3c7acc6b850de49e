use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub alerts: AlertPolicyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub history: HistorySyncConfig,
    /// Telegram delivery; alerts are only logged when absent
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health/status server port (disabled when unset)
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// REST endpoint of the USD-M futures API
    pub rest_url: String,
    /// Number of instruments to track, ranked by 24h quote volume
    pub top_symbols_count: usize,
    /// Used when the ranking request fails
    pub fallback_symbols: Vec<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".to_string(),
            top_symbols_count: 100,
            fallback_symbols: [
                "BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT", "XRPUSDT", "SOLUSDT", "DOGEUSDT",
                "DOTUSDT", "MATICUSDT", "LTCUSDT", "AVAXUSDT", "LINKUSDT", "UNIUSDT", "ATOMUSDT",
                "FILUSDT",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Minimum spacing between any two outbound requests
    pub min_request_interval_ms: u64,
    /// Sleep after a 429 before the call is reported failed
    pub rate_limit_backoff_ms: u64,
    /// Pause after each start-time binary search probe
    pub probe_delay_ms: u64,
    /// Records per history page (API maximum is 1000)
    pub page_size: usize,
    /// Safety cap on pages per backfill
    pub max_pages: usize,
    /// Iteration cap for start-time binary search
    pub max_search_probes: usize,
    pub request_timeout_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            min_request_interval_ms: 1500,
            rate_limit_backoff_ms: 5000,
            probe_delay_ms: 500,
            page_size: 1000,
            max_pages: 200,
            max_search_probes: 10,
            request_timeout_secs: 30,
        }
    }
}

impl FetcherConfig {
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Batch size for the 1h cadence (higher volume, cheaper per item)
    pub batch_size_hourly: usize,
    /// Batch size for 4h/8h cadences
    pub batch_size_default: usize,
    pub error_pause_hourly_ms: u64,
    pub error_pause_default_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size_hourly: 50,
            batch_size_default: 20,
            error_pause_hourly_ms: 500,
            error_pause_default_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    /// Back-off after a failed tick
    pub error_backoff_secs: u64,
    /// Bounded wait for the loop to exit on stop
    pub join_timeout_secs: u64,
    /// Verification runs this long after each extraction trigger
    pub verification_delay_mins: i64,
    /// Grace added to a cadence period to form the freshness window
    pub freshness_grace_mins: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            error_backoff_secs: 60,
            join_timeout_secs: 10,
            verification_delay_mins: 5,
            freshness_grace_mins: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertPolicyConfig {
    pub hourly_alert_threshold: f64,
    pub hourly_alert_count_threshold: usize,
    pub default_alert_threshold: f64,
    pub default_alert_count_threshold: usize,
    /// 1h cycle results are reported only below this success ratio
    pub hourly_report_ratio: f64,
    /// 1h cycle-start notices are sent only on hours divisible by this
    pub hourly_start_every_hours: u32,
    /// Minimum spacing of 1h verification infrastructure alerts
    pub hourly_error_throttle_hours: i64,
    /// Minimum interval between duplicate alerts
    pub rate_limit_secs: u64,
    pub max_alerts_per_minute: u32,
}

impl Default for AlertPolicyConfig {
    fn default() -> Self {
        Self {
            hourly_alert_threshold: 0.85,
            hourly_alert_count_threshold: 20,
            default_alert_threshold: 0.95,
            default_alert_count_threshold: 5,
            hourly_report_ratio: 0.9,
            hourly_start_every_hours: 4,
            hourly_error_throttle_hours: 6,
            rate_limit_secs: 60,
            max_alerts_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub classification_path: PathBuf,
    pub start_time_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            classification_path: PathBuf::from("funding_intervals_cache.json"),
            start_time_path: PathBuf::from("symbol_start_times_cache.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; in-memory store when unset
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Instruments processed concurrently (requests still pass the global gate)
    pub concurrency: usize,
}

impl Default for HistorySyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FUNDWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (FUNDWATCH_MARKET__REST_URL, etc.)
            .add_source(
                Environment::with_prefix("FUNDWATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.fetcher.min_request_interval_ms < 1500 {
            errors.push("fetcher.min_request_interval_ms must be at least 1500".to_string());
        }

        if self.fetcher.page_size == 0 || self.fetcher.page_size > 1000 {
            errors.push("fetcher.page_size must be between 1 and 1000".to_string());
        }

        if self.extraction.batch_size_hourly == 0 || self.extraction.batch_size_default == 0 {
            errors.push("extraction batch sizes must be positive".to_string());
        }

        if self.scheduler.poll_interval_secs == 0 || self.scheduler.poll_interval_secs > 60 {
            errors.push(
                "scheduler.poll_interval_secs must be between 1 and 60 to hit minute triggers"
                    .to_string(),
            );
        }

        for (name, value) in [
            ("alerts.hourly_alert_threshold", self.alerts.hourly_alert_threshold),
            ("alerts.default_alert_threshold", self.alerts.default_alert_threshold),
            ("alerts.hourly_report_ratio", self.alerts.hourly_report_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{name} must be between 0 and 1"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetcher.min_request_interval(), Duration::from_millis(1500));
        assert_eq!(config.extraction.batch_size_hourly, 50);
        assert_eq!(config.extraction.batch_size_default, 20);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_validate_rejects_fast_fetcher() {
        let mut config = AppConfig::default();
        config.fetcher.min_request_interval_ms = 200;
        config.alerts.hourly_report_ratio = 1.5;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
            health_port = 9100

            [market]
            rest_url = "http://localhost:8080"
            top_symbols_count = 5
            fallback_symbols = ["BTCUSDT"]

            [scheduler]
            poll_interval_secs = 10
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.market.top_symbols_count, 5);
        assert_eq!(config.scheduler.poll_interval_secs, 10);
        assert_eq!(config.scheduler.join_timeout_secs, 10);
        assert_eq!(config.health_port, Some(9100));
        assert!(config.telegram.is_none());
    }
}
