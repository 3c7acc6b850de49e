use fundwatch::adapters::{BinanceFuturesClient, PostgresFundingStore, TelegramNotifier};
use fundwatch::clock::{Clock, SystemClock};
use fundwatch::collector::{
    BatchExtractionRunner, ClassificationCache, FundingUpdater, IntervalClassifier,
    RateLimitedFetcher, StartTimeCache,
};
use fundwatch::config::{AppConfig, LoggingConfig};
use fundwatch::error::Result;
use fundwatch::persistence::{FundingStore, JsonFileStore, MemoryFundingStore};
use fundwatch::scheduler::{SchedulerComponents, SchedulerEngine};
use fundwatch::supervisor::{AlertManager, AlertPolicy, FreshnessVerifier};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Everything the subcommands share, wired from one config
pub struct Runtime {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub fetcher: Arc<RateLimitedFetcher>,
    pub updater: Arc<FundingUpdater>,
    pub classifier: Arc<IntervalClassifier>,
    pub verifier: Arc<FreshnessVerifier>,
    pub alerts: Arc<AlertManager>,
}

impl Runtime {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let source = Arc::new(BinanceFuturesClient::new(
            config.market.rest_url.clone(),
            Duration::from_secs(config.fetcher.request_timeout_secs),
        )?);
        let fetcher = Arc::new(RateLimitedFetcher::new(
            source,
            clock.clone(),
            config.fetcher.clone(),
            Arc::new(JsonFileStore::<StartTimeCache>::new(
                config.cache.start_time_path.clone(),
            )),
        ));

        let store = create_store(&config).await?;
        let updater = Arc::new(FundingUpdater::new(
            fetcher.clone(),
            store.clone(),
            clock.clone(),
        ));
        let classifier = Arc::new(IntervalClassifier::new(
            fetcher.clone(),
            clock.clone(),
            Arc::new(JsonFileStore::<ClassificationCache>::new(
                config.cache.classification_path.clone(),
            )),
        ));
        let verifier = Arc::new(FreshnessVerifier::new(
            store.clone(),
            clock.clone(),
            chrono::Duration::minutes(config.scheduler.freshness_grace_mins),
        ));

        let mut alerts = AlertManager::new(config.alerts.clone(), clock.clone());
        if let Some(notifier) = TelegramNotifier::from_config(config.telegram.as_ref()) {
            alerts = alerts.with_notifier(notifier);
        }

        Ok(Self {
            config,
            clock,
            fetcher,
            updater,
            classifier,
            verifier,
            alerts: Arc::new(alerts),
        })
    }

    pub fn scheduler(&self) -> SchedulerEngine {
        let runner = Arc::new(BatchExtractionRunner::new(
            self.updater.clone(),
            self.config.extraction.clone(),
        ));
        SchedulerEngine::new(SchedulerComponents {
            classifier: self.classifier.clone(),
            runner,
            verifier: self.verifier.clone(),
            alerts: self.alerts.clone(),
            policy: AlertPolicy::new(self.config.alerts.clone()),
            clock: self.clock.clone(),
            config: self.config.scheduler.clone(),
        })
    }

    /// Explicit symbols win; otherwise the volume ranking, then the
    /// configured fallback list
    pub async fn resolve_symbols(&self, explicit: &[String]) -> Vec<String> {
        if !explicit.is_empty() {
            return explicit.iter().map(|s| s.to_uppercase()).collect();
        }
        match self.fetcher.top_symbols(self.config.market.top_symbols_count).await {
            Ok(symbols) if !symbols.is_empty() => symbols,
            Ok(_) => {
                warn!("Volume ranking returned nothing, using fallback symbols");
                self.config.market.fallback_symbols.clone()
            }
            Err(e) => {
                warn!("Failed to rank symbols ({}), using fallback list", e);
                self.config.market.fallback_symbols.clone()
            }
        }
    }
}

async fn create_store(config: &AppConfig) -> Result<Arc<dyn FundingStore>> {
    match &config.database.url {
        Some(url) => {
            let store = PostgresFundingStore::new(url, config.database.max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("No database configured, keeping funding data in memory");
            Ok(Arc::new(MemoryFundingStore::new()))
        }
    }
}

pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},fundwatch=debug,sqlx=warn", logging.level)));

    let log_dir = std::env::var("FUNDWATCH_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/fundwatch".to_string());

    // `rolling::daily` panics if it cannot create the first file, so check
    // writability up front
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".fundwatch_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "fundwatch.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Process-lifetime guard
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let (plain, structured) = if logging.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(structured)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/fundwatch.log", log_dir);
    }
}

pub fn init_logging_simple() {
    // One-shot commands only need warnings on the console
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
