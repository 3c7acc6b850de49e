//! Multi-cadence scheduler
//!
//! `Stopped -> Running -> Stopped`. Starting classifies the instrument set,
//! registers extraction and verification triggers for every non-empty
//! bucket and spawns one polling loop. Handlers due on the same tick run
//! one after another inside that loop.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::triggers::{build_triggers, Trigger, TriggerKind};
use crate::clock::Clock;
use crate::collector::{group_by_cadence, BatchExtractionRunner, IntervalClassifier};
use crate::config::SchedulerConfig;
use crate::domain::{BatchResult, Cadence, VerificationResult};
use crate::supervisor::{AlertManager, AlertPolicy, FreshnessVerifier};

/// Owned exclusively by the engine; readable through [`SchedulerEngine::status`]
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub running: bool,
    pub buckets: BTreeMap<Cadence, Vec<String>>,
    pub last_execution: BTreeMap<Cadence, DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub buckets: BTreeMap<Cadence, usize>,
    pub extraction_triggers: usize,
    pub verification_triggers: usize,
    pub next_trigger: Option<DateTime<Utc>>,
    pub last_execution: BTreeMap<Cadence, DateTime<Utc>>,
}

/// Collaborators wired into an engine
pub struct SchedulerComponents {
    pub classifier: Arc<IntervalClassifier>,
    pub runner: Arc<BatchExtractionRunner>,
    pub verifier: Arc<FreshnessVerifier>,
    pub alerts: Arc<AlertManager>,
    pub policy: AlertPolicy,
    pub clock: Arc<dyn Clock>,
    pub config: SchedulerConfig,
}

struct LoopHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    components: SchedulerComponents,
    state: RwLock<SchedulerState>,
    triggers: Mutex<Vec<Trigger>>,
    /// Serializes start/stop
    lifecycle: Mutex<Option<LoopHandle>>,
}

#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<Inner>,
}

impl SchedulerEngine {
    pub fn new(components: SchedulerComponents) -> Self {
        Self {
            inner: Arc::new(Inner {
                components,
                state: RwLock::new(SchedulerState::default()),
                triggers: Mutex::new(Vec::new()),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.read().await.running
    }

    /// Classify, register triggers, spawn the loop and announce startup.
    ///
    /// A no-op when already running.
    pub async fn start(&self, instruments: &[String]) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!("Scheduler already running");
            return;
        }

        let c = &self.inner.components;
        let classified = c.classifier.classify(instruments).await;
        let buckets = group_by_cadence(&classified);

        let now = c.clock.now();
        let delay = ChronoDuration::minutes(c.config.verification_delay_mins);
        let triggers = build_triggers(&buckets, delay, now);
        let sizes: BTreeMap<Cadence, usize> =
            buckets.iter().map(|(cadence, v)| (*cadence, v.len())).collect();

        info!(
            "Starting scheduler: {} instruments, {} triggers {:?}",
            classified.len(),
            triggers.len(),
            sizes
        );

        *self.inner.triggers.lock().await = triggers;
        {
            let mut state = self.inner.state.write().await;
            state.running = true;
            state.buckets = buckets;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_loop(shutdown_rx).await });
        *lifecycle = Some(LoopHandle {
            shutdown_tx,
            handle,
        });
        drop(lifecycle);

        c.alerts.startup(&sizes).await;
    }

    /// Clear triggers, signal the loop and wait a bounded time for it.
    ///
    /// A no-op when already stopped. An in-flight batch is not interrupted;
    /// if the join times out shutdown proceeds anyway.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            debug!("Scheduler already stopped");
            return;
        };

        self.inner.triggers.lock().await.clear();
        self.inner.state.write().await.running = false;
        let _ = running.shutdown_tx.send(true);

        let timeout = Duration::from_secs(self.inner.components.config.join_timeout_secs);
        match tokio::time::timeout(timeout, running.handle).await {
            Ok(Ok(())) => info!("Scheduler stopped"),
            Ok(Err(e)) => warn!("Scheduler loop ended abnormally: {}", e),
            Err(_) => warn!(
                "Scheduler loop did not exit within {}s, proceeding anyway",
                timeout.as_secs()
            ),
        }
    }

    async fn run_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let config = &self.inner.components.config;
        let poll = Duration::from_secs(config.poll_interval_secs);
        let backoff = Duration::from_secs(config.error_backoff_secs);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let wait = match AssertUnwindSafe(self.run_pending()).catch_unwind().await {
                Ok(fired) => {
                    if fired > 0 {
                        debug!("Tick ran {} handlers", fired);
                    }
                    poll
                }
                Err(_) => {
                    error!("Scheduler tick panicked, backing off {:?}", backoff);
                    backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        debug!("Scheduler loop exited");
    }

    /// Run every trigger whose time has arrived and advance it.
    ///
    /// Extractions due on the same tick run before verifications. Returns
    /// the number of handlers run.
    pub async fn run_pending(&self) -> usize {
        let now = self.inner.components.clock.now();
        let mut due: Vec<Trigger> = {
            let mut triggers = self.inner.triggers.lock().await;
            triggers
                .iter_mut()
                .filter(|t| t.is_due(now))
                .map(|t| {
                    let fired = t.clone();
                    t.advance(now);
                    fired
                })
                .collect()
        };
        due.sort_by(|a, b| (a.next_run, a.kind).cmp(&(b.next_run, b.kind)));

        for trigger in &due {
            match trigger.kind {
                TriggerKind::Extraction => {
                    self.execute_at(trigger.cadence, trigger.next_run).await;
                }
                TriggerKind::Verification => {
                    self.verify(trigger.cadence).await;
                }
            }
        }
        due.len()
    }

    async fn bucket(&self, cadence: Cadence) -> Vec<String> {
        self.inner
            .state
            .read()
            .await
            .buckets
            .get(&cadence)
            .cloned()
            .unwrap_or_default()
    }

    /// Extract one bucket now
    pub async fn execute(&self, cadence: Cadence) -> Option<BatchResult> {
        let now = self.inner.components.clock.now();
        self.execute_at(cadence, now).await
    }

    async fn execute_at(&self, cadence: Cadence, boundary: DateTime<Utc>) -> Option<BatchResult> {
        let instruments = self.bucket(cadence).await;
        if instruments.is_empty() {
            debug!("{} bucket empty, nothing to extract", cadence);
            return None;
        }

        let c = &self.inner.components;
        info!("{} cycle starting for {} instruments", cadence, instruments.len());
        if c.policy.should_announce_cycle_start(cadence, boundary.hour()) {
            c.alerts
                .cycle_start(cadence, instruments.len(), boundary + cadence.period())
                .await;
        }

        let result = c.runner.extract(&instruments, cadence).await;
        if c.policy.should_report_cycle(cadence, &result) {
            c.alerts.cycle_result(cadence, &result).await;
        }

        self.inner
            .state
            .write()
            .await
            .last_execution
            .insert(cadence, c.clock.now());
        Some(result)
    }

    /// Check freshness of one bucket and escalate per policy
    pub async fn verify(&self, cadence: Cadence) -> Option<VerificationResult> {
        let instruments = self.bucket(cadence).await;
        if instruments.is_empty() {
            return None;
        }

        let c = &self.inner.components;
        match c.verifier.verify_cadence(&instruments, cadence).await {
            Ok(result) => {
                if c.policy.should_alert_verification(&result) {
                    c.alerts.verification_alert(&result).await;
                }
                Some(result)
            }
            Err(e) => {
                error!("{} verification failed: {}", cadence, e);
                let send = match c.policy.error_throttle(cadence) {
                    Some(window) => {
                        c.alerts
                            .throttle_allows(&format!("verification-error:{}", cadence), window)
                            .await
                    }
                    None => true,
                };
                if send {
                    c.alerts.verification_error(cadence, &e.to_string()).await;
                }
                None
            }
        }
    }

    pub async fn triggers(&self) -> Vec<Trigger> {
        self.inner.triggers.lock().await.clone()
    }

    pub async fn state(&self) -> SchedulerState {
        self.inner.state.read().await.clone()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.read().await.clone();
        let triggers = self.inner.triggers.lock().await;
        let count = |kind: TriggerKind| triggers.iter().filter(|t| t.kind == kind).count();

        SchedulerStatus {
            running: state.running,
            buckets: state
                .buckets
                .iter()
                .map(|(cadence, v)| (*cadence, v.len()))
                .collect(),
            extraction_triggers: count(TriggerKind::Extraction),
            verification_triggers: count(TriggerKind::Verification),
            next_trigger: triggers.iter().map(|t| t.next_run).min(),
            last_execution: state.last_execution,
        }
    }
}
