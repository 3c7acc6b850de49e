//! Health and status HTTP server
//!
//! `/health` is a liveness probe for process supervision, `/status` exposes
//! the scheduler, classification and history sync state as JSON.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::history_sync::{HistorySyncService, SyncReport};
use crate::collector::{ClassificationStats, IntervalClassifier};
use crate::error::{FundwatchError, Result};
use crate::scheduler::{SchedulerEngine, SchedulerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub scheduler: SchedulerStatus,
    pub classification: ClassificationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_sync: Option<SyncReport>,
    pub blacklisted: Vec<String>,
}

/// Shared state for the server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub scheduler: SchedulerEngine,
    pub classifier: Arc<IntervalClassifier>,
    pub history: Option<Arc<HistorySyncService>>,
    /// Instruments excluded after a 403
    pub blacklist: Box<dyn Fn() -> Vec<String> + Send + Sync>,
}

impl HealthState {
    pub fn new(scheduler: SchedulerEngine, classifier: Arc<IntervalClassifier>) -> Self {
        Self {
            started_at: Utc::now(),
            scheduler,
            classifier,
            history: None,
            blacklist: Box::new(Vec::<String>::new),
        }
    }

    pub fn with_history(mut self, history: Arc<HistorySyncService>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_blacklist<F>(mut self, blacklist: F) -> Self
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        self.blacklist = Box::new(blacklist);
        self
    }

    pub async fn get_health(&self) -> HealthResponse {
        let now = Utc::now();
        HealthResponse {
            status: if self.scheduler.is_running().await {
                HealthStatus::Healthy
            } else {
                HealthStatus::Stopped
            },
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
        }
    }

    pub async fn get_status(&self) -> StatusResponse {
        let history_sync = match &self.history {
            Some(history) => history.last_report().await,
            None => None,
        };
        StatusResponse {
            scheduler: self.scheduler.status().await,
            classification: self.classifier.stats().await,
            history_sync,
            blacklisted: (self.blacklist)(),
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    pub async fn run(&self) -> Result<()> {
        let app = router(Arc::clone(&self.state));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| FundwatchError::Internal(format!("Health server error: {}", e)))?;
        Ok(())
    }
}

/// 200 while the scheduler runs, 503 once it has stopped
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(health))
}

async fn status_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    Json(state.get_status().await)
}
