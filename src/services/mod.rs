pub mod health;
pub mod history_sync;

pub use health::{router, HealthResponse, HealthServer, HealthState, HealthStatus, StatusResponse};
pub use history_sync::{HistorySyncService, SyncReport};
