//! Control terminal health
//!
//! Summarizes the coordinator's status snapshot into a single health state
//! for the admin `/health` endpoint.

use crate::fanout::{BackendStatus, FanoutCoordinator};
use hyper::StatusCode;
use serde::Serialize;
use std::sync::Arc;

/// Health status of the control terminals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every terminal answers `status`
    Healthy,
    /// Some terminals are down; bans only reach part of the cache
    Degraded,
    /// No terminal answers, or none is configured
    Unhealthy,
}

impl HealthStatus {
    pub fn from_backends(status: &BackendStatus) -> Self {
        let up = status.up_count();
        if status.is_empty() || up == 0 {
            HealthStatus::Unhealthy
        } else if up == status.len() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    /// Convert health status to HTTP status code
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK, // Still return 200 for degraded
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub terminal: String,
    pub up: bool,
}

/// Body of the `/health` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backends: Vec<BackendHealth>,
}

impl HealthReport {
    pub fn from_backends(status: &BackendStatus) -> Self {
        HealthReport {
            status: HealthStatus::from_backends(status),
            backends: status
                .backends
                .iter()
                .map(|(terminal, up)| BackendHealth {
                    terminal: terminal.clone(),
                    up: *up,
                })
                .collect(),
        }
    }
}

/// Health check service backed by the coordinator's status snapshot
pub struct HealthCheckService {
    coordinator: Arc<FanoutCoordinator>,
}

impl HealthCheckService {
    pub fn new(coordinator: Arc<FanoutCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Current health; probes the terminals only when the snapshot is stale
    pub async fn check(&self) -> HealthReport {
        HealthReport::from_backends(&self.coordinator.status().await)
    }
}
