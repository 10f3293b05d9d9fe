//! HTTP PURGE method handler
//!
//! Lets deployment tooling trigger bans over HTTP instead of the CLI.
//!
//! - `PURGE /path` bans the request path (regex match)
//! - `X-Purge-Type: tag` with `X-Purge-Tags: a,b` bans by cache tag
//! - `X-Purge-Pattern` overrides the pattern, `X-Purge-Exact: true` matches exactly

use crate::error::{Result, VarnishError};
use crate::fanout::BackendReport;
use crate::invalidator::{InvalidationReport, Invalidator, ManualPurge};
use crate::purge_metrics::PurgeMetrics;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Actor recorded in the ban log for HTTP purges
const HTTP_ACTOR: &str = "http";

/// PURGE request handler
pub struct PurgeHandler {
    invalidator: Arc<Invalidator>,
    /// Optional auth token
    auth_token: Option<String>,
    /// Prometheus metrics (optional)
    metrics: Option<Arc<PurgeMetrics>>,
}

/// PURGE response body
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub success: bool,
    pub kind: Option<String>,
    pub command: Option<String>,
    pub backends: Vec<BackendReport>,
    pub message: String,
}

enum AuthFailure {
    Missing,
    Invalid,
}

impl PurgeHandler {
    pub fn new(invalidator: Arc<Invalidator>) -> Self {
        Self {
            invalidator,
            auth_token: None,
            metrics: None,
        }
    }

    /// Require `token` on every purge request
    pub fn with_auth(invalidator: Arc<Invalidator>, auth_token: String) -> Self {
        Self {
            invalidator,
            auth_token: Some(auth_token),
            metrics: None,
        }
    }

    /// Enable Prometheus metrics
    pub fn with_metrics(mut self, metrics: Arc<PurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle HTTP PURGE request
    pub async fn handle_purge<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>> {
        if req.method().as_str() != "PURGE" {
            return self.error_response(StatusCode::METHOD_NOT_ALLOWED, "Only PURGE method is allowed");
        }

        if let Err(failure) = self.check_auth(req.headers()) {
            let reason = match failure {
                AuthFailure::Missing => "missing_token",
                AuthFailure::Invalid => "invalid_token",
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_auth_failure(reason);
            }
            return self.error_response(
                StatusCode::UNAUTHORIZED,
                "Invalid or missing authentication token",
            );
        }

        let job = match header(req.headers(), "x-purge-type")
            .unwrap_or(Ok("request"))
            .and_then(|kind| PurgeJob::from_request(kind, &req))
        {
            Ok(job) => job,
            Err(e) => return self.error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let outcome = match job {
            PurgeJob::Manual(manual) => self.invalidator.manual(manual, HTTP_ACTOR).await,
            PurgeJob::Request { pattern, exact } => {
                self.invalidator
                    .purge_request(&pattern, exact, HTTP_ACTOR)
                    .await
            }
        };

        match outcome {
            Ok(report) => self.report_response(report),
            Err(VarnishError::InvalidCommand(message)) => {
                self.error_response(StatusCode::BAD_REQUEST, &message)
            }
            Err(e) => {
                warn!("Purge failed: {}", e);
                self.error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }

    fn check_auth(&self, headers: &HeaderMap) -> std::result::Result<(), AuthFailure> {
        let Some(expected_token) = &self.auth_token else {
            return Ok(());
        };

        let mut presented = false;

        // Support both "Bearer <token>" and direct token
        if let Some(Ok(auth_str)) = header(headers, "authorization") {
            presented = true;
            let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str);
            if token == expected_token {
                return Ok(());
            }
        }

        if let Some(Ok(token)) = header(headers, "x-purge-token") {
            presented = true;
            if token == expected_token {
                return Ok(());
            }
        }

        Err(if presented {
            AuthFailure::Invalid
        } else {
            AuthFailure::Missing
        })
    }

    fn report_response(&self, report: InvalidationReport) -> Result<Response<Full<Bytes>>> {
        let success = report.success();
        let (status, message) = if success {
            info!("Purge {} acknowledged by every control terminal", report.command);
            (StatusCode::OK, "Ban accepted by every control terminal".to_string())
        } else {
            let failed = report
                .report
                .iter()
                .filter(|backend| !backend.outcome.all_succeeded())
                .count();
            (
                StatusCode::BAD_GATEWAY,
                format!("Ban failed on {} of {} control terminals", failed, report.report.backends.len()),
            )
        };

        let response = PurgeResponse {
            success,
            kind: Some(report.kind.to_string()),
            command: Some(report.command),
            backends: report.report.backends,
            message,
        };
        self.json_response(status, &response)
    }

    /// Build JSON response
    fn json_response(&self, status: StatusCode, body: &PurgeResponse) -> Result<Response<Full<Bytes>>> {
        let json = serde_json::to_string(body)
            .map_err(|e| VarnishError::InternalError(format!("Failed to serialize response: {}", e)))?;

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header("cache-control", "no-cache, no-store, must-revalidate")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| VarnishError::InternalError(format!("Failed to build response: {}", e)))
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Result<Response<Full<Bytes>>> {
        let response = PurgeResponse {
            success: false,
            kind: None,
            command: None,
            backends: Vec::new(),
            message: message.to_string(),
        };

        self.json_response(status, &response)
    }
}

enum PurgeJob {
    Manual(ManualPurge),
    Request { pattern: String, exact: bool },
}

impl PurgeJob {
    /// Work out what to purge; errors here are malformed input
    fn from_request<B>(kind: &str, req: &Request<B>) -> Result<Self> {
        let headers = req.headers();

        if kind.eq_ignore_ascii_case("tag") {
            let tags = header(headers, "x-purge-tags").ok_or_else(|| {
                VarnishError::InvalidCommand("X-Purge-Tags is required for tag purges".to_string())
            })??;
            return Ok(PurgeJob::Manual(ManualPurge::parse("tag", tags)?));
        }

        if !kind.eq_ignore_ascii_case("request") {
            return Err(VarnishError::InvalidCommand(format!(
                "Unsupported purge type: {}",
                kind
            )));
        }

        let pattern = match header(headers, "x-purge-pattern") {
            Some(pattern) => pattern?.to_string(),
            None => req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        };
        if pattern.trim().is_empty() {
            return Err(VarnishError::InvalidCommand(
                "X-Purge-Pattern must not be empty".to_string(),
            ));
        }

        let exact = header(headers, "x-purge-exact")
            .and_then(|v| v.ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(PurgeJob::Request { pattern, exact })
    }
}

/// A header as text; `Some(Err)` when present but not visible ASCII
fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<Result<&'h str>> {
    headers.get(name).map(|value| {
        value
            .to_str()
            .map_err(|_| VarnishError::InvalidCommand(format!("Header {} is not valid text", name)))
    })
}
