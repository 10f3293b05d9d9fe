//! Tag invalidation and manual purges
//!
//! Glue between the host application's invalidation events and the control
//! terminals: build one ban, fan it out, report per terminal.

use crate::config::VarnishConfig;
use crate::error::{Result, VarnishError};
use crate::fanout::{FanoutCoordinator, FanoutReport};
use crate::purge::{PurgeCommandBuilder, PurgeRequest};
use crate::purge_metrics::PurgeMetrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A purge entered by an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualPurge {
    /// Comma-separated tag list
    Tags(Vec<String>),
    /// URL regex
    Request(String),
}

impl ManualPurge {
    /// Parse a purge type and its free-form arguments
    ///
    /// `tag` splits the arguments on commas; any other type treats them as a
    /// URL pattern.
    pub fn parse(kind: &str, arguments: &str) -> Result<Self> {
        if kind.eq_ignore_ascii_case("tag") {
            let tags: Vec<String> = arguments
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect();

            if tags.is_empty() {
                return Err(VarnishError::InvalidCommand(
                    "no tags given to purge".to_string(),
                ));
            }
            Ok(ManualPurge::Tags(tags))
        } else {
            let pattern = arguments.trim();
            if pattern.is_empty() {
                return Err(VarnishError::InvalidCommand(
                    "no request pattern given to purge".to_string(),
                ));
            }
            Ok(ManualPurge::Request(pattern.to_string()))
        }
    }

    fn into_request(self) -> PurgeRequest {
        match self {
            ManualPurge::Tags(tags) => PurgeRequest::tags(tags),
            ManualPurge::Request(pattern) => PurgeRequest::url(pattern, false),
        }
    }
}

/// The ban that was sent and what every terminal said about it
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationReport {
    pub kind: &'static str,
    pub command: String,
    #[serde(flatten)]
    pub report: FanoutReport,
}

impl InvalidationReport {
    pub fn success(&self) -> bool {
        self.report.all_succeeded()
    }
}

/// Turns invalidation requests into bans on every control terminal
pub struct Invalidator {
    coordinator: Arc<FanoutCoordinator>,
    builder: PurgeCommandBuilder,
    host_scoped: bool,
    logging: bool,
    metrics: Option<Arc<PurgeMetrics>>,
}

impl Invalidator {
    pub fn new(coordinator: Arc<FanoutCoordinator>, config: &VarnishConfig) -> Result<Self> {
        Ok(Invalidator {
            coordinator,
            builder: PurgeCommandBuilder::from_settings(&config.purge)?,
            host_scoped: !config.purge.all_hosts,
            logging: config.general.logging,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<PurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn coordinator(&self) -> &Arc<FanoutCoordinator> {
        &self.coordinator
    }

    /// Ban every object tagged with any of `tags`
    pub async fn invalidate_tags(&self, tags: &[String], actor: &str) -> Result<InvalidationReport> {
        self.purge(PurgeRequest::tags(tags.iter().cloned()), actor).await
    }

    /// Ban every object whose URL matches `pattern`
    pub async fn purge_request(&self, pattern: &str, exact: bool, actor: &str) -> Result<InvalidationReport> {
        self.purge(PurgeRequest::url(pattern, exact), actor).await
    }

    /// Run an operator-entered purge
    pub async fn manual(&self, purge: ManualPurge, actor: &str) -> Result<InvalidationReport> {
        self.purge(purge.into_request(), actor).await
    }

    /// Build the ban for a request and run it on every terminal
    pub async fn purge(&self, request: PurgeRequest, actor: &str) -> Result<InvalidationReport> {
        let request = request.host_scoped(self.host_scoped);
        let kind = request.kind();
        let command = self.builder.build(&request)?;

        if self.logging {
            info!("u={} purge {}", actor, command);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_request(kind);
        }

        let start = Instant::now();
        let report = self.coordinator.run(std::slice::from_ref(&command)).await;

        let invalidation = InvalidationReport {
            kind,
            command,
            report,
        };

        if !invalidation.success() {
            warn!("Ban {} did not succeed on every control terminal", invalidation.command);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_duration(kind, start.elapsed().as_secs_f64());
            metrics.record_result(kind, invalidation.success());
            for backend in invalidation.report.iter() {
                metrics.record_backend_result(&backend.terminal, backend.outcome.all_succeeded());
            }
        }

        Ok(invalidation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_purge() {
        let purge = ManualPurge::parse("tag", " node:1 , node_list,, user:7 ").unwrap();
        assert_eq!(
            purge,
            ManualPurge::Tags(vec![
                "node:1".to_string(),
                "node_list".to_string(),
                "user:7".to_string()
            ])
        );
    }

    #[test]
    fn test_parse_request_purge() {
        let purge = ManualPurge::parse("request", "^/node/[0-9]+$").unwrap();
        assert_eq!(purge, ManualPurge::Request("^/node/[0-9]+$".to_string()));

        // Unknown kinds are treated as request patterns
        let purge = ManualPurge::parse("url", "/about").unwrap();
        assert_eq!(purge, ManualPurge::Request("/about".to_string()));
    }

    #[test]
    fn test_parse_empty_arguments() {
        assert!(ManualPurge::parse("tag", " , ").is_err());
        assert!(ManualPurge::parse("request", "   ").is_err());
    }

    #[test]
    fn test_manual_request_is_regex() {
        let request = ManualPurge::Request("/node".to_string()).into_request();
        assert_eq!(request, PurgeRequest::url("/node", false));
    }

    #[tokio::test]
    async fn test_empty_tag_list_is_rejected_before_fanout() {
        let config = VarnishConfig::default();
        let coordinator = Arc::new(FanoutCoordinator::from_config(&config));
        let invalidator = Invalidator::new(coordinator, &config).unwrap();

        let err = invalidator.invalidate_tags(&[], "1").await.unwrap_err();
        assert!(matches!(err, VarnishError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_unreachable_terminal_reports_failure() {
        let mut config = VarnishConfig::default();
        config.connection.control_terminal = "not-a-terminal".to_string();
        let coordinator = Arc::new(FanoutCoordinator::from_config(&config));
        let invalidator = Invalidator::new(coordinator, &config).unwrap();

        let report = invalidator
            .purge_request("/node/1", true, "admin")
            .await
            .unwrap();
        assert_eq!(report.kind, "url");
        assert_eq!(report.command, r#"ban req.url == "/node/1""#);
        assert!(!report.success());
        assert!(!report.report.get("not-a-terminal").unwrap().is_reachable());
    }
}
