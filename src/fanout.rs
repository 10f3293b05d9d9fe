//! Runs command batches against every configured control terminal
//!
//! Each terminal gets its own task and its own connection. A terminal that
//! cannot be parsed, reached or authenticated never affects the others, and
//! commands on one terminal always run in the order given.

use crate::config::{ConnectionSettings, VarnishConfig};
use crate::connection::{BackendEndpoint, CommandResult, ControlConnection, SocketTimeouts};
use crate::error::VarnishError;
use crate::purge_metrics::PurgeMetrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info};

/// Command used to probe terminal health
pub const STATUS_COMMAND: &str = "status";

/// Result of one command, tagged with the command text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    #[serde(flatten)]
    pub result: CommandResult,
}

/// What happened on one terminal during a fan-out call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendOutcome {
    /// The terminal entry was malformed, or connecting failed
    Unreachable { reason: String },
    /// The terminal answered; one result per command, in order
    Completed { results: Vec<CommandOutcome> },
}

impl BackendOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, BackendOutcome::Completed { .. })
    }

    /// Result for a specific command, if it ran
    pub fn result(&self, command: &str) -> Option<&CommandResult> {
        match self {
            BackendOutcome::Completed { results } => results
                .iter()
                .find(|outcome| outcome.command == command)
                .map(|outcome| &outcome.result),
            BackendOutcome::Unreachable { .. } => None,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        match self {
            BackendOutcome::Completed { results } => results.iter().all(|o| o.result.is_success()),
            BackendOutcome::Unreachable { .. } => false,
        }
    }
}

/// Outcome for one configured terminal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReport {
    /// The terminal entry exactly as configured
    pub terminal: String,
    #[serde(flatten)]
    pub outcome: BackendOutcome,
}

/// Per-terminal outcomes of one fan-out call, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutReport {
    pub backends: Vec<BackendReport>,
}

impl FanoutReport {
    pub fn get(&self, terminal: &str) -> Option<&BackendOutcome> {
        self.backends
            .iter()
            .find(|report| report.terminal == terminal)
            .map(|report| &report.outcome)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// True when at least one terminal exists and every terminal ran every command successfully
    pub fn all_succeeded(&self) -> bool {
        !self.backends.is_empty() && self.backends.iter().all(|r| r.outcome.all_succeeded())
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendReport> {
        self.backends.iter()
    }
}

/// Up/down state per terminal entry, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub backends: Vec<(String, bool)>,
}

impl BackendStatus {
    fn from_report(report: &FanoutReport) -> Self {
        let backends = report
            .iter()
            .map(|r| {
                let up = r
                    .outcome
                    .result(STATUS_COMMAND)
                    .map(CommandResult::is_success)
                    .unwrap_or(false);
                (r.terminal.clone(), up)
            })
            .collect();
        BackendStatus { backends }
    }

    pub fn is_up(&self, terminal: &str) -> Option<bool> {
        self.backends
            .iter()
            .find(|(t, _)| t == terminal)
            .map(|(_, up)| *up)
    }

    pub fn up_count(&self) -> usize {
        self.backends.iter().filter(|(_, up)| *up).count()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Cached terminal status, computed at most once per lifetime
///
/// The lock is held across the computation so concurrent callers wait for
/// the first one instead of opening their own sockets.
pub struct StatusSnapshot {
    lifetime: Option<Duration>,
    cached: Mutex<Option<(Instant, BackendStatus)>>,
}

impl StatusSnapshot {
    /// `None` keeps the first snapshot until `reset`
    pub fn new(lifetime: Option<Duration>) -> Self {
        StatusSnapshot {
            lifetime,
            cached: Mutex::new(None),
        }
    }

    /// Return the cached status, computing it first if absent or expired
    pub async fn get_or_compute<F, Fut>(&self, compute: F) -> BackendStatus
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendStatus>,
    {
        let mut cached = self.cached.lock().await;

        if let Some((taken_at, status)) = cached.as_ref() {
            let fresh = match self.lifetime {
                Some(lifetime) => taken_at.elapsed() < lifetime,
                None => true,
            };
            if fresh {
                return status.clone();
            }
        }

        let status = compute().await;
        *cached = Some((Instant::now(), status.clone()));
        status
    }

    pub async fn reset(&self) {
        *self.cached.lock().await = None;
    }

    pub async fn is_cached(&self) -> bool {
        self.cached.lock().await.is_some()
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Fans command batches out to every control terminal
pub struct FanoutCoordinator {
    terminals: Vec<String>,
    secret: Arc<str>,
    timeouts: SocketTimeouts,
    snapshot: StatusSnapshot,
    metrics: Option<Arc<PurgeMetrics>>,
}

impl FanoutCoordinator {
    /// Create a coordinator for the configured terminals
    pub fn new(settings: &ConnectionSettings) -> Self {
        FanoutCoordinator {
            terminals: settings.terminals(),
            secret: Arc::from(settings.control_key.as_str()),
            timeouts: SocketTimeouts::uniform(settings.socket_timeout()),
            snapshot: StatusSnapshot::default(),
            metrics: None,
        }
    }

    pub fn from_config(config: &VarnishConfig) -> Self {
        Self::new(&config.connection).with_snapshot_lifetime(config.status.snapshot_lifetime())
    }

    pub fn with_snapshot_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.snapshot = StatusSnapshot::new(lifetime);
        self
    }

    pub fn with_timeouts(mut self, timeouts: SocketTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enable Prometheus metrics
    pub fn with_metrics(mut self, metrics: Arc<PurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn terminals(&self) -> &[String] {
        &self.terminals
    }

    /// Run commands against every configured terminal
    pub async fn run(&self, commands: &[String]) -> FanoutReport {
        self.run_on(commands, &self.terminals).await
    }

    /// Run commands against the given terminal entries
    pub async fn run_on(&self, commands: &[String], terminals: &[String]) -> FanoutReport {
        let commands: Arc<[String]> = Arc::from(commands);
        let mut tasks = Vec::with_capacity(terminals.len());

        for terminal in terminals {
            let label = terminal.clone();
            let terminal = terminal.clone();
            let commands = commands.clone();
            let secret = self.secret.clone();
            let timeouts = self.timeouts;

            let task = tokio::spawn(async move {
                run_backend(&terminal, &commands, timeouts, &secret).await
            });
            tasks.push((label, task));
        }

        let mut backends = Vec::with_capacity(tasks.len());
        for (terminal, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Control task for {} failed: {}", terminal, e);
                    BackendOutcome::Unreachable {
                        reason: format!("task failed: {}", e),
                    }
                }
            };

            if let Some(metrics) = &self.metrics {
                if let BackendOutcome::Unreachable { .. } = outcome {
                    metrics.record_unreachable(&terminal);
                }
            }

            backends.push(BackendReport { terminal, outcome });
        }

        FanoutReport { backends }
    }

    /// Up/down state of each terminal, cached per the snapshot lifetime
    pub async fn status(&self) -> BackendStatus {
        self.snapshot
            .get_or_compute(|| async move {
                let report = self.run(&[STATUS_COMMAND.to_string()]).await;
                let status = BackendStatus::from_report(&report);
                info!(
                    "Control terminal status: {} of {} up",
                    status.up_count(),
                    status.len()
                );
                status
            })
            .await
    }

    /// Forget the cached status so the next `status` call probes again
    pub async fn reset_status(&self) {
        self.snapshot.reset().await;
    }
}

/// Open one connection, run every command in order, close
async fn run_backend(
    terminal: &str,
    commands: &[String],
    timeouts: SocketTimeouts,
    secret: &str,
) -> BackendOutcome {
    let endpoint: BackendEndpoint = match terminal.parse() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Skipping control terminal: {}", e);
            return BackendOutcome::Unreachable {
                reason: e.to_string(),
            };
        }
    };

    let mut connection = match ControlConnection::open(&endpoint, timeouts, secret).await {
        Ok(connection) => connection,
        Err(e) if e.is_unreachable() => {
            error!("Unable to connect to server socket {}: {}", endpoint, e);
            return BackendOutcome::Unreachable {
                reason: e.to_string(),
            };
        }
        Err(e) => return refused(commands, &e),
    };

    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let result = connection.execute(command).await;
        results.push(CommandOutcome {
            command: command.clone(),
            result,
        });
    }
    connection.close().await;

    BackendOutcome::Completed { results }
}

/// Authentication failed: every queued command carries the failure, none is sent
fn refused(commands: &[String], err: &VarnishError) -> BackendOutcome {
    let result = CommandResult::from_error(err);
    BackendOutcome::Completed {
        results: commands
            .iter()
            .map(|command| CommandOutcome {
                command: command.clone(),
                result: result.clone(),
            })
            .collect(),
    }
}
