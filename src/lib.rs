//! Advanced Varnish integration
//!
//! Speaks the Varnish control protocol to one or more cache instances to
//! issue bans, and decides per response whether it may be cached, under
//! which cache partition ("bin") and with which cache metadata headers.
//!
//! # Overview
//!
//! Invalidation runs independently of request handling:
//!
//! - [`PurgeCommandBuilder`] turns cache tags or URL patterns into `ban`
//!   commands.
//! - [`FanoutCoordinator`] runs a command batch on every configured control
//!   terminal, one task and one connection per terminal, and reports each
//!   terminal's outcome separately.
//! - [`Invalidator`] ties the two together for tag invalidation events and
//!   operator-entered purges.
//!
//! Per response, [`CacheabilityDecider`] applies the site configuration and
//! the requester's [`Identity`], consults the [`CachePartitionPolicy`] and
//! writes the headers the VCL acts on (`X-Tag`, `X-Grace`, `X-TTL`, ...).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use adv_varnish::{FanoutCoordinator, Invalidator, VarnishConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VarnishConfig::from_file("adv_varnish.yaml")?;
//! let coordinator = Arc::new(FanoutCoordinator::from_config(&config));
//! let invalidator = Invalidator::new(coordinator, &config)?;
//!
//! let report = invalidator
//!     .invalidate_tags(&["node:12".to_string()], "1")
//!     .await?;
//! for backend in report.report.iter() {
//!     println!("{}: {}", backend.terminal, backend.outcome.all_succeeded());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! general:
//!   enabled: true
//!   grace: 60
//!   page_cache_maximum_age: 3600
//! connection:
//!   control_terminal: "10.0.0.1:6082 10.0.0.2:6082"
//!   control_key: "secret"
//!   socket_timeout: 100
//! purge:
//!   all_hosts: false
//!   base_url: "https://www.example.com"
//! ```
//!
//! See [`VarnishConfig`] for every option.

pub mod admin_server;
pub mod auth;
pub mod cacheability;
pub mod config;
pub mod connection;
pub mod error;
pub mod esi;
pub mod fanout;
pub mod health_check;
pub mod invalidator;
pub mod partition;
pub mod protocol;
pub mod purge;
pub mod purge_handler; // HTTP PURGE method handler
pub mod purge_metrics; // Prometheus metrics for purge operations

// Re-export commonly used types
pub use admin_server::AdminServer;
pub use auth::AuthNegotiator;
pub use cacheability::{CacheDecision, CacheabilityDecider, ExclusionRule, ResponseDirective};
pub use config::{ConfigChanges, VarnishConfig};
pub use connection::{BackendEndpoint, CommandResult, ControlConnection, SocketTimeouts};
pub use error::{Result, VarnishError};
pub use esi::{Fragment, FragmentHandler, FragmentRegistry};
pub use fanout::{BackendOutcome, BackendStatus, FanoutCoordinator, FanoutReport, StatusSnapshot};
pub use health_check::{HealthCheckService, HealthStatus};
pub use invalidator::{InvalidationReport, Invalidator, ManualPurge};
pub use partition::{BinAssignment, Bucket, CachePartitionPolicy, Identity, RequestContext};
pub use protocol::{Frame, FrameCodec};
pub use purge::{PurgeCommandBuilder, PurgeRequest, PurgeTarget};
pub use purge_handler::PurgeHandler;
pub use purge_metrics::PurgeMetrics;
