//! adv-varnish command line
//!
//! Loads the configuration, sets up logging and runs one command against the
//! configured control terminals, or serves the admin HTTP endpoint.

use adv_varnish::{
    AdminServer, FanoutCoordinator, FragmentRegistry, HealthCheckService, HealthStatus, InvalidationReport,
    Invalidator, ManualPurge, PurgeHandler, PurgeMetrics, VarnishConfig,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "adv_varnish.yaml";

/// Actor recorded in the ban log for command line purges
const CLI_ACTOR: &str = "cli";

/// Varnish ban fan-out and admin endpoint
#[derive(Parser)]
#[command(name = "adv-varnish")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Query every control terminal
    Status,

    /// Ban objects carrying any of the tags
    BanTags {
        /// Comma-separated tag list
        tags: String,
    },

    /// Ban objects whose URL matches the pattern
    BanUrl {
        /// URL regex, or the exact URL with --exact
        pattern: String,

        /// Match the URL exactly instead of as a regex
        #[arg(long)]
        exact: bool,
    },

    /// Run the admin HTTP endpoint
    Serve,
}

/// Main entry point
///
/// # Usage
/// ```bash
/// adv-varnish status
/// adv-varnish --config /etc/adv_varnish.yaml ban-tags node:12,node_list
/// adv-varnish ban-url '^/sites/default/files/'
/// adv-varnish ban-url --exact /node/1
/// adv-varnish serve
/// ```
#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(false);
            error!("Failed to load configuration from {}: {:#}", cli.config, e);
            error!("Please ensure the configuration file exists and is valid");
            std::process::exit(1);
        }
    };

    init_logging(config.general.debug);
    info!("Loaded configuration from {}", cli.config);
    info!("  - Control terminals: {:?}", config.connection.terminals());
    info!("  - Socket timeout: {:?}", config.connection.socket_timeout());
    info!("  - Purge all hosts: {}", config.purge.all_hosts);

    match run(cli.command, config).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();
}

fn load_config(path: &str) -> anyhow::Result<VarnishConfig> {
    if !Path::new(path).exists() && path == DEFAULT_CONFIG_PATH {
        // No config at the default location: run on defaults
        let config = VarnishConfig::default();
        config.validate()?;
        return Ok(config);
    }
    Ok(VarnishConfig::from_file(path)?)
}

/// Returns whether every control terminal succeeded
async fn run(command: Command, config: VarnishConfig) -> anyhow::Result<bool> {
    match command {
        Command::Status => {
            let coordinator = FanoutCoordinator::from_config(&config);
            let status = coordinator.status().await;
            for (terminal, up) in &status.backends {
                println!("{}\t{}", terminal, if *up { "up" } else { "down" });
            }
            Ok(HealthStatus::from_backends(&status) == HealthStatus::Healthy)
        }
        Command::BanTags { tags } => {
            let invalidator = invalidator(&config, None)?;
            let purge = ManualPurge::parse("tag", &tags)?;
            print_report(&invalidator.manual(purge, CLI_ACTOR).await?)
        }
        Command::BanUrl { pattern, exact } => {
            let invalidator = invalidator(&config, None)?;
            print_report(&invalidator.purge_request(&pattern, exact, CLI_ACTOR).await?)
        }
        Command::Serve => {
            serve(config).await?;
            Ok(true)
        }
    }
}

fn invalidator(config: &VarnishConfig, metrics: Option<Arc<PurgeMetrics>>) -> anyhow::Result<Invalidator> {
    let mut coordinator = FanoutCoordinator::from_config(config);
    if let Some(metrics) = &metrics {
        coordinator = coordinator.with_metrics(metrics.clone());
    }

    let mut invalidator = Invalidator::new(Arc::new(coordinator), config)?;
    if let Some(metrics) = metrics {
        invalidator = invalidator.with_metrics(metrics);
    }
    Ok(invalidator)
}

fn print_report(report: &InvalidationReport) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if !report.success() {
        warn!("Ban did not succeed on every control terminal");
    }
    Ok(report.success())
}

async fn serve(config: VarnishConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .admin
        .address
        .parse()
        .with_context(|| format!("invalid admin address {}", config.admin.address))?;

    let metrics = if config.admin.enable_metrics {
        Some(Arc::new(PurgeMetrics::new().context("failed to register metrics")?))
    } else {
        None
    };

    let invalidator = Arc::new(invalidator(&config, metrics.clone())?);
    let coordinator = invalidator.coordinator().clone();

    let mut purge = match &config.admin.auth_token {
        Some(token) => PurgeHandler::with_auth(invalidator, token.clone()),
        None => {
            warn!("admin.auth_token is not set; PURGE requests are unauthenticated");
            PurgeHandler::new(invalidator)
        }
    };
    if let Some(metrics) = metrics {
        purge = purge.with_metrics(metrics);
    }

    let server = Arc::new(
        AdminServer::new(HealthCheckService::new(coordinator), purge)
            .with_fragments(FragmentRegistry::new(), config.general.esi_cache_maximum_age)
            .with_metrics_enabled(config.admin.enable_metrics),
    );

    tokio::select! {
        result = server.serve(addr) => result.context("admin server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
