//! edge-connector: an edge-deployed event-dispatch agent.
//!
//! The agent polls an upstream control plane for deliveries, claims each one
//! so no other agent runs it, executes the matching configured automation
//! (a local or git-sourced script, or an outbound HTTP call) and reports the
//! outcome back. The action catalog is pushed upstream once at startup so
//! callable actions appear as buttons there.
//!
//! Pipeline: upstream -> poller -> (claim) -> worker pool -> dispatcher ->
//! {script runner | http executor} -> reporter -> upstream.

mod config;
mod dispatch;
mod errors;
mod executors;
mod gitsource;
mod metrics;
mod pool;
mod poller;
mod protocol;
mod registry;
mod reporter;
mod telemetry;
mod template;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use crate::config::ScriptSource;
use crate::dispatch::Dispatcher;
use crate::executors::http::HttpActionExecutor;
use crate::executors::script::ScriptRunner;
use crate::executors::ActionExecutor;
use crate::gitsource::GitSourceManager;
use crate::metrics::{PrometheusRecorder, RecorderHandle};
use crate::pool::WorkerPool;
use crate::poller::Poller;
use crate::reporter::Reporter;
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use crate::upstream::UpstreamClient;

#[derive(Parser)]
#[command(name = "edge-connector")]
#[command(about = "Edge event-dispatch agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted.
    Run {
        /// Path to the JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Base directory for git-sourced script checkouts.
        #[arg(long, default_value = "/var/lib/edge-connector/repos")]
        git_dir: PathBuf,

        /// Record metrics into an in-process Prometheus registry.
        #[arg(long, default_value = "false")]
        metrics: bool,

        /// Export traces to an OTLP collector.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP collector endpoint; defaults to OTEL_EXPORTER_OTLP_ENDPOINT
        /// or http://localhost:4317.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Only errors on stderr.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Debug-level logging.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },

    /// Load and validate a configuration file, then exit.
    Check {
        /// Path to the JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            std::process::exit(check(&config));
        }
        Commands::Run {
            config,
            git_dir,
            metrics,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint);
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            } else {
                telemetry_config.otlp_endpoint = None;
            }
            if let Err(err) = init_telemetry(telemetry_config) {
                eprintln!("warning: failed to initialize telemetry: {err}");
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            if let Err(err) = run(&config, &git_dir, metrics).await {
                error!(error = %err, "agent failed");
                shutdown_telemetry();
                std::process::exit(1);
            }
            shutdown_telemetry();
        }
    }
}

/// Validate a configuration file and print every finding.
fn check(path: &PathBuf) -> i32 {
    let loaded = match config::load(path) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("error: {err:#}");
            return 1;
        }
    };
    let findings = loaded.validate();
    if findings.is_empty() {
        println!(
            "configuration OK: {} action(s), {} worker(s), queue {}",
            loaded.actions.len(),
            loaded.pool.min_workers,
            loaded.pool.queue_size
        );
        0
    } else {
        for finding in &findings {
            eprintln!("error: {finding}");
        }
        eprintln!("{} finding(s)", findings.len());
        1
    }
}

async fn run(config_path: &PathBuf, git_dir: &PathBuf, metrics_enabled: bool) -> anyhow::Result<()> {
    let session_id = uuid::Uuid::new_v4();
    info!(
        session = %session_id,
        version = env!("CARGO_PKG_VERSION"),
        "edge-connector starting"
    );

    let agent_config = config::load(config_path)?;
    let findings = agent_config.validate();
    if !findings.is_empty() {
        for finding in &findings {
            error!("{finding}");
        }
        anyhow::bail!("configuration invalid: {} finding(s)", findings.len());
    }

    let prometheus = if metrics_enabled {
        Some(Arc::new(
            PrometheusRecorder::new().context("failed to build metrics registry")?,
        ))
    } else {
        None
    };
    let recorder: RecorderHandle = match &prometheus {
        Some(prom) => prom.clone(),
        None => metrics::noop(),
    };

    let upstream = Arc::new(
        UpstreamClient::new(&agent_config.upstream, recorder.clone())
            .context("failed to build upstream client")?,
    );
    info!(
        base_url = %agent_config.upstream.base_url,
        token = %upstream.redacted_token(),
        "upstream configured"
    );

    let callable = agent_config
        .actions
        .iter()
        .filter(|a| a.is_callable())
        .count();
    info!(
        actions = agent_config.actions.len(),
        callable,
        automatic = agent_config.actions.len() - callable,
        "action catalog loaded"
    );

    let cancel = CancellationToken::new();

    // Git checkouts must exist before anything can execute out of them.
    let git = Arc::new(GitSourceManager::new(git_dir.clone(), recorder.clone()));
    for action in &agent_config.actions {
        if action.source == ScriptSource::Git {
            if let Some(options) = &action.git_options {
                git.download(options)
                    .await
                    .with_context(|| format!("failed to download repo for action '{}'", action.id))?;
            }
        }
    }
    let refresher = tokio::spawn(git.clone().run_refresher(cancel.clone()));

    // Catalog sync strictly precedes the first poll.
    if let Err(err) =
        registry::sync_catalog(&upstream, &agent_config.actions, &agent_config.security).await
    {
        warn!(error = %err, "catalog sync failed; continuing without registration");
    }

    let reporter = Reporter::new(upstream.clone());
    let executors: Vec<Box<dyn ActionExecutor>> = vec![
        Box::new(ScriptRunner::new(git.clone(), agent_config.security.clone())),
        Box::new(HttpActionExecutor::new(recorder.clone())),
    ];
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(agent_config.actions.clone()),
        executors,
        reporter,
        recorder.clone(),
    ));

    let pool = WorkerPool::start(&agent_config.pool, dispatcher, cancel.clone(), recorder.clone());
    let poller = Poller::new(
        upstream,
        pool.sink(),
        agent_config.poller.clone(),
        recorder.clone(),
    );
    let poller_task = tokio::spawn(poller.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; draining");
    cancel.cancel();

    if let Err(err) = poller_task.await {
        warn!(error = %err, "poller task ended abnormally");
    }
    pool.shutdown().await;
    if let Err(err) = refresher.await {
        warn!(error = %err, "git refresher ended abnormally");
    }

    if let Some(prom) = prometheus {
        debug!("final metrics snapshot:\n{}", prom.render_text());
    }
    info!("shutdown complete");
    Ok(())
}
