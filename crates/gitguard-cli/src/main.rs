use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use gitguard::{Config, Pipeline, drain, run_scheduler, run_workers};
use gitguard_server::{ServerState, run_api, run_ingress};

#[derive(Parser, Debug)]
#[command(name = "gitguard", version)]
#[command(about = "Autonomous repository steward: webhook governance, risk receipts, org-brain portal")]
struct Cli {
    /// Path to gitguard.toml (optional; defaults + env otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run everything: ingress gateway, graph API, worker pool, scheduler.
    Serve,
    /// Run only the workflow worker pool and the maintenance scheduler.
    Worker,
    /// Run one maintenance pass and print the report.
    Maintain,
    /// Process every currently deliverable stream message, then exit.
    Drain,
    /// Print stream messages from a sequence onward.
    Replay {
        /// First sequence to print.
        #[arg(long, default_value_t = 1)]
        from: u64,
        /// Optional subject filter (exact, or prefix ending in '>').
        #[arg(long)]
        subject: Option<String>,
    },
    /// Validate configuration and the policy bundle, then exit.
    CheckConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("configuration error")?;

    match cli.cmd {
        Commands::Serve => serve(config, true),
        Commands::Worker => serve(config, false),
        Commands::Maintain => {
            let pipeline = Pipeline::new(config)?;
            let report = pipeline.run_maintenance()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Drain => {
            let pipeline = Pipeline::new(config)?;
            let consumer = pipeline.consumer()?;
            let processed = drain(&pipeline, &consumer)?;
            println!("processed {} message(s)", processed);
            Ok(())
        }
        Commands::Replay { from, subject } => {
            let pipeline = Pipeline::new(config)?;
            for message in pipeline.stream.replay(from, subject.as_deref()) {
                println!("{}", serde_json::to_string(&message)?);
            }
            Ok(())
        }
        Commands::CheckConfig => {
            let pipeline = Pipeline::new(config)?;
            let bundle = pipeline.policy.snapshot();
            println!(
                "configuration ok; policy bundle {} with {} rule(s): {}",
                bundle.version,
                bundle.rules.len(),
                bundle.rule_names().join(", ")
            );
            Ok(())
        }
    }
}

/// Run the long-lived services. `with_http` adds the ingress gateway and
/// graph API on top of the worker pool and scheduler.
fn serve(config: Config, with_http: bool) -> Result<()> {
    let workers = config.effective_workers();
    let maint_interval = config.maint_interval;
    let ingress_bind = config.ingress.bind.clone();
    let api_bind = config.api.bind.clone();
    let graph_api_enabled = config.flags.graph_api_enabled;

    let pipeline = Arc::new(Pipeline::new(config)?);
    let shutdown = Arc::new(AtomicBool::new(false));

    let worker_handles = run_workers(Arc::clone(&pipeline), workers, Arc::clone(&shutdown))?;
    let scheduler_handle = run_scheduler(Arc::clone(&pipeline), maint_interval, Arc::clone(&shutdown));
    tracing::info!(workers, "worker pool and scheduler started");

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        spawn_reload_listener(Arc::clone(&pipeline));
        if with_http {
            let state = Arc::new(ServerState::new(Arc::clone(&pipeline))?);
            let ingress = run_ingress(Arc::clone(&state), &ingress_bind);
            if graph_api_enabled {
                let api = run_api(Arc::clone(&state), &api_bind);
                tokio::select! {
                    result = ingress => result?,
                    result = api => result?,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutdown signal received");
                    }
                }
            } else {
                tokio::select! {
                    result = ingress => result?,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutdown signal received");
                    }
                }
            }
        } else {
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for shutdown signal")?;
            tracing::info!("shutdown signal received");
        }
        Ok::<(), anyhow::Error>(())
    })?;

    shutdown.store(true, Ordering::Relaxed);
    for handle in worker_handles {
        let _ = handle.join();
    }
    let _ = scheduler_handle.join();
    Ok(())
}

/// SIGHUP reloads the policy bundle atomically; in-flight evaluations keep
/// their snapshot, and a bad bundle leaves the old one serving.
#[cfg(unix)]
fn spawn_reload_listener(pipeline: Arc<Pipeline>) {
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            tracing::warn!("failed to install SIGHUP handler; policy reload disabled");
            return;
        };
        while hangup.recv().await.is_some() {
            match pipeline.policy.reload() {
                Ok(()) => {
                    tracing::info!(version = %pipeline.policy.version(), "policy bundle reloaded")
                }
                Err(err) => tracing::error!(error = %err, "policy reload failed; keeping previous bundle"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_pipeline: Arc<Pipeline>) {}
