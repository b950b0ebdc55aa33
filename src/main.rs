use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Notify, watch};
use tracing::{error, info};

use code_relay::channels::TelegramDispatcher;
use code_relay::config::Config;
use code_relay::health::{self, HealthState};
use code_relay::keepalive::spawn_keepalive;
use code_relay::mailbox::ImapConnector;
use code_relay::metrics::CycleMetrics;
use code_relay::pipeline::{CodeExtractor, FilterPolicy};
use code_relay::scheduler::{Scheduler, spawn_scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export EMAIL_ADDRESS=... EMAIL_PASSWORD=... BOT_TOKEN=... CHAT_ID=...");
        std::process::exit(1);
    });

    eprintln!("📬 Code Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {} @ {}:{}", config.mailbox.username, config.mailbox.host, config.mailbox.port);
    eprintln!("   Folder: {}", config.mailbox.folder);
    eprintln!("   Destinations: {}", config.dispatch.destinations.len());
    eprintln!("   Poll every {}s", config.scheduler.poll_interval.as_secs());
    match config.health_port {
        Some(port) => eprintln!("   Health: http://0.0.0.0:{port}/health"),
        None => eprintln!("   Health: disabled (PORT not set)"),
    }
    eprintln!();

    let metrics = Arc::new(CycleMetrics::new());
    let trigger = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = build_scheduler(&config, Arc::clone(&metrics)).context("building scheduler")?;
    let scheduler_handle = spawn_scheduler(scheduler, shutdown_rx.clone(), Arc::clone(&trigger));

    // ── Health endpoint ──────────────────────────────────────────────────
    if let Some(port) = config.health_port {
        let state = HealthState {
            metrics: Arc::clone(&metrics),
            trigger: Arc::clone(&trigger),
        };
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, state, rx).await {
                error!(port, error = %e, "Health endpoint failed");
            }
        });
    }

    // ── Keepalive ────────────────────────────────────────────────────────
    if let Some(keepalive) = config.keepalive.clone() {
        spawn_keepalive(keepalive, shutdown_rx.clone());
    }

    wait_for_signal().await;
    info!("Shutdown requested, finishing current cycle");
    shutdown_tx.send(true).ok();

    scheduler_handle.await.context("scheduler task panicked")?;
    info!("Stopped");
    Ok(())
}

fn build_scheduler(config: &Config, metrics: Arc<CycleMetrics>) -> code_relay::error::Result<Scheduler> {
    let dispatcher = TelegramDispatcher::new(config.dispatch.clone())?;
    Ok(Scheduler::new(
        Arc::new(ImapConnector::new(config.mailbox.clone())),
        CodeExtractor::default_rules(),
        FilterPolicy::from_config(&config.filter),
        Arc::new(dispatcher),
        metrics,
        config.scheduler.clone(),
    ))
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
