//! ingressd - nftables-based ingress manager
//!
//! Composition root: wires the configuration store, kernel handle,
//! reconciler, health prober, and REST API together, and owns the
//! startup/shutdown ordering.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use ingressd::adapters::inbound::ApiServer;
use ingressd::adapters::outbound::{NftKernelHandle, SqliteConfigStore};
use ingressd::application::{KernelApplier, Reconciler};
use ingressd::config::{load_config, Cli};
use ingressd::domain::ports::{ConfigStore, KernelHandle};
use ingressd::domain::services::RuleCompiler;
use ingressd::infrastructure::{
    shutdown_signal, HealthProber, ProberConfig, ShutdownController,
};

/// Upper bound on draining background tasks after the stop signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    let log_level = match cfg.log_level.as_str() {
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    tracing::info!(
        "starting ingressd db={} api={} table={} chain={}",
        cfg.db_path,
        cfg.api_listen,
        cfg.nft_table,
        cfg.nft_chain
    );

    // Failing to establish the store or the kernel handle is fatal.
    let store: Arc<dyn ConfigStore> = Arc::new(SqliteConfigStore::open(&cfg.db_path)?);
    let kernel: Arc<dyn KernelHandle> =
        Arc::new(NftKernelHandle::new(&cfg.nft_table, &cfg.nft_chain));
    kernel.ensure().await?;

    let applier = KernelApplier::new(Arc::clone(&kernel), cfg.update_interval);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        RuleCompiler::new(),
        applier,
    ));

    // Install the current model before the periodic tasks start.
    if let Err(e) = reconciler.tick_once().await {
        tracing::error!("initial reconciliation failed: {}", e);
    }

    let shutdown = ShutdownController::new();

    let prober = HealthProber::new(
        Arc::clone(&store),
        ProberConfig {
            interval: cfg.health_interval,
            timeout: cfg.health_timeout,
        },
    );
    let prober_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { prober.run(shutdown).await })
    };

    let reconciler_task = {
        let shutdown = shutdown.clone();
        let reconciler = Arc::clone(&reconciler);
        let interval = cfg.update_interval;
        tokio::spawn(async move { reconciler.run(interval, shutdown).await })
    };

    let api = ApiServer::new(cfg.api_listen.clone(), Arc::clone(&store));
    let api_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api.run(shutdown).await {
                tracing::error!("API server error: {:?}", e);
            }
        })
    };

    shutdown_signal(shutdown.clone()).await;

    // Reverse of startup: REST drains, the ticker cancels, the prober
    // finishes its in-flight dials, then the kernel state is removed.
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = api_task.await;
        let _ = reconciler_task.await;
        let _ = prober_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("graceful shutdown timed out, dropping remaining tasks");
    }

    if let Err(e) = kernel.teardown().await {
        tracing::error!("failed to clean up kernel state: {}", e);
    }

    tracing::info!("shutdown complete");
    Ok(())
}
