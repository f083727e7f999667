//! gantryd - the container executor daemon
//!
//! Boot order: logging, configuration, backend, reconciliation, registry
//! and engine assembly, signal wiring, control plane. Reconciliation
//! failure is fatal; a clean drain or shutdown exits zero.

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, LogFormat};
use gantry_api::{build_router, ApiServer, ApiState};
use gantry_backend::{Backend, InMemoryBackend};
use gantry_core::ExecutorConfig;
use gantry_engine::{
    log_streamer, reconcile, start_pruner, Capacity, DispatcherConfig, DownloadCache,
    DrainController, Executor, Registry, RunDispatcher, Transformer,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.merged_config().context("invalid configuration")?;
    run(config).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run(config: ExecutorConfig) -> anyhow::Result<()> {
    let backend = create_backend(&config)?;

    // A new incarnation never inherits containers from a previous one
    let destroyed = reconcile(backend.as_ref(), &config.container_owner_name)
        .await
        .context("reconciliation failed")?;
    info!(destroyed, owner = %config.container_owner_name, "Reconciliation complete");

    let backend_capacity = backend
        .capacity()
        .await
        .context("failed to read backend capacity")?;
    let total = Capacity {
        memory_mb: backend_capacity.memory_in_bytes / (1024 * 1024),
        disk_mb: backend_capacity.disk_in_bytes / (1024 * 1024),
        containers: backend_capacity.max_containers,
    };
    info!(
        memory_mb = total.memory_mb,
        disk_mb = total.disk_mb,
        containers = total.containers,
        "Node capacity"
    );

    let registry = Arc::new(Registry::new(total, config.pruning_interval()));
    let _pruner = start_pruner(registry.clone(), config.pruning_interval());

    let (log_tx, log_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(log_streamer::run_udp_forwarder(
        log_rx,
        config.log_sink_address.clone(),
        config.log_sink_shared_secret.clone(),
    ));

    let cache = Arc::new(
        DownloadCache::new(config.cache_directory.clone(), config.max_cache_size_bytes)
            .context("failed to prepare the download cache")?,
    );
    let limiter = Arc::new(tokio::sync::Semaphore::new(config.download_concurrency));
    let transformer = Transformer::new(
        backend.clone(),
        cache,
        limiter,
        config.allow_privileged,
    );

    let dispatcher = RunDispatcher::new(
        registry.clone(),
        backend.clone(),
        DispatcherConfig {
            worker_count: config.worker_count,
            callback_retries: config.callback_retries,
            callback_backoff_base: config.callback_backoff_base(),
        },
    );

    let executor = Arc::new(Executor::new(
        registry,
        backend,
        transformer,
        dispatcher.clone(),
        config.container_owner_name.clone(),
        config.container_max_cpu_shares,
        log_tx,
    ));

    let drain = DrainController::new(config.drain_timeout());
    spawn_signal_listener(drain.clone(), dispatcher.clone());

    let router = build_router(ApiState::new(executor, drain.clone()));
    let shutdown = {
        let drain = drain.clone();
        async move { drain.stopped().await }
    };
    ApiServer::run(&config.listen_address, router, shutdown)
        .await
        .context("control plane failed")?;

    // Outstanding cleanup finishes before we report a clean exit
    dispatcher.wait_idle().await;
    info!("Shutdown complete");
    Ok(())
}

fn create_backend(config: &ExecutorConfig) -> anyhow::Result<Arc<dyn Backend>> {
    match config.backend_network.as_str() {
        "memory" => {
            info!("Using the in-memory backend");
            Ok(Arc::new(InMemoryBackend::new()))
        }
        "tcp" => anyhow::bail!(
            "no tcp backend client is linked into this build; point {} at a supported backend",
            config.backend_address
        ),
        other => anyhow::bail!("unknown backend transport '{other}'"),
    }
}

#[cfg(unix)]
fn spawn_signal_listener(drain: DrainController, dispatcher: Arc<RunDispatcher>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut drain_signal =
            signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");

        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    info!(signal = "SIGTERM", "Signal received");
                    drain.shutdown(&dispatcher);
                }
                _ = interrupt.recv() => {
                    info!(signal = "SIGINT", "Signal received");
                    drain.shutdown(&dispatcher);
                }
                _ = drain_signal.recv() => {
                    info!(signal = "SIGUSR1", "Signal received");
                    drain.drain(dispatcher.clone());
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(drain: DrainController, dispatcher: Arc<RunDispatcher>) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!(signal = "interrupt", "Signal received");
        drain.shutdown(&dispatcher);
    });
}
