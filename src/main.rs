//! Proxylist - Entry Point
//!
//! Starts the check scheduler, discovery and the API server with graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxylist::api::{ApiServer, AppState};
use proxylist::config::{Config, LogConfig, StoreBackend};
use proxylist::proxy::{CheckGate, HttpProber, ProxyChecker, TunnelProbe};
use proxylist::repository::{MemoryStore, ProxyRepository, ProxyStore};
use proxylist::services::{CheckScheduler, DiscoveryService};
use proxylist::shutdown::ShutdownHandle;
use proxylist::{Database, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting proxylist");

    let (store, db) = open_store(&config).await?;
    let (shutdown, _) = ShutdownHandle::new();

    let checker_config = &config.checker;
    let gate = CheckGate::new(checker_config.concurrency);
    let tunnel = TunnelProbe::new(
        checker_config.tunnel_echo_url.clone(),
        checker_config.tunnel_timeout,
        checker_config.tunnel_heartbeat,
    );
    let prober = HttpProber::new(
        checker_config.probe_targets.clone(),
        checker_config.probe_timeout,
        checker_config.require_ip_in_body,
        tunnel,
    )
    .with_shutdown(shutdown.subscribe());
    let checker = ProxyChecker::new(
        Arc::new(prober),
        gate,
        checker_config.protocols.clone(),
        checker_config.check_tunnel,
    );

    let scheduler = CheckScheduler::new(
        store.clone(),
        checker,
        checker_config.selection.clone(),
        checker_config.check_period,
    );
    let discovery = DiscoveryService::new(store.clone(), config.discovery.clone())?;
    let api_server = ApiServer::new(
        config.api.clone(),
        AppState::new(store.clone(), scheduler.stats()),
    );

    let scheduler_shutdown = shutdown.subscribe();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let discovery_shutdown = shutdown.subscribe();
    let discovery_task = tokio::spawn(async move {
        discovery.run(discovery_shutdown).await;
    });

    let api_shutdown = shutdown.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!("Services started - API: {}", config.api_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    shutdown.shutdown();
    let _ = tokio::join!(scheduler_task, discovery_task, api_task);

    if let Some(db) = db {
        db.close().await;
    }

    info!("Proxylist stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proxylist={},tower_http=info", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Open the configured store, migrating the database when there is one
async fn open_store(config: &Config) -> Result<(Arc<dyn ProxyStore>, Option<Database>)> {
    match config.store.backend {
        StoreBackend::Postgres => {
            let db = Database::new(config).await?;
            info!("Connected to database");

            db.run_migrations().await?;
            info!("Database migrations complete");

            let repo = ProxyRepository::new(db.pool().clone());
            Ok((Arc::new(repo), Some(db)))
        }
        StoreBackend::Memory => {
            info!("Using in-memory store, state is lost on exit");
            Ok((Arc::new(MemoryStore::new()), None))
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
