use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{signal, sync::watch};
use tracing::{info, warn};

use marketplace_checkout as app;
use app::circuit_breaker::CircuitBreakerConfig;
use app::services::catalog::{HttpCatalog, InMemoryCatalog, ProductCatalog};
use app::services::notifications::LoggingNotifier;
use app::services::payment_gateway::{HttpPaymentGateway, PaymentGateway, SimulatedGateway};
use app::store::{DatabaseStore, InMemoryStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = app::config::load_config().context("loading configuration")?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);

    let store: Arc<dyn Store> = if cfg.uses_database() {
        let db = app::db::establish_connection_from_app_config(&cfg)
            .await
            .context("connecting to the database")?;
        if cfg.auto_create_schema {
            app::db::create_schema(&db)
                .await
                .context("creating database schema")?;
        }
        Arc::new(DatabaseStore::new(db))
    } else {
        warn!("using the in-memory store; state is lost on restart");
        Arc::new(InMemoryStore::new())
    };

    let catalog: Arc<dyn ProductCatalog> = match cfg.catalog_url.as_deref() {
        Some(url) => Arc::new(HttpCatalog::new(
            url,
            Duration::from_millis(cfg.gateway_timeout_ms),
        )?),
        None => {
            warn!("no catalog_url configured; prices come from an empty in-memory catalog");
            Arc::new(InMemoryCatalog::new())
        }
    };

    let gateway: Arc<dyn PaymentGateway> = match cfg.payment_gateway_url.as_deref() {
        Some(url) => Arc::new(HttpPaymentGateway::new(
            url,
            cfg.payment_gateway_api_key.clone(),
            Duration::from_millis(cfg.gateway_timeout_ms),
            CircuitBreakerConfig {
                failure_threshold: cfg.circuit_breaker_failure_threshold,
                timeout: Duration::from_secs(cfg.circuit_breaker_timeout_secs),
                ..CircuitBreakerConfig::default()
            },
        )?),
        None => {
            warn!("no payment_gateway_url configured; using the simulated gateway");
            Arc::new(SimulatedGateway)
        }
    };

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("parsing listen address")?;
    let sweep_interval = Duration::from_secs(cfg.expiry_sweep_interval_secs);

    let (state, notification_worker) = app::AppState::build(
        cfg,
        app::Collaborators {
            store,
            catalog,
            gateway,
            notifier: Arc::new(LoggingNotifier),
        },
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let expirer = state.expirer.clone().spawn(sweep_interval, shutdown_rx);

    let router = app::build_router(state);
    info!("marketplace-checkout listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = expirer.await {
        warn!(error = %e, "reservation expirer ended abnormally");
    }
    // The router held the last dispatchers; the worker drains and exits.
    if tokio::time::timeout(Duration::from_secs(5), notification_worker)
        .await
        .is_err()
    {
        warn!("notification worker did not drain in time");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
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
