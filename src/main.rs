//! cap-collector daemon entrypoint
//!
//! Wires the store, pricing oracle, upstream client, delta engine and
//! reconciler into one coordinator, then runs the scheduler loop and the
//! HTTP surface until a termination signal arrives. The current pass is
//! always allowed to finish before exit.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cap_collector::{
    server::{self, AppState},
    Config, Coordinator, Database, DeltaEngine, PricingOracle, Reconciler, UpstreamClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cap_collector=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "Starting cap-collector v{} (upstream {}, interval {}s, port {})",
        cap_collector::VERSION,
        config.cliproxy_url,
        config.interval_seconds,
        config.trigger_port
    );

    // A store that cannot open is the only fatal init failure.
    let db = match Database::open(&config.db_path).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Cannot open store at {}: {}", config.db_path, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = db.initialize().await {
        tracing::error!("Store initialization failed: {}", e);
        std::process::exit(1);
    }

    let oracle = Arc::new(PricingOracle::new(&config));
    let upstream = UpstreamClient::new(&config);
    let engine = DeltaEngine::new(db.pool().clone(), oracle, &config);
    let reconciler = Reconciler::new(db.pool().clone(), &config);

    let coordinator = Arc::new(Coordinator::new(
        upstream,
        engine,
        reconciler,
        config.interval_seconds,
    ));

    let shutdown = CancellationToken::new();

    // Scheduler loop: first pass immediately, then interval from end of pass.
    let loop_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        async move {
            coordinator.run_loop(shutdown).await;
        }
    });

    // Signal handling: cancel the next tick and drain the HTTP server.
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        tracing::error!("Cannot install SIGTERM handler: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            tracing::info!("Termination signal received, shutting down");
            shutdown.cancel();
        }
    });

    let state = AppState {
        db,
        coordinator,
        offset: config.local_offset(),
    };
    server::run(state, config.trigger_port, shutdown.clone()).await?;

    // Server drained; wait for the in-flight pass to finish.
    let _ = loop_handle.await;
    tracing::info!("Shutdown complete");

    Ok(())
}
