//! adaptive-lb daemon
//!
//! Adaptive request router and resilience core, served over HTTP.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────────┐
//!                 │                        ADAPTIVE-LB                           │
//!                 │                                                              │
//!  Client Request │  ┌──────────┐   ┌────────────┐   ┌────────────────────────┐  │
//!  ───────────────┼─▶│  http    │──▶│ Dispatcher │──▶│ Pool                   │  │
//!                 │  │  server  │   │  (route)   │   │  session → eligible set│  │
//!                 │  └──────────┘   └─────┬──────┘   │  → strategy            │  │
//!                 │                       │          └───────────┬────────────┘  │
//!                 │                       ▼                      ▼               │
//!                 │               ┌──────────────┐      ┌─────────────────┐      │
//!                 │               │  failover +  │      │ breaker, rate   │      │
//!                 │               │  backoff     │      │ limit, guard    │      │
//!                 │               └──────┬───────┘      └────────┬────────┘      │
//!                 │                      ▼                       ▼               │
//!  Client Response│  ┌──────────┐   ┌──────────────┐                             │
//!  ◀──────────────┼──│ response │◀──│ HttpUpstream │◀─────────────────────────── ┼── Backend
//!                 │  └──────────┘   └──────────────┘                             │   Server
//!                 │                                                              │
//!                 │  Background, per pool: health probes, session sweep,         │
//!                 │  metrics rollup. Admin API on its own listener.              │
//!                 └──────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use adaptive_lb::admin::{setup_admin_router, AdminState};
use adaptive_lb::config::{load_config, ProbeKind};
use adaptive_lb::health::{HealthProbe, HttpProbe, TcpProbe};
use adaptive_lb::http::{HttpServer, HttpUpstream};
use adaptive_lb::lifecycle::Shutdown;
use adaptive_lb::observability::{logging, metrics};
use adaptive_lb::routing::Dispatcher;

#[derive(Parser)]
#[command(name = "adaptive-lb")]
#[command(about = "Adaptive load balancer and resilience core", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "adaptive-lb starting");
    tracing::info!(
        config = %args.config.display(),
        pools = config.pools.len(),
        bind_address = %config.listener.bind_address,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let probe: Arc<dyn HealthProbe> = match config.probe.kind {
        ProbeKind::Tcp => Arc::new(TcpProbe),
        ProbeKind::Http => Arc::new(HttpProbe::new(config.probe.path.clone())),
    };
    let upstream = Arc::new(HttpUpstream::default());
    let dispatcher = Arc::new(Dispatcher::from_config(&config, upstream, probe)?);

    let shutdown = Arc::new(Shutdown::new());

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let router = setup_admin_router(AdminState::new(
            dispatcher.clone(),
            &config.admin.api_key,
            config.defaults.clone(),
        ));
        let mut signal = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.recv().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped with error");
            }
        });
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
            }
            shutdown.trigger();
        }
    });

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(dispatcher.clone(), config.listener.clone());
    server.run(listener, shutdown.subscribe()).await?;

    dispatcher.shutdown();
    tracing::info!("Shutdown complete");
    Ok(())
}
