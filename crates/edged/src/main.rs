//! edged — the EdgeGrid regional controller daemon.
//!
//! Opens the KV store, wires the controller with its notify fan-out,
//! and serves the REST API. Site resource managers receive committed
//! intent through the notify stream and report CloudletInfo back up it;
//! the daemon itself never talks to infrastructure.
//!
//! ```text
//! edged --region us-west --api-port 8443 --data-dir /var/lib/edgegrid
//! edged --region dev --in-memory
//! ```

mod rest;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use edgegrid_api::{attach_notify, Controller, ControllerOpts, InMemorySecretStore};
use edgegrid_kv::KvStore;
use edgegrid_lifecycle::{InProcBus, NoopCrm};
use edgegrid_model::Settings;
use edgegrid_notify::NotifyServer;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "edged", about = "EdgeGrid regional controller")]
struct Cli {
    /// Region this controller is authoritative for.
    #[arg(long, default_value = "local")]
    region: String,

    /// HTTP API port.
    #[arg(long, default_value = "8443")]
    api_port: u16,

    /// Data directory for the KV store.
    #[arg(long, default_value = "/var/lib/edgegrid")]
    data_dir: PathBuf,

    /// Run with an in-memory store (development only).
    #[arg(long)]
    in_memory: bool,

    /// Registry host used to derive image paths.
    #[arg(long, default_value = "")]
    registry_fqdn: String,

    /// DNS root for instance URIs.
    #[arg(long, default_value = "edgegrid.net")]
    app_dns_root: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edged=debug,edgegrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    info!(region = %cli.region, "edged starting");

    let kv = if cli.in_memory {
        KvStore::open_in_memory()
    } else {
        std::fs::create_dir_all(&cli.data_dir)?;
        let path = cli.data_dir.join("edgegrid.redb");
        let kv = KvStore::open(&path)?;
        info!(path = ?path, "kv store opened");
        kv
    };

    let settings = Settings {
        registry_fqdn: cli.registry_fqdn,
        app_dns_root: cli.app_dns_root,
        ..Default::default()
    };
    let controller = Controller::new(ControllerOpts {
        region: cli.region,
        kv,
        // Intent reaches site CRMs through the notify stream; there is
        // no direct dispatch from this process.
        crm: Arc::new(NoopCrm),
        bus: Arc::new(InProcBus::new()),
        secrets: Arc::new(InMemorySecretStore::new()),
        settings,
        upgrades: Vec::new(),
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = controller.start(shutdown_rx);

    let notify = NotifyServer::new();
    attach_notify(&controller, &notify);
    info!("notify server attached");

    let router = rest::build_router(controller, notify);
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.api_port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for task in tasks {
        let _ = task.await;
    }
    info!("edged stopped");
    Ok(())
}
