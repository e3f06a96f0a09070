//! The `serve` subcommand: wires the store, adapters, controller and
//! reconciler together and runs until interrupted or asked to clean up.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use pvescale::config::Config;
use pvescale::kube::KubeNodes;
use pvescale::proxmox::PveClient;
use pvescale::reconcile::Reconciler;
use pvescale::scaling::ScalingController;
use pvescale::server;
use pvescale::store::StateDb;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Arguments for `pvescale serve`.
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Listen address override for the provider protocol.
    #[arg(long)]
    pub listen: Option<String>,
}

pub async fn serve(config_path: &Path, args: ServeArgs) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let config = Arc::new(config);

    if let Some(dir) = config.state_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = Arc::new(
        StateDb::open(&config.state_path)
            .with_context(|| format!("opening {}", config.state_path.display()))?,
    );
    let proxmox = Arc::new(PveClient::new(&config.proxmox)?);
    let nodes = Arc::new(KubeNodes::connect().await.context("connecting to kubernetes")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Arc::new(ScalingController::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&nodes),
        shutdown_tx.clone(),
    ));
    let reconciler = Reconciler::new(
        Arc::clone(&config),
        Arc::clone(&store),
        proxmox,
        nodes,
        shutdown_rx.clone(),
    );
    let reconciler_task = tokio::spawn(reconciler.run());

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    tokio::select! {
        result = server::serve(listener, controller, shutdown_rx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
        }
    }

    // Covers both exit paths; a repeated send is a no-op.
    let _ = shutdown_tx.send(true);
    reconciler_task.await.context("reconciler task failed")?;
    Ok(())
}
