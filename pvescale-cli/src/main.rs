//! CLI for the pvescale cluster-autoscaler provider.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod serve;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pvescale::config::Config;
use pvescale::lifecycle::VmState;
use pvescale::store::StateDb;

#[derive(Parser)]
#[command(
    name = "pvescale",
    version,
    about = "Proxmox node-group provider for the Kubernetes cluster autoscaler"
)]
struct Cli {
    /// Path to the configuration document.
    #[arg(
        long,
        global = true,
        env = "PVESCALE_CONFIG",
        default_value = "/etc/pvescale/config.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the provider: reconcile loop plus protocol listener.
    Serve(serve::ServeArgs),

    /// Load and validate the configuration, printing a redacted summary.
    Check,

    /// Show per-group desired sizes and VM lifecycle states.
    Status {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for introspection commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("pvescale: {e:#}");
        std::process::exit(1);
    }
}

/// Installs a stderr subscriber honoring `RUST_LOG` (default `info`).
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Serve(args) => serve::serve(&self.config, args).await,
            Command::Check => check(&self.config),
            Command::Status { format } => status(&self.config, format),
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "pvescale",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

fn check(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    println!("configuration ok: {}", config_path.display());
    println!("  proxmox endpoint: {}", config.proxmox.endpoint);
    println!("  proxmox node:     {}", config.proxmox.node);
    println!("  token id:         {}", config.proxmox.token_id);
    println!("  token secret:     <redacted>");
    println!("  cluster server:   {}", config.cluster.server_url);
    println!("  cluster token:    <redacted>");
    println!("  k3s version:      {}", config.cluster.k3s_version);
    println!("  state path:       {}", config.state_path.display());
    println!("  listen:           {}", config.listen);
    println!("  groups:");
    for group in &config.groups {
        println!(
            "    {:<12} min={} max={} cores={} memory={}MiB disk={}GiB",
            group.id,
            group.min_size,
            group.max_size,
            group.shape.cores,
            group.shape.memory_mib,
            group.shape.disk_gib
        );
    }
    Ok(())
}

fn status(config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = StateDb::open(&config.state_path)
        .with_context(|| format!("opening {}", config.state_path.display()))?;

    if matches!(format, OutputFormat::Json) {
        let mut groups = Vec::new();
        for group in &config.groups {
            let vms: Vec<_> = store
                .list_vms(&group.id)?
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "vmid": r.vmid,
                        "hostname": r.hostname,
                        "state": r.state.as_str(),
                        "created_at": r.created_at,
                        "last_error": r.last_error,
                    })
                })
                .collect();
            groups.push(serde_json::json!({
                "id": group.id,
                "desired": store.get_desired(&group.id)?,
                "vms": vms,
            }));
        }
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    println!(
        "{:<12} {:>7} {:>8} {:>7} {:>7} {:>9}",
        "GROUP", "DESIRED", "PENDING", "ACTIVE", "FAILED", "DELETING"
    );
    for group in &config.groups {
        let vms = store.list_vms(&group.id)?;
        let count = |s: VmState| vms.iter().filter(|r| r.state == s).count();
        let deleting = vms.iter().filter(|r| r.state.is_cleanup() && r.state != VmState::Failed).count();
        println!(
            "{:<12} {:>7} {:>8} {:>7} {:>7} {:>9}",
            group.id,
            store
                .get_desired(&group.id)?
                .map_or_else(|| "-".to_owned(), |d| d.to_string()),
            count(VmState::Pending),
            count(VmState::Active),
            count(VmState::Failed),
            deleting
        );
    }
    Ok(())
}
