//! Configuration document and environment overlay.
//!
//! Configuration is a YAML document loaded once at startup, overlaid with
//! `PVESCALE_*` environment variables, validated, and passed into each
//! component as an immutable value. There is no process-wide singleton.
//!
//! Every overridable field documents its environment variable name next to
//! the field. Missing or invalid values fail startup with [`Error::Config`]
//! naming the offending key.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;

use crate::{Error, Result};

/// Default pending-VM timeout in seconds.
pub const DEFAULT_PENDING_VM_TIMEOUT_SECS: u64 = 900;
/// Default reconcile interval in seconds.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 20;
/// Default listen address for the provider protocol.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8760";

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Proxmox endpoint, credentials and placement settings.
    pub proxmox: ProxmoxConfig,
    /// k3s cluster join settings.
    pub cluster: ClusterConfig,
    /// Path of the SQLite state file. Env: `PVESCALE_STATE_PATH`.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Listen address for the provider protocol. Env: `PVESCALE_LISTEN`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds a VM may stay `pending` before it is failed.
    /// Env: `PVESCALE_PENDING_VM_TIMEOUT_SECS`.
    #[serde(default = "default_pending_timeout")]
    pub pending_vm_timeout_secs: u64,
    /// Seconds between reconcile ticks. Env: `PVESCALE_RECONCILE_INTERVAL_SECS`.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Managed node groups.
    pub groups: Vec<GroupConfig>,
}

/// Proxmox endpoint, credentials and placement settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxmoxConfig {
    /// API base URL, e.g. `https://pve.example:8006/api2/json`.
    /// Env: `PVESCALE_PROXMOX_ENDPOINT`.
    pub endpoint: String,
    /// API token id, e.g. `root@pam!pvescale`. Env: `PVESCALE_PROXMOX_TOKEN_ID`.
    pub token_id: String,
    /// API token secret. Env: `PVESCALE_PROXMOX_TOKEN_SECRET`.
    pub token_secret: String,
    /// Proxmox node VMs are placed on. Env: `PVESCALE_PROXMOX_NODE`.
    pub node: String,
    /// Verify the API TLS certificate. Proxmox installations commonly use
    /// self-signed certificates. Env: `PVESCALE_PROXMOX_VERIFY_TLS`.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// Storage the cloud image is imported into. Env: `PVESCALE_IMPORT_STORAGE`.
    pub import_storage: String,
    /// Storage seed ISOs are uploaded to. Env: `PVESCALE_ISO_STORAGE`.
    pub iso_storage: String,
    /// Storage VM boot disks live on. Env: `PVESCALE_VM_STORAGE`.
    pub vm_storage: String,
    /// Bridge VM NICs attach to. Env: `PVESCALE_BRIDGE`.
    pub bridge: String,
    /// URL of the cloud image used as the boot disk.
    /// Env: `PVESCALE_CLOUD_IMAGE_URL`.
    pub cloud_image_url: String,
}

/// k3s cluster join settings, baked into each seed ISO.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Pinned k3s version, e.g. `v1.30.4+k3s1`. Env: `PVESCALE_K3S_VERSION`.
    pub k3s_version: String,
    /// k3s server URL agents join, e.g. `https://10.0.0.1:6443`.
    /// Env: `PVESCALE_K3S_SERVER_URL`.
    pub server_url: String,
    /// Cluster join token. Env: `PVESCALE_CLUSTER_TOKEN`.
    pub token: String,
    /// SSH public key installed for the default user.
    /// Env: `PVESCALE_SSH_PUBLIC_KEY`.
    pub ssh_public_key: String,
}

/// Instance shape shared by every VM in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceShape {
    /// Virtual CPU cores.
    pub cores: u16,
    /// RAM in MiB.
    pub memory_mib: u32,
    /// Boot disk size in GiB.
    pub disk_gib: u32,
}

/// A managed node group. Immutable at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Short unique identifier; becomes part of tags, hostnames and labels.
    pub id: String,
    /// Lower bound on desired size.
    pub min_size: u32,
    /// Upper bound on desired size.
    pub max_size: u32,
    /// Shape of every VM in the group.
    pub shape: InstanceShape,
    /// Opaque template payload reported to the autoscaler. Defaults to a
    /// rendering of the shape.
    #[serde(default)]
    pub template: Option<String>,
}

impl GroupConfig {
    /// The template payload emitted to the autoscaler for this group.
    pub fn template_payload(&self) -> String {
        self.template.clone().unwrap_or_else(|| {
            format!(
                "cores={},memory_mib={},disk_gib={}",
                self.shape.cores, self.shape.memory_mib, self.shape.disk_gib
            )
        })
    }
}

impl Config {
    /// Loads the document at `path`, applies the environment overlay and
    /// validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut config: Self = serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies the `PVESCALE_*` overlay from the given lookup. Split from
    /// [`Config::load`] so tests can inject variables without touching the
    /// process environment.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let mut set = |key: &str, field: &mut String| {
            if let Some(v) = get(key) {
                *field = v;
            }
        };
        set("PVESCALE_PROXMOX_ENDPOINT", &mut self.proxmox.endpoint);
        set("PVESCALE_PROXMOX_TOKEN_ID", &mut self.proxmox.token_id);
        set("PVESCALE_PROXMOX_TOKEN_SECRET", &mut self.proxmox.token_secret);
        set("PVESCALE_PROXMOX_NODE", &mut self.proxmox.node);
        set("PVESCALE_IMPORT_STORAGE", &mut self.proxmox.import_storage);
        set("PVESCALE_ISO_STORAGE", &mut self.proxmox.iso_storage);
        set("PVESCALE_VM_STORAGE", &mut self.proxmox.vm_storage);
        set("PVESCALE_BRIDGE", &mut self.proxmox.bridge);
        set("PVESCALE_CLOUD_IMAGE_URL", &mut self.proxmox.cloud_image_url);
        set("PVESCALE_K3S_VERSION", &mut self.cluster.k3s_version);
        set("PVESCALE_K3S_SERVER_URL", &mut self.cluster.server_url);
        set("PVESCALE_CLUSTER_TOKEN", &mut self.cluster.token);
        set("PVESCALE_SSH_PUBLIC_KEY", &mut self.cluster.ssh_public_key);
        set("PVESCALE_LISTEN", &mut self.listen);

        if let Some(v) = get("PVESCALE_PROXMOX_VERIFY_TLS") {
            self.proxmox.verify_tls = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get("PVESCALE_STATE_PATH") {
            self.state_path = PathBuf::from(v);
        }
        if let Some(v) = get("PVESCALE_PENDING_VM_TIMEOUT_SECS")
            && let Ok(n) = v.parse()
        {
            self.pending_vm_timeout_secs = n;
        }
        if let Some(v) = get("PVESCALE_RECONCILE_INTERVAL_SECS")
            && let Ok(n) = v.parse()
        {
            self.reconcile_interval_secs = n;
        }
    }

    /// Validates field contents beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("proxmox.endpoint", &self.proxmox.endpoint),
            ("proxmox.token_id", &self.proxmox.token_id),
            ("proxmox.token_secret", &self.proxmox.token_secret),
            ("proxmox.node", &self.proxmox.node),
            ("proxmox.import_storage", &self.proxmox.import_storage),
            ("proxmox.iso_storage", &self.proxmox.iso_storage),
            ("proxmox.vm_storage", &self.proxmox.vm_storage),
            ("proxmox.bridge", &self.proxmox.bridge),
            ("proxmox.cloud_image_url", &self.proxmox.cloud_image_url),
            ("cluster.k3s_version", &self.cluster.k3s_version),
            ("cluster.server_url", &self.cluster.server_url),
            ("cluster.token", &self.cluster.token),
            ("cluster.ssh_public_key", &self.cluster.ssh_public_key),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("missing required key: {key}")));
            }
        }
        if self.reconcile_interval_secs == 0 {
            return Err(Error::Config("reconcile_interval_secs must be > 0".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if group.id.is_empty()
                || !group
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(Error::Config(format!(
                    "group id {:?} must be non-empty and [a-zA-Z0-9-]",
                    group.id
                )));
            }
            if !seen.insert(group.id.as_str()) {
                return Err(Error::Config(format!("duplicate group id: {}", group.id)));
            }
            if group.min_size > group.max_size {
                return Err(Error::Config(format!(
                    "group {}: min_size {} exceeds max_size {}",
                    group.id, group.min_size, group.max_size
                )));
            }
            if group.shape.cores == 0 || group.shape.memory_mib == 0 || group.shape.disk_gib == 0 {
                return Err(Error::Config(format!(
                    "group {}: shape dimensions must be > 0",
                    group.id
                )));
            }
        }
        Ok(())
    }

    /// Looks up a group by id.
    pub fn group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }
}

/// Serde default: `true`.
const fn default_true() -> bool {
    true
}

/// Serde default for [`Config::state_path`].
fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/pvescale/state.db")
}

/// Serde default for [`Config::listen`].
fn default_listen() -> String {
    DEFAULT_LISTEN.to_owned()
}

/// Serde default for [`Config::pending_vm_timeout_secs`].
const fn default_pending_timeout() -> u64 {
    DEFAULT_PENDING_VM_TIMEOUT_SECS
}

/// Serde default for [`Config::reconcile_interval_secs`].
const fn default_reconcile_interval() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}
