//! Proxmox VE API adapter.
//!
//! [`ProxmoxApi`] is the narrow async seam the reconciler drives; every
//! operation is idempotent so a tick can safely re-enter any pipeline step.
//! [`PveClient`] implements it over the Proxmox REST API with an API-token
//! header and a per-call deadline. Failures split into two kinds: transient
//! (network, 5xx, deadline) which the reconciler retries next tick, and
//! permanent (4xx) which fail the affected VM.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{InstanceShape, ProxmoxConfig};
use crate::{Error, Result};

/// Per-call deadline for Proxmox requests. Exceeding it is transient.
const CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Grace period for guest shutdown before Proxmox hard-stops the VM.
const STOP_GRACE_SECS: u32 = 30;

/// A VM as seen in a Proxmox listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// Cluster-wide VM identifier.
    pub vmid: u32,
    /// VM name (the hostname we assigned at creation).
    pub name: String,
    /// `true` if the VM is currently running.
    pub running: bool,
    /// All tags on the VM.
    pub tags: Vec<String>,
}

/// Point-in-time status of a single VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatus {
    /// `false` if Proxmox has no VM with this vmid.
    pub present: bool,
    /// `true` if the VM is running.
    pub running: bool,
    /// All tags on the VM (empty when absent).
    pub tags: Vec<String>,
}

/// Parameters for creating a VM shell. The boot disk is not allocated here;
/// [`ProxmoxApi::import_disk`] attaches it afterwards.
#[derive(Debug, Clone)]
pub struct CreateVmParams {
    /// Instance shape (cores, memory, disk).
    pub shape: InstanceShape,
    /// VM name / guest hostname.
    pub hostname: String,
    /// Bridge for the first NIC.
    pub bridge: String,
    /// Tags to attach, including the group tag.
    pub tags: Vec<String>,
}

/// Async facade over the Proxmox VM operations the provider needs.
///
/// Declared with explicit `Send` futures so callers can run inside spawned
/// tasks regardless of the implementation.
pub trait ProxmoxApi: Send + Sync {
    /// Lists VMs carrying exactly the given tag.
    fn list_vms_with_tag(&self, tag: &str) -> impl Future<Output = Result<Vec<VmInfo>>> + Send;

    /// Lists every VM carrying any tag of the managed scheme
    /// (`ca-group-*`), across all groups.
    fn list_managed_vms(&self) -> impl Future<Output = Result<Vec<VmInfo>>> + Send;

    /// Returns the next free cluster-wide vmid.
    fn next_vmid(&self) -> impl Future<Output = Result<u32>> + Send;

    /// Creates a VM shell. Succeeds if a VM with this vmid already exists.
    fn create_vm(
        &self,
        vmid: u32,
        params: &CreateVmParams,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Streams the cloud image at `image_url` into `target_storage` and
    /// attaches it as the boot disk. Succeeds if the volume already exists.
    fn import_disk(
        &self,
        vmid: u32,
        image_url: &str,
        target_storage: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Uploads ISO content to the ISO storage under `volume`. Overwrites
    /// any previous upload of the same volume.
    fn upload_iso(&self, volume: &str, content: Vec<u8>)
    -> impl Future<Output = Result<()>> + Send;

    /// Attaches an uploaded ISO volume as the VM's CD-ROM drive.
    fn attach_iso(&self, vmid: u32, iso_volume: &str) -> impl Future<Output = Result<()>> + Send;

    /// Starts the VM. Succeeds if it is already running.
    fn start_vm(&self, vmid: u32) -> impl Future<Output = Result<()>> + Send;

    /// Stops the VM: graceful shutdown, hard stop after a fixed deadline.
    /// Succeeds if it is already stopped.
    fn stop_vm(&self, vmid: u32) -> impl Future<Output = Result<()>> + Send;

    /// Destroys the VM and its disks. Succeeds if it is already absent.
    fn destroy_vm(&self, vmid: u32) -> impl Future<Output = Result<()>> + Send;

    /// Destroys an ISO volume. Succeeds if it is already absent.
    fn destroy_iso(&self, iso_volume: &str) -> impl Future<Output = Result<()>> + Send;

    /// Queries presence, run state and tags of a VM.
    fn vm_status(&self, vmid: u32) -> impl Future<Output = Result<VmStatus>> + Send;
}

/// Envelope every Proxmox API response is wrapped in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

/// Entry of `GET /nodes/{node}/qemu`.
#[derive(Debug, Deserialize)]
struct QemuListEntry {
    vmid: u32,
    #[serde(default)]
    name: String,
    status: String,
    #[serde(default)]
    tags: Option<String>,
}

/// Body of `GET /nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Deserialize)]
struct QemuCurrent {
    status: String,
    #[serde(default)]
    tags: Option<String>,
}

/// Entry of `GET /nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Deserialize)]
struct StorageContentEntry {
    volid: String,
}

/// Proxmox REST client implementing [`ProxmoxApi`].
#[derive(Debug)]
pub struct PveClient {
    /// Underlying HTTP client with the per-call deadline baked in.
    http: reqwest::Client,
    /// API base URL without trailing slash.
    base_url: String,
    /// `PVEAPIToken=<id>=<secret>` authorization header value.
    auth_header: String,
    /// Placement node for all VM operations.
    node: String,
    /// ISO storage id (for uploads and ISO destruction).
    iso_storage: String,
    /// Storage boot disks are allocated on.
    vm_storage: String,
}

impl PveClient {
    /// Builds a client from the Proxmox configuration section.
    pub fn new(config: &ProxmoxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_DEADLINE)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| Error::Config(format!("proxmox http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.endpoint.trim_end_matches('/').to_owned(),
            auth_header: format!("PVEAPIToken={}={}", config.token_id, config.token_secret),
            node: config.node.clone(),
            iso_storage: config.iso_storage.clone(),
            vm_storage: config.vm_storage.clone(),
        })
    }

    /// URL prefix for node-scoped endpoints.
    fn node_url(&self) -> String {
        format!("{}/nodes/{}", self.base_url, self.node)
    }

    /// Sends a prepared request and maps failures onto the error taxonomy.
    async fn dispatch(&self, req: reqwest::RequestBuilder, op: &str) -> Result<reqwest::Response> {
        let resp = req
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await
            .map_err(|e| Error::TransientProxmox(format!("{op}: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(Error::TransientProxmox(format!("{op}: {status} - {body}")))
        } else {
            Err(Error::PermanentProxmox(format!("{op}: {status} - {body}")))
        }
    }

    /// Sends a request and decodes the `data` field of the envelope.
    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        op: &str,
    ) -> Result<Option<T>> {
        let resp = self.dispatch(req, op).await?;
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| Error::TransientProxmox(format!("{op}: decoding response: {e}")))?;
        Ok(envelope.data)
    }

    /// Lists all VMs on the node, with tags split out.
    async fn list_all(&self) -> Result<Vec<VmInfo>> {
        let url = format!("{}/qemu", self.node_url());
        let entries: Vec<QemuListEntry> = self
            .fetch(self.http.get(&url), "list vms")
            .await?
            .unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|e| VmInfo {
                vmid: e.vmid,
                name: e.name,
                running: e.status == "running",
                tags: split_tags(e.tags.as_deref()),
            })
            .collect())
    }

    /// Lists volume ids present on a storage.
    async fn storage_volids(&self, storage: &str) -> Result<Vec<String>> {
        let url = format!("{}/storage/{}/content", self.node_url(), storage);
        let entries: Vec<StorageContentEntry> = self
            .fetch(self.http.get(&url), "list storage content")
            .await?
            .unwrap_or_default();
        Ok(entries.into_iter().map(|e| e.volid).collect())
    }

    /// Name of the imported cloud-image volume for a vmid.
    fn import_volume_name(vmid: u32) -> String {
        format!("vm-{vmid}-cloudimg.qcow2")
    }
}

impl ProxmoxApi for PveClient {
    async fn list_vms_with_tag(&self, tag: &str) -> Result<Vec<VmInfo>> {
        let mut vms = self.list_all().await?;
        vms.retain(|vm| vm.tags.iter().any(|t| t == tag));
        Ok(vms)
    }

    async fn list_managed_vms(&self) -> Result<Vec<VmInfo>> {
        let mut vms = self.list_all().await?;
        vms.retain(|vm| {
            vm.tags
                .iter()
                .any(|t| t.starts_with(crate::context::TAG_PREFIX))
        });
        Ok(vms)
    }

    async fn next_vmid(&self) -> Result<u32> {
        let url = format!("{}/cluster/nextid", self.base_url);
        let id: String = self
            .fetch(self.http.get(&url), "next vmid")
            .await?
            .ok_or_else(|| Error::TransientProxmox("next vmid: empty response".into()))?;
        id.parse()
            .map_err(|_| Error::PermanentProxmox(format!("next vmid: unparseable id {id:?}")))
    }

    async fn create_vm(&self, vmid: u32, params: &CreateVmParams) -> Result<()> {
        let url = format!("{}/qemu", self.node_url());
        let form = [
            ("vmid", vmid.to_string()),
            ("name", params.hostname.clone()),
            ("cores", params.shape.cores.to_string()),
            ("memory", params.shape.memory_mib.to_string()),
            ("net0", format!("virtio,bridge={}", params.bridge)),
            ("scsihw", "virtio-scsi-pci".to_owned()),
            ("tags", params.tags.join(";")),
            ("agent", "1".to_owned()),
        ];
        match self.dispatch(self.http.post(&url).form(&form), "create vm").await {
            Ok(_) => {
                info!(vmid, hostname = %params.hostname, "created vm shell");
                Ok(())
            }
            // Idempotent on vmid collision: treat an existing VM as ours.
            Err(Error::PermanentProxmox(msg)) => {
                if self.vm_status(vmid).await?.present {
                    debug!(vmid, %msg, "create vm: already exists");
                    Ok(())
                } else {
                    Err(Error::PermanentProxmox(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn import_disk(&self, vmid: u32, image_url: &str, target_storage: &str) -> Result<()> {
        let volume = Self::import_volume_name(vmid);
        let volid = format!("{target_storage}:import/{volume}");

        let present = self
            .storage_volids(target_storage)
            .await?
            .iter()
            .any(|v| v == &volid);
        if !present {
            let url = format!("{}/storage/{}/download-url", self.node_url(), target_storage);
            let form = [
                ("content", "import".to_owned()),
                ("filename", volume.clone()),
                ("url", image_url.to_owned()),
            ];
            self.dispatch(self.http.post(&url).form(&form), "import disk")
                .await?;
            info!(vmid, %volid, "imported cloud image");
        }

        // Attach as the boot disk; a repeated PUT with the same value is a no-op.
        let url = format!("{}/qemu/{}/config", self.node_url(), vmid);
        let form = [
            ("scsi0", format!("{}:0,import-from={volid}", self.vm_storage)),
            ("boot", "order=scsi0".to_owned()),
        ];
        self.dispatch(self.http.put(&url).form(&form), "attach boot disk")
            .await?;
        Ok(())
    }

    async fn upload_iso(&self, volume: &str, content: Vec<u8>) -> Result<()> {
        let url = format!("{}/storage/{}/upload", self.node_url(), self.iso_storage);
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(volume.to_owned())
            .mime_str("application/octet-stream")
            .map_err(|e| Error::PermanentProxmox(format!("upload iso: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("content", "iso")
            .part("filename", part);
        self.dispatch(self.http.post(&url).multipart(form), "upload iso")
            .await?;
        debug!(volume, "uploaded seed iso");
        Ok(())
    }

    async fn attach_iso(&self, vmid: u32, iso_volume: &str) -> Result<()> {
        let url = format!("{}/qemu/{}/config", self.node_url(), vmid);
        let form = [(
            "ide2",
            format!("{}:iso/{iso_volume},media=cdrom", self.iso_storage),
        )];
        self.dispatch(self.http.put(&url).form(&form), "attach iso")
            .await?;
        Ok(())
    }

    async fn start_vm(&self, vmid: u32) -> Result<()> {
        let url = format!("{}/qemu/{}/status/start", self.node_url(), vmid);
        match self.dispatch(self.http.post(&url), "start vm").await {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.vm_status(vmid).await.is_ok_and(|s| s.running) {
                    debug!(vmid, error = %e, "start vm: already running");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn stop_vm(&self, vmid: u32) -> Result<()> {
        let status = self.vm_status(vmid).await?;
        if !status.present || !status.running {
            return Ok(());
        }
        let url = format!("{}/qemu/{}/status/shutdown", self.node_url(), vmid);
        let form = [
            ("timeout", STOP_GRACE_SECS.to_string()),
            ("forceStop", "1".to_owned()),
        ];
        self.dispatch(self.http.post(&url).form(&form), "stop vm")
            .await?;
        Ok(())
    }

    async fn destroy_vm(&self, vmid: u32) -> Result<()> {
        if !self.vm_status(vmid).await?.present {
            return Ok(());
        }
        let url = format!(
            "{}/qemu/{}?purge=1&destroy-unreferenced-disks=1",
            self.node_url(),
            vmid
        );
        self.dispatch(self.http.delete(&url), "destroy vm").await?;
        info!(vmid, "destroyed vm");
        Ok(())
    }

    async fn destroy_iso(&self, iso_volume: &str) -> Result<()> {
        let volid = format!("{}:iso/{iso_volume}", self.iso_storage);
        let present = self
            .storage_volids(&self.iso_storage)
            .await?
            .iter()
            .any(|v| v == &volid);
        if !present {
            return Ok(());
        }
        let url = format!(
            "{}/storage/{}/content/{}",
            self.node_url(),
            self.iso_storage,
            volid
        );
        self.dispatch(self.http.delete(&url), "destroy iso").await?;
        info!(volume = iso_volume, "destroyed seed iso");
        Ok(())
    }

    async fn vm_status(&self, vmid: u32) -> Result<VmStatus> {
        let url = format!("{}/qemu/{}/status/current", self.node_url(), vmid);
        match self
            .fetch::<QemuCurrent>(self.http.get(&url), "vm status")
            .await
        {
            Ok(Some(current)) => Ok(VmStatus {
                present: true,
                running: current.status == "running",
                tags: split_tags(current.tags.as_deref()),
            }),
            Ok(None) => Ok(VmStatus {
                present: false,
                running: false,
                tags: Vec::new(),
            }),
            // Proxmox answers "does not exist" (as a 500 or a 4xx depending
            // on version) for unknown vmids. Only that response means
            // absent; any other failure (403, malformed request, outage)
            // must propagate, or teardown would no-op against a live VM.
            Err(Error::PermanentProxmox(msg) | Error::TransientProxmox(msg))
                if msg.contains("does not exist") =>
            {
                Ok(VmStatus {
                    present: false,
                    running: false,
                    tags: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Splits Proxmox's `;`-separated tag string.
fn split_tags(tags: Option<&str>) -> Vec<String> {
    tags.unwrap_or_default()
        .split(';')
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}
