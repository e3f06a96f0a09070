//! In-memory fakes and a wiring harness shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use pvescale::config::{ClusterConfig, Config, GroupConfig, InstanceShape, ProxmoxConfig};
use pvescale::kube::{NodeDirectory, NodeRef};
use pvescale::proxmox::{CreateVmParams, ProxmoxApi, VmInfo, VmStatus};
use pvescale::reconcile::Reconciler;
use pvescale::scaling::ScalingController;
use pvescale::store::StateDb;
use pvescale::{Error, Result};
use tokio::sync::watch;

/// One VM inside the fake Proxmox cluster.
#[derive(Debug, Clone)]
pub struct FakeVm {
    pub name: String,
    pub running: bool,
    pub tags: Vec<String>,
    pub disk_attached: bool,
    pub iso: Option<String>,
}

/// In-memory Proxmox with instrumentation for idempotence assertions.
#[derive(Debug, Default)]
pub struct FakeProxmox {
    pub vms: Mutex<BTreeMap<u32, FakeVm>>,
    /// ISO volume name → uploaded bytes.
    pub isos: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Import volume names present on the import storage.
    pub import_volumes: Mutex<BTreeSet<String>>,
    /// Times an import volume was created (not merely re-checked).
    pub import_creates: Mutex<BTreeMap<u32, u32>>,
    /// Times an ISO volume was uploaded.
    pub iso_uploads: Mutex<BTreeMap<String, u32>>,
    /// When set, `start_vm` fails with a transient error.
    pub fail_start_transient: AtomicBool,
    /// When set, `import_disk` fails with a permanent error.
    pub fail_import_permanent: AtomicBool,
}

impl FakeProxmox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a VM as if it existed before the provider started.
    pub fn add_vm(&self, vmid: u32, name: &str, running: bool, tags: &[String]) {
        self.vms.lock().unwrap_or_else(PoisonError::into_inner).insert(
            vmid,
            FakeVm {
                name: name.to_owned(),
                running,
                tags: tags.to_vec(),
                disk_attached: true,
                iso: None,
            },
        );
    }

    pub fn vm(&self, vmid: u32) -> Option<FakeVm> {
        self.vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&vmid)
            .cloned()
    }

    pub fn vm_count(&self) -> usize {
        self.vms.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn iso_names(&self) -> Vec<String> {
        self.isos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn info(vmid: u32, vm: &FakeVm) -> VmInfo {
        VmInfo {
            vmid,
            name: vm.name.clone(),
            running: vm.running,
            tags: vm.tags.clone(),
        }
    }
}

impl ProxmoxApi for FakeProxmox {
    async fn list_vms_with_tag(&self, tag: &str) -> Result<Vec<VmInfo>> {
        Ok(self
            .vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, vm)| vm.tags.iter().any(|t| t == tag))
            .map(|(vmid, vm)| Self::info(*vmid, vm))
            .collect())
    }

    async fn list_managed_vms(&self) -> Result<Vec<VmInfo>> {
        Ok(self
            .vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, vm)| vm.tags.iter().any(|t| t.starts_with("ca-group-")))
            .map(|(vmid, vm)| Self::info(*vmid, vm))
            .collect())
    }

    async fn next_vmid(&self) -> Result<u32> {
        let vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(vms.keys().max().map_or(100, |max| max + 1))
    }

    async fn create_vm(&self, vmid: u32, params: &CreateVmParams) -> Result<()> {
        let mut vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        vms.entry(vmid).or_insert_with(|| FakeVm {
            name: params.hostname.clone(),
            running: false,
            tags: params.tags.clone(),
            disk_attached: false,
            iso: None,
        });
        Ok(())
    }

    async fn import_disk(&self, vmid: u32, _image_url: &str, _target_storage: &str) -> Result<()> {
        if self.fail_import_permanent.load(Ordering::SeqCst) {
            return Err(Error::PermanentProxmox("import rejected".into()));
        }
        let volume = format!("vm-{vmid}-cloudimg.qcow2");
        let created = self
            .import_volumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(volume);
        if created {
            *self
                .import_creates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(vmid)
                .or_insert(0) += 1;
        }
        let mut vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(vm) = vms.get_mut(&vmid) {
            vm.disk_attached = true;
        }
        Ok(())
    }

    async fn upload_iso(&self, volume: &str, content: Vec<u8>) -> Result<()> {
        self.isos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(volume.to_owned(), content);
        *self
            .iso_uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(volume.to_owned())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn attach_iso(&self, vmid: u32, iso_volume: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        match vms.get_mut(&vmid) {
            Some(vm) => {
                vm.iso = Some(iso_volume.to_owned());
                Ok(())
            }
            None => Err(Error::PermanentProxmox(format!("vm {vmid} does not exist"))),
        }
    }

    async fn start_vm(&self, vmid: u32) -> Result<()> {
        if self.fail_start_transient.load(Ordering::SeqCst) {
            return Err(Error::TransientProxmox("start timed out".into()));
        }
        let mut vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        match vms.get_mut(&vmid) {
            Some(vm) => {
                vm.running = true;
                Ok(())
            }
            None => Err(Error::PermanentProxmox(format!("vm {vmid} does not exist"))),
        }
    }

    async fn stop_vm(&self, vmid: u32) -> Result<()> {
        let mut vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(vm) = vms.get_mut(&vmid) {
            vm.running = false;
        }
        Ok(())
    }

    async fn destroy_vm(&self, vmid: u32) -> Result<()> {
        self.vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&vmid);
        Ok(())
    }

    async fn destroy_iso(&self, iso_volume: &str) -> Result<()> {
        self.isos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(iso_volume);
        Ok(())
    }

    async fn vm_status(&self, vmid: u32) -> Result<VmStatus> {
        let vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(vms.get(&vmid).map_or(
            VmStatus {
                present: false,
                running: false,
                tags: Vec::new(),
            },
            |vm| VmStatus {
                present: true,
                running: vm.running,
                tags: vm.tags.clone(),
            },
        ))
    }
}

/// In-memory cluster node directory.
#[derive(Debug, Default)]
pub struct FakeNodes {
    pub nodes: Mutex<BTreeMap<String, NodeRef>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node as if its k3s agent had joined.
    pub fn join(&self, name: &str, group_id: &str, vmid: u32) {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).insert(
            name.to_owned(),
            NodeRef {
                group_id: group_id.to_owned(),
                vmid,
            },
        );
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NodeDirectory for FakeNodes {
    async fn resolve(&self, node_name: &str) -> Result<Option<NodeRef>> {
        Ok(self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_name)
            .cloned())
    }

    async fn node_for_vmid(&self, group_id: &str, vmid: u32) -> Result<Option<String>> {
        Ok(self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, r)| r.group_id == group_id && r.vmid == vmid)
            .map(|(name, _)| name.clone()))
    }

    async fn delete_node(&self, node_name: &str) -> Result<()> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_name);
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node_name.to_owned());
        Ok(())
    }
}

/// A fully wired provider over fakes, with the state file in a tempdir.
pub struct Harness {
    pub config: Arc<Config>,
    pub store: Arc<StateDb>,
    pub proxmox: Arc<FakeProxmox>,
    pub nodes: Arc<FakeNodes>,
    pub controller: ScalingController<FakeNodes>,
    pub reconciler: Reconciler<FakeProxmox, FakeNodes>,
    pub shutdown: watch::Receiver<bool>,
    _dir: tempfile::TempDir,
}

/// Builds a config with one group `web` (min 0, max 3).
pub fn test_config(state_path: PathBuf) -> Config {
    Config {
        proxmox: ProxmoxConfig {
            endpoint: "https://pve.test:8006/api2/json".into(),
            token_id: "root@pam!test".into(),
            token_secret: "secret".into(),
            node: "pve1".into(),
            verify_tls: false,
            import_storage: "local".into(),
            iso_storage: "local".into(),
            vm_storage: "local-lvm".into(),
            bridge: "vmbr0".into(),
            cloud_image_url: "https://images.test/noble.img".into(),
        },
        cluster: ClusterConfig {
            k3s_version: "v1.30.4+k3s1".into(),
            server_url: "https://10.0.0.1:6443".into(),
            token: "join-token".into(),
            ssh_public_key: "ssh-ed25519 AAAA test@host".into(),
        },
        state_path,
        listen: "127.0.0.1:0".into(),
        pending_vm_timeout_secs: 900,
        reconcile_interval_secs: 20,
        groups: vec![GroupConfig {
            id: "web".into(),
            min_size: 0,
            max_size: 3,
            shape: InstanceShape {
                cores: 2,
                memory_mib: 4096,
                disk_gib: 32,
            },
            template: None,
        }],
    }
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(dir.path().join("state.db")));
    let store = Arc::new(StateDb::open(&config.state_path).expect("open store"));
    let proxmox = Arc::new(FakeProxmox::new());
    let nodes = Arc::new(FakeNodes::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = ScalingController::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&nodes),
        shutdown_tx,
    );
    let reconciler = Reconciler::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&proxmox),
        Arc::clone(&nodes),
        shutdown_rx.clone(),
    );

    Harness {
        config,
        store,
        proxmox,
        nodes,
        controller,
        reconciler,
        shutdown: shutdown_rx,
        _dir: dir,
    }
}
