#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use vmedia_boot::{
    ArtifactBuilder, BootDevice, BootIsoSpec, BootMode, ImageService, MediaController,
    MountTable, NodeBootContext, Port, ProvisionState, RamdiskParams, Result, ShareCoordinates,
    SqliteNodeStore, TransportResult, VirtualMediaBoot, VmediaConfig, VmediaError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AttachCd(String),
    AttachFloppy(String),
    DetachCd,
    DetachFloppy,
    BootDevice(BootDevice, bool),
}

#[derive(Debug, Default)]
struct ControllerState {
    calls: Vec<Call>,
    cd: Option<String>,
    floppy: Option<String>,
    fail_on: Option<&'static str>,
}

/// Controller double that tracks what is inserted in each drive.
#[derive(Debug, Clone, Default)]
pub struct FakeController(Arc<Mutex<ControllerState>>);

impl FakeController {
    pub fn with_media(cd: Option<&str>, floppy: Option<&str>) -> Self {
        let ctrl = Self::default();
        {
            let mut state = ctrl.0.lock().unwrap();
            state.cd = cd.map(str::to_string);
            state.floppy = floppy.map(str::to_string);
        }
        ctrl
    }

    /// Make the named primitive fail: attach_cd, attach_floppy, detach_cd,
    /// detach_floppy or set_boot_device.
    pub fn fail_on(&self, op: Option<&'static str>) {
        self.0.lock().unwrap().fail_on = op;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.0.lock().unwrap().calls.clear();
    }

    pub fn cd(&self) -> Option<String> {
        self.0.lock().unwrap().cd.clone()
    }

    pub fn floppy(&self) -> Option<String> {
        self.0.lock().unwrap().floppy.clone()
    }

    fn apply(&self, op: &'static str, call: Call) -> TransportResult {
        let mut state = self.0.lock().unwrap();
        if state.fail_on == Some(op) {
            return Err(format!("{op} rejected by controller").into());
        }
        match &call {
            Call::AttachCd(file) => state.cd = Some(file.clone()),
            Call::AttachFloppy(file) => state.floppy = Some(file.clone()),
            Call::DetachCd => state.cd = None,
            Call::DetachFloppy => state.floppy = None,
            Call::BootDevice(..) => {}
        }
        state.calls.push(call);
        Ok(())
    }
}

impl MediaController for FakeController {
    fn attach_cd(&self, _share: &ShareCoordinates, file_name: &str) -> TransportResult {
        self.apply("attach_cd", Call::AttachCd(file_name.to_string()))
    }

    fn attach_floppy(&self, _share: &ShareCoordinates, file_name: &str) -> TransportResult {
        self.apply("attach_floppy", Call::AttachFloppy(file_name.to_string()))
    }

    fn detach_cd(&self) -> TransportResult {
        self.apply("detach_cd", Call::DetachCd)
    }

    fn detach_floppy(&self) -> TransportResult {
        self.apply("detach_floppy", Call::DetachFloppy)
    }

    fn set_boot_device(&self, device: BootDevice, persistent: bool) -> TransportResult {
        self.apply("set_boot_device", Call::BootDevice(device, persistent))
    }
}

type FetchHook = Box<dyn Fn(&str) + Send>;

/// Image service that writes a marker naming the reference it fetched.
#[derive(Default)]
pub struct FakeImages {
    pub fetched: Mutex<Vec<(String, PathBuf)>>,
    pub properties: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    on_fetch: Mutex<Option<FetchHook>>,
}

impl FakeImages {
    /// Run `hook` with the reference at the start of every fetch.
    pub fn on_fetch(&self, hook: impl Fn(&str) + Send + 'static) {
        *self.on_fetch.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fetched_refs(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn set_properties(&self, reference: &str, props: &[(&str, &str)]) {
        self.properties.lock().unwrap().insert(
            reference.to_string(),
            props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
}

impl ImageService for FakeImages {
    fn fetch(&self, reference: &str, dest: &Path) -> Result<()> {
        if let Some(hook) = self.on_fetch.lock().unwrap().as_ref() {
            hook(reference);
        }
        if reference.contains("unreachable") {
            return Err(VmediaError::ImageFetch {
                reference: reference.to_string(),
                reason: "connection refused".into(),
            });
        }
        fs::write(dest, format!("image:{reference}"))?;
        self.fetched
            .lock()
            .unwrap()
            .push((reference.to_string(), dest.to_path_buf()));
        Ok(())
    }

    fn image_properties(&self, reference: &str, keys: &[&str]) -> Result<BTreeMap<String, String>> {
        let props = self.properties.lock().unwrap();
        Ok(props
            .get(reference)
            .map(|all| {
                all.iter()
                    .filter(|(k, _)| keys.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootIsoBuild {
    pub dest: PathBuf,
    pub kernel: String,
    pub ramdisk: String,
    pub deploy_iso: String,
    pub root_identifier: String,
    pub kernel_params: String,
    pub boot_mode: BootMode,
}

#[derive(Debug, Default)]
pub struct FakeBuilder {
    pub boot_isos: Mutex<Vec<BootIsoBuild>>,
    pub floppies: Mutex<Vec<RamdiskParams>>,
}

impl ArtifactBuilder for FakeBuilder {
    fn build_boot_iso(&self, dest: &Path, spec: &BootIsoSpec<'_>) -> Result<()> {
        fs::write(dest, b"boot-iso")?;
        self.boot_isos.lock().unwrap().push(BootIsoBuild {
            dest: dest.to_path_buf(),
            kernel: spec.kernel.to_string(),
            ramdisk: spec.ramdisk.to_string(),
            deploy_iso: spec.deploy_iso.to_string(),
            root_identifier: spec.root_identifier.to_string(),
            kernel_params: spec.kernel_params.to_string(),
            boot_mode: spec.boot_mode,
        });
        Ok(())
    }

    fn build_parameter_floppy(&self, dest: &Path, params: &RamdiskParams) -> Result<()> {
        fs::write(dest, vmedia_boot::builder::parameters_file(params))?;
        self.floppies.lock().unwrap().push(params.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub struct Mounts(AtomicBool);

impl Mounts {
    pub fn set(&self, mounted: bool) {
        self.0.store(mounted, Ordering::SeqCst);
    }
}

impl MountTable for Mounts {
    fn is_mount_point(&self, _path: &Path) -> io::Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

pub type TestBoot = VirtualMediaBoot<Arc<FakeImages>, Arc<FakeBuilder>, Arc<SqliteNodeStore>>;

pub struct Harness {
    pub share: TempDir,
    pub scratch: TempDir,
    pub mounts: Arc<Mounts>,
    pub images: Arc<FakeImages>,
    pub builder: Arc<FakeBuilder>,
    pub store: Arc<SqliteNodeStore>,
    pub boot: TestBoot,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut VmediaConfig)) -> Self {
        let share = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut config = VmediaConfig::default();
        config.share.root = share.path().to_path_buf();
        config.share.server = "10.0.0.5".into();
        config.scratch_dir = Some(scratch.path().to_path_buf());
        tweak(&mut config);

        let mounts = Arc::new(Mounts(AtomicBool::new(true)));
        let images = Arc::new(FakeImages::default());
        let builder = Arc::new(FakeBuilder::default());
        let store = Arc::new(SqliteNodeStore::open_in_memory().unwrap());
        let boot = VirtualMediaBoot::new(
            config,
            mounts.clone(),
            images.clone(),
            builder.clone(),
            store.clone(),
        )
        .unwrap();
        Self {
            share,
            scratch,
            mounts,
            images,
            builder,
            store,
            boot,
        }
    }

    pub fn share_file(&self, name: &str) -> PathBuf {
        self.share.path().join(name)
    }

    /// Names of the files currently on the share.
    pub fn share_listing(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.share.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

/// Node `N1` as the provisioning pipeline hands it over during deploy.
pub fn deploying_node(node_id: &str) -> NodeBootContext {
    let mut ctx = NodeBootContext::new(node_id, ProvisionState::Deploying);
    ctx.driver_info.deploy_iso = Some("http://img/deploy.iso".into());
    ctx.instance_info.image_source = Some("http://img/root.qcow2".into());
    ctx.instance_info.kernel = Some("http://img/vmlinuz".into());
    ctx.instance_info.ramdisk = Some("http://img/initrd".into());
    ctx.ports = vec![
        Port {
            mac_address: "52:54:00:00:00:01".into(),
            vif_port_id: None,
        },
        Port {
            mac_address: "aa:bb:cc:dd:ee:ff".into(),
            vif_port_id: Some("vif-0001".into()),
        },
    ];
    ctx
}
