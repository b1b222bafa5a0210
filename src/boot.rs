//! Virtual media boot of bare-metal nodes.
//!
//! [`VirtualMediaBoot`] drives the four provisioning hooks (ramdisk
//! preparation and cleanup, instance preparation and cleanup) plus the
//! reattach helper used after a control-plane restart. Images are staged on
//! the network share and handed to the node's management controller as a
//! virtual CD, with ramdisk parameters on a virtual floppy.
//!
//! Attach is never additive: both drives are ejected before anything is
//! inserted, because the controller may hold media this process knows
//! nothing about.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::builder::{ArtifactBuilder, BootIsoSpec};
use crate::config::VmediaConfig;
use crate::controller::{
    attach_virtual_media, detach_virtual_media, set_boot_device, AttachCommand, MediaController,
    ShareCoordinates, VirtualDrive,
};
use crate::db::NodeStore;
use crate::error::{Result, VmediaError};
use crate::images::{is_catalog_image, ImageService};
use crate::logging::OpsLogger;
use crate::models::{BootDevice, NodeBootContext, ProvisionState, RamdiskParams};
use crate::paths::{boot_iso_name, deploy_iso_name, floppy_image_name, SharePaths};
use crate::share::ShareStaging;
use crate::sys::MountTable;
use crate::temp::TempManager;

const KERNEL_PROPS: [&str; 2] = ["kernel_id", "ramdisk_id"];

static REQUIRED_PROPERTIES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([("deploy_iso", "Deployment ISO image file name. Required.")])
});

/// Driver properties a node must carry to boot over virtual media.
pub fn required_properties() -> &'static BTreeMap<&'static str, &'static str> {
    &REQUIRED_PROPERTIES
}

pub struct VirtualMediaBoot<I, B, S> {
    config: VmediaConfig,
    share: ShareStaging,
    coords: ShareCoordinates,
    temp: TempManager,
    images: I,
    builder: B,
    store: S,
    ops: Option<Arc<OpsLogger>>,
}

impl<I, B, S> VirtualMediaBoot<I, B, S>
where
    I: ImageService,
    B: ArtifactBuilder,
    S: NodeStore,
{
    /// Fails if the share is not mounted yet.
    pub fn new(
        config: VmediaConfig,
        mounts: Arc<dyn MountTable>,
        images: I,
        builder: B,
        store: S,
    ) -> Result<Self> {
        let share = ShareStaging::new(SharePaths::new(&config.share.root), mounts);
        share.verify_mounted()?;
        let temp = TempManager::from_config(config.scratch_dir.as_ref())?;
        let ops = match &config.ops_log {
            Some(path) => Some(Arc::new(OpsLogger::new(path)?)),
            None => None,
        };
        let coords = ShareCoordinates::from_config(&config.share);
        Ok(Self {
            config,
            share,
            coords,
            temp,
            images,
            builder,
            store,
            ops,
        })
    }

    pub fn config(&self) -> &VmediaConfig {
        &self.config
    }

    pub fn share(&self) -> &ShareStaging {
        &self.share
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Check that the node carries everything a virtual media deploy needs.
    pub fn validate(&self, ctx: &NodeBootContext) -> Result<()> {
        self.share.verify_mounted()?;
        let deploy_iso = self.deploy_iso_ref(ctx)?;
        if self.images.is_ordinary_file_name(deploy_iso) {
            self.check_share_file(deploy_iso, "Deploy ISO", ctx)?;
        }
        if let Some(boot_iso) = ctx.instance_info.boot_iso.as_deref() {
            if self.images.is_ordinary_file_name(boot_iso) {
                self.check_share_file(boot_iso, "Boot ISO", ctx)?;
            }
        }
        if ctx.is_whole_disk_image {
            return Ok(());
        }

        let image_source = image_source(ctx)?;
        let missing: Vec<&str> = if is_catalog_image(image_source) {
            let props = self.images.image_properties(image_source, &KERNEL_PROPS)?;
            KERNEL_PROPS
                .iter()
                .copied()
                .filter(|key| !props.contains_key(*key))
                .collect()
        } else {
            let info = &ctx.instance_info;
            [("kernel", &info.kernel), ("ramdisk", &info.ramdisk)]
                .into_iter()
                .filter(|(_, value)| value.is_none())
                .map(|(key, _)| key)
                .collect()
        };
        if !missing.is_empty() {
            return Err(VmediaError::MissingParameter(format!(
                "image {image_source} of node {} lacks: {}",
                ctx.node_id,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Boot the node into the deploy ramdisk from the deploy ISO.
    ///
    /// Only acts while deploying or cleaning; a takeover re-running the hook
    /// in any other state must leave the node alone.
    pub fn prepare_ramdisk(
        &self,
        ctx: &mut NodeBootContext,
        controller: &dyn MediaController,
        mut params: RamdiskParams,
    ) -> Result<()> {
        self.share.verify_mounted()?;
        if !matches!(
            ctx.provision_state,
            ProvisionState::Deploying | ProvisionState::Cleaning
        ) {
            debug!(node = %ctx.node_id, state = ctx.provision_state.as_str(), "skipping ramdisk preparation");
            return Ok(());
        }

        let mac = ctx.boot_interface_mac().ok_or_else(|| {
            VmediaError::MissingParameter(format!(
                "node {} has no port attached to the provisioning network",
                ctx.node_id
            ))
        })?;
        params.insert("BOOTIF".into(), mac.to_string());

        let href = self.deploy_iso_ref(ctx)?;
        let share_local = self.images.is_ordinary_file_name(href);
        if share_local {
            self.check_share_file(href, "Deploy ISO", ctx)?;
        }
        // A previous deploy-<node>.iso may still sit in the drive; eject before overwriting it.
        self.eject_all(&ctx.node_id, controller)?;
        let deploy_iso = if share_local {
            href.to_string()
        } else {
            self.share
                .fetch_remote_image(&self.images, href, &deploy_iso_name(&ctx.node_id))?
        };
        if ctx.deploy_iso_name.as_deref() != Some(deploy_iso.as_str()) {
            ctx.deploy_iso_name = Some(deploy_iso.clone());
            self.store.save(ctx)?;
        }

        self.insert_media(ctx, controller, &deploy_iso, Some(&params))?;
        set_boot_device(controller, &ctx.node_id, BootDevice::Cdrom, false)?;
        self.audit("prepare_ramdisk", ctx, &deploy_iso);
        Ok(())
    }

    /// Eject both drives and delete the deploy-phase artifacts.
    pub fn clean_up_ramdisk(
        &self,
        ctx: &mut NodeBootContext,
        controller: &dyn MediaController,
    ) -> Result<()> {
        self.share.verify_mounted()?;
        self.cleanup_vmedia_boot(ctx, controller)?;
        self.audit("clean_up_ramdisk", ctx, "");
        Ok(())
    }

    /// Configure the final boot of the deployed instance.
    pub fn prepare_instance(
        &self,
        ctx: &mut NodeBootContext,
        controller: &dyn MediaController,
    ) -> Result<()> {
        self.share.verify_mounted()?;
        self.cleanup_vmedia_boot(ctx, controller)?;

        if ctx.boots_from_local_disk() {
            set_boot_device(controller, &ctx.node_id, BootDevice::Disk, true)?;
            self.audit("prepare_instance", ctx, "local disk");
            return Ok(());
        }

        let root = ctx.root_identifier.clone().ok_or_else(|| {
            VmediaError::MissingParameter(format!(
                "node {} has no root identifier to boot from",
                ctx.node_id
            ))
        })?;
        let boot_iso = self.prepare_boot_iso(ctx, &root)?;
        self.setup_vmedia(ctx, controller, &boot_iso, None)?;
        set_boot_device(controller, &ctx.node_id, BootDevice::Cdrom, true)?;
        self.audit("prepare_instance", ctx, &boot_iso);
        Ok(())
    }

    /// Tear down the instance boot and forget its boot ISO.
    pub fn clean_up_instance(
        &self,
        ctx: &mut NodeBootContext,
        controller: &dyn MediaController,
    ) -> Result<()> {
        self.share.verify_mounted()?;
        self.share.remove_artifact(&boot_iso_name(&ctx.node_id));
        ctx.boot_iso_name = None;
        ctx.root_identifier = None;
        self.store.save(ctx)?;
        self.cleanup_vmedia_boot(ctx, controller)?;
        self.audit("clean_up_instance", ctx, "");
        Ok(())
    }

    /// Re-insert the recorded boot ISO of an active node without rebuilding it.
    pub fn attach_boot_iso_if_needed(
        &self,
        ctx: &NodeBootContext,
        controller: &dyn MediaController,
    ) -> Result<()> {
        self.share.verify_mounted()?;
        let Some(boot_iso) = ctx.boot_iso_name.as_deref() else {
            return Ok(());
        };
        if ctx.provision_state != ProvisionState::Active {
            return Ok(());
        }
        self.setup_vmedia(ctx, controller, boot_iso, None)?;
        set_boot_device(controller, &ctx.node_id, BootDevice::Cdrom, true)?;
        self.audit("attach_boot_iso", ctx, boot_iso);
        Ok(())
    }

    fn setup_vmedia(
        &self,
        ctx: &NodeBootContext,
        controller: &dyn MediaController,
        iso: &str,
        params: Option<&RamdiskParams>,
    ) -> Result<()> {
        self.eject_all(&ctx.node_id, controller)?;
        self.insert_media(ctx, controller, iso, params)
    }

    fn eject_all(&self, node_id: &str, controller: &dyn MediaController) -> Result<()> {
        detach_virtual_media(controller, node_id, VirtualDrive::Cdrom)?;
        detach_virtual_media(controller, node_id, VirtualDrive::Floppy)
    }

    /// Second half of the setup sequence; both drives must already be empty.
    fn insert_media(
        &self,
        ctx: &NodeBootContext,
        controller: &dyn MediaController,
        iso: &str,
        params: Option<&RamdiskParams>,
    ) -> Result<()> {
        let node_id = ctx.node_id.as_str();
        info!(node = node_id, iso, "setting up node to boot from virtual media");

        if let Some(params) = params.filter(|p| !p.is_empty()) {
            let floppy = self.prepare_floppy_image(node_id, params)?;
            attach_virtual_media(
                controller,
                node_id,
                &AttachCommand {
                    drive: VirtualDrive::Floppy,
                    share: &self.coords,
                    file_name: &floppy,
                },
            )?;
        }

        attach_virtual_media(
            controller,
            node_id,
            &AttachCommand {
                drive: VirtualDrive::Cdrom,
                share: &self.coords,
                file_name: iso,
            },
        )
    }

    fn cleanup_vmedia_boot(
        &self,
        ctx: &mut NodeBootContext,
        controller: &dyn MediaController,
    ) -> Result<()> {
        debug!(node = %ctx.node_id, "cleaning up after virtual media boot");
        self.eject_all(&ctx.node_id, controller)?;

        self.share.remove_artifact(&floppy_image_name(&ctx.node_id));
        self.share.remove_artifact(&deploy_iso_name(&ctx.node_id));

        if ctx.deploy_iso_name.take().is_some() {
            self.store.save(ctx)?;
        }
        Ok(())
    }

    fn prepare_floppy_image(&self, node_id: &str, params: &RamdiskParams) -> Result<String> {
        let scratch = self.temp.scratch_file(".img")?;
        self.builder.build_parameter_floppy(scratch.path(), params)?;
        self.share
            .stage_local_file(scratch.path(), &floppy_image_name(node_id))
    }

    /// Stage or build the boot ISO and record its name before anything is attached.
    fn prepare_boot_iso(&self, ctx: &mut NodeBootContext, root: &str) -> Result<String> {
        let name = match ctx.instance_info.boot_iso.clone() {
            Some(href) if self.images.is_ordinary_file_name(&href) => {
                self.check_share_file(&href, "Boot ISO", ctx)?;
                href
            }
            // Always re-fetched; a stale copy under the same name is overwritten.
            Some(href) => self.share.fetch_remote_image(
                &self.images,
                &href,
                &boot_iso_name(&ctx.node_id),
            )?,
            None => self.build_boot_iso(ctx, root)?,
        };
        ctx.boot_iso_name = Some(name.clone());
        self.store.save(ctx)?;
        Ok(name)
    }

    fn build_boot_iso(&self, ctx: &NodeBootContext, root: &str) -> Result<String> {
        self.share.verify_mounted()?;
        let (kernel, ramdisk) = self.resolve_kernel_ramdisk(ctx)?;
        let deploy_iso = self.inner_deploy_iso(ctx)?;
        let name = boot_iso_name(&ctx.node_id);
        let dest = self.share.paths().artifact_path(&name)?;
        let spec = BootIsoSpec {
            kernel: &kernel,
            ramdisk: &ramdisk,
            deploy_iso: &deploy_iso,
            root_identifier: root,
            kernel_params: &self.config.kernel_append_params,
            boot_mode: ctx.boot_mode,
        };
        self.builder.build_boot_iso(&dest, &spec)?;
        info!(node = %ctx.node_id, artifact = %name, "built boot ISO");
        Ok(name)
    }

    /// Kernel and ramdisk from instance info, falling back to catalog properties.
    fn resolve_kernel_ramdisk(&self, ctx: &NodeBootContext) -> Result<(String, String)> {
        let info = &ctx.instance_info;
        if let (Some(kernel), Some(ramdisk)) = (&info.kernel, &info.ramdisk) {
            return Ok((kernel.clone(), ramdisk.clone()));
        }
        let props = self
            .images
            .image_properties(image_source(ctx)?, &KERNEL_PROPS)?;
        let pick = |own: &Option<String>, key: &str| {
            own.clone()
                .or_else(|| props.get(key).cloned())
                .ok_or_else(|| {
                    VmediaError::MissingParameter(format!(
                        "no {key} for the image of node {}",
                        ctx.node_id
                    ))
                })
        };
        Ok((pick(&info.kernel, "kernel_id")?, pick(&info.ramdisk, "ramdisk_id")?))
    }

    /// Deploy ISO reference handed to the builder. The node-derived copy is
    /// already gone by now, so only a share file the operator placed is used
    /// locally; anything else is read from its original source.
    fn inner_deploy_iso(&self, ctx: &NodeBootContext) -> Result<String> {
        let href = self.deploy_iso_ref(ctx)?;
        if self.images.is_ordinary_file_name(href) {
            self.share.paths().artifact_url(href)
        } else {
            Ok(href.to_string())
        }
    }

    fn deploy_iso_ref<'c>(&self, ctx: &'c NodeBootContext) -> Result<&'c str> {
        ctx.driver_info.deploy_iso.as_deref().ok_or_else(|| {
            VmediaError::MissingParameter(format!(
                "node {} driver info lacks deploy_iso",
                ctx.node_id
            ))
        })
    }

    fn check_share_file(&self, name: &str, what: &str, ctx: &NodeBootContext) -> Result<()> {
        if self.share.artifact_exists(name)? {
            return Ok(());
        }
        Err(VmediaError::InvalidParameter(format!(
            "{what} file, {}, not found for node: {}",
            self.share.paths().root().join(name).display(),
            ctx.node_id
        )))
    }

    fn audit(&self, action: &str, ctx: &NodeBootContext, artifact: &str) {
        let Some(ops) = &self.ops else { return };
        let detail = if artifact.is_empty() {
            format!("node={}", ctx.node_id)
        } else {
            format!("node={} artifact={artifact}", ctx.node_id)
        };
        if let Err(e) = ops.log_line(action, detail) {
            warn!(node = %ctx.node_id, "failed to write ops log: {e}");
        }
    }
}

fn image_source(ctx: &NodeBootContext) -> Result<&str> {
    ctx.instance_info.image_source.as_deref().ok_or_else(|| {
        VmediaError::MissingParameter(format!(
            "node {} instance info lacks image_source",
            ctx.node_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::db::SqliteNodeStore;
    use crate::images::DirectoryImageService;
    use crate::share::tests::FixedMounts;

    const IMAGE_ID: &str = "8a3c4f8e-9a43-4d9e-9d53-2f6a3b1c0e77";

    struct NoBuild;

    impl ArtifactBuilder for NoBuild {
        fn build_boot_iso(&self, _: &Path, _: &BootIsoSpec<'_>) -> Result<()> {
            Err(VmediaError::Message("unexpected build".into()))
        }
        fn build_parameter_floppy(&self, _: &Path, _: &RamdiskParams) -> Result<()> {
            Err(VmediaError::Message("unexpected build".into()))
        }
    }

    struct Fixture {
        share: tempfile::TempDir,
        catalog: tempfile::TempDir,
        boot: VirtualMediaBoot<DirectoryImageService, NoBuild, SqliteNodeStore>,
    }

    fn fixture() -> Fixture {
        let share = tempfile::tempdir().unwrap();
        let catalog = tempfile::tempdir().unwrap();
        let mut config = VmediaConfig::default();
        config.share.root = share.path().to_path_buf();
        config.scratch_dir = Some(share.path().join(".scratch"));
        let boot = VirtualMediaBoot::new(
            config,
            FixedMounts::mounted(true),
            DirectoryImageService::new(catalog.path()),
            NoBuild,
            SqliteNodeStore::open_in_memory().unwrap(),
        )
        .unwrap();
        Fixture {
            share,
            catalog,
            boot,
        }
    }

    fn node() -> NodeBootContext {
        let mut ctx = NodeBootContext::new("n1", ProvisionState::Deploying);
        ctx.driver_info.deploy_iso = Some("http://img/deploy.iso".into());
        ctx.instance_info.image_source = Some("http://img/root.qcow2".into());
        ctx.instance_info.kernel = Some("http://img/vmlinuz".into());
        ctx.instance_info.ramdisk = Some("http://img/initrd".into());
        ctx
    }

    #[test]
    fn construction_requires_mounted_share() {
        let share = tempfile::tempdir().unwrap();
        let mut config = VmediaConfig::default();
        config.share.root = share.path().to_path_buf();
        let res = VirtualMediaBoot::new(
            config,
            FixedMounts::mounted(false),
            DirectoryImageService::new(share.path()),
            NoBuild,
            SqliteNodeStore::open_in_memory().unwrap(),
        );
        assert!(matches!(
            res,
            Err(VmediaError::SharedFilesystemUnavailable { .. })
        ));
    }

    #[test]
    fn required_properties_name_deploy_iso() {
        assert!(required_properties().contains_key("deploy_iso"));
    }

    #[test]
    fn validate_accepts_complete_node() {
        let fx = fixture();
        fx.boot.validate(&node()).unwrap();
    }

    #[test]
    fn validate_requires_deploy_iso() {
        let fx = fixture();
        let mut ctx = node();
        ctx.driver_info.deploy_iso = None;
        assert!(matches!(
            fx.boot.validate(&ctx),
            Err(VmediaError::MissingParameter(_))
        ));
    }

    #[test]
    fn validate_checks_share_local_files_exist() {
        let fx = fixture();
        let mut ctx = node();
        ctx.driver_info.deploy_iso = Some("deploy.iso".into());
        assert!(matches!(
            fx.boot.validate(&ctx),
            Err(VmediaError::InvalidParameter(_))
        ));
        fs::write(fx.share.path().join("deploy.iso"), b"iso").unwrap();
        fx.boot.validate(&ctx).unwrap();

        ctx.instance_info.boot_iso = Some("boot.iso".into());
        assert!(matches!(
            fx.boot.validate(&ctx),
            Err(VmediaError::InvalidParameter(_))
        ));
    }

    #[test]
    fn validate_requires_kernel_and_ramdisk_for_partition_images() {
        let fx = fixture();
        let mut ctx = node();
        ctx.instance_info.ramdisk = None;
        let err = fx.boot.validate(&ctx).unwrap_err();
        assert!(err.to_string().contains("ramdisk"), "{err}");

        ctx.is_whole_disk_image = true;
        fx.boot.validate(&ctx).unwrap();
    }

    #[test]
    fn validate_reads_catalog_properties() {
        let fx = fixture();
        fs::write(fx.catalog.path().join(IMAGE_ID), b"img").unwrap();
        fs::write(
            fx.catalog.path().join(format!("{IMAGE_ID}.json")),
            r#"{"kernel_id": "k"}"#,
        )
        .unwrap();
        let mut ctx = node();
        ctx.instance_info.image_source = Some(IMAGE_ID.into());
        let err = fx.boot.validate(&ctx).unwrap_err();
        assert!(err.to_string().contains("ramdisk_id"), "{err}");
    }
}
