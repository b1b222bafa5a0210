use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use uuid::Uuid;

use crate::error::{Result, VmediaError};
use crate::images::ImageService;
use crate::models::{BootMode, RamdiskParams};
use crate::sys::run_checked;
use crate::temp::TempManager;

/// Volume label the deploy ramdisk looks for when reading its parameters.
pub const FLOPPY_LABEL: &str = "ir-vfd-dev";
const FLOPPY_KIB: &str = "1440";
const ISO_VOLUME_ID: &str = "VMEDIA_BOOT_ISO";

/// Inputs of a boot ISO build.
#[derive(Debug, Clone, Copy)]
pub struct BootIsoSpec<'a> {
    pub kernel: &'a str,
    pub ramdisk: &'a str,
    /// Deploy ISO the UEFI boot image is taken from.
    pub deploy_iso: &'a str,
    pub root_identifier: &'a str,
    pub kernel_params: &'a str,
    pub boot_mode: BootMode,
}

/// Produces ISO and floppy image content.
pub trait ArtifactBuilder: Send + Sync {
    fn build_boot_iso(&self, dest: &Path, spec: &BootIsoSpec<'_>) -> Result<()>;
    fn build_parameter_floppy(&self, dest: &Path, params: &RamdiskParams) -> Result<()>;
}

impl<T: ArtifactBuilder + ?Sized> ArtifactBuilder for Arc<T> {
    fn build_boot_iso(&self, dest: &Path, spec: &BootIsoSpec<'_>) -> Result<()> {
        (**self).build_boot_iso(dest, spec)
    }

    fn build_parameter_floppy(&self, dest: &Path, params: &RamdiskParams) -> Result<()> {
        (**self).build_parameter_floppy(dest, params)
    }
}

/// `parameters.txt` content: one `key=value` line per parameter.
pub fn parameters_file(params: &RamdiskParams) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

/// Kernel command line for the deployed instance.
pub fn kernel_command_line(root_identifier: &str, kernel_params: &str) -> String {
    let root = if Uuid::parse_str(root_identifier).is_ok() {
        format!("root=UUID={root_identifier}")
    } else {
        format!("root={root_identifier}")
    };
    let extra = kernel_params.trim();
    if extra.is_empty() {
        root
    } else {
        format!("{root} {extra}")
    }
}

pub fn isolinux_cfg(cmdline: &str) -> String {
    format!(
        r#"default boot

label boot
kernel /vmlinuz
append initrd=/initrd text {cmdline} --
"#
    )
}

pub fn grub_cfg(cmdline: &str) -> String {
    format!(
        r#"set default=0
set timeout=5
set hidden_timeout_quiet=false

menuentry "boot_partition" {{
linuxefi /vmlinuz {cmdline} --
initrdefi /initrd
}}
"#
    )
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path {} is not valid UTF-8", path.display()))
}

/// Builds artifacts with `mkfs.vfat`/`mcopy`, `xorriso` and `mkisofs`.
pub struct CommandArtifactBuilder {
    images: Arc<dyn ImageService>,
    temp: TempManager,
    isolinux_bin: PathBuf,
    ldlinux_c32: Option<PathBuf>,
}

impl CommandArtifactBuilder {
    pub fn new(images: Arc<dyn ImageService>, temp: TempManager) -> Self {
        Self {
            images,
            temp,
            isolinux_bin: PathBuf::from("/usr/lib/syslinux/isolinux.bin"),
            ldlinux_c32: Some(PathBuf::from("/usr/lib/syslinux/ldlinux.c32")),
        }
    }

    pub fn with_isolinux(mut self, isolinux_bin: PathBuf, ldlinux_c32: Option<PathBuf>) -> Self {
        self.isolinux_bin = isolinux_bin;
        self.ldlinux_c32 = ldlinux_c32;
        self
    }

    fn floppy(&self, dest: &Path, params: &RamdiskParams) -> anyhow::Result<()> {
        let scratch = self.temp.scratch_dir()?;
        let params_path = scratch.path().join("parameters.txt");
        fs::write(&params_path, parameters_file(params)).context("writing parameters.txt")?;
        // mkfs.vfat -C refuses to overwrite
        if dest.exists() {
            fs::remove_file(dest).context("clearing floppy destination")?;
        }
        let dest = path_str(dest)?;
        run_checked("mkfs.vfat", &["-C", "-n", FLOPPY_LABEL, dest, FLOPPY_KIB])?;
        run_checked(
            "mcopy",
            &["-i", dest, path_str(&params_path)?, "::parameters.txt"],
        )?;
        Ok(())
    }

    fn boot_iso(&self, dest: &Path, spec: &BootIsoSpec<'_>) -> anyhow::Result<()> {
        let scratch = self.temp.scratch_dir()?;
        let tree = scratch.path().join("iso");
        fs::create_dir_all(&tree)?;
        self.images
            .fetch(spec.kernel, &tree.join("vmlinuz"))
            .context("fetching kernel")?;
        self.images
            .fetch(spec.ramdisk, &tree.join("initrd"))
            .context("fetching ramdisk")?;
        let cmdline = kernel_command_line(spec.root_identifier, spec.kernel_params);
        let dest = path_str(dest)?;
        let tree_arg = path_str(&tree)?;

        match spec.boot_mode {
            BootMode::Bios => {
                let isolinux_dir = tree.join("isolinux");
                fs::create_dir_all(&isolinux_dir)?;
                fs::copy(&self.isolinux_bin, isolinux_dir.join("isolinux.bin"))
                    .with_context(|| format!("copying {}", self.isolinux_bin.display()))?;
                if let Some(ldlinux) = &self.ldlinux_c32 {
                    fs::copy(ldlinux, isolinux_dir.join("ldlinux.c32"))
                        .with_context(|| format!("copying {}", ldlinux.display()))?;
                }
                fs::write(isolinux_dir.join("isolinux.cfg"), isolinux_cfg(&cmdline))?;
                run_checked(
                    "mkisofs",
                    &[
                        "-r", "-V", ISO_VOLUME_ID, "-cache-inodes", "-J", "-l",
                        "-b", "isolinux/isolinux.bin", "-no-emul-boot",
                        "-boot-load-size", "4", "-boot-info-table",
                        "-o", dest, tree_arg,
                    ],
                )?;
            }
            BootMode::Uefi => {
                let deploy_iso = scratch.path().join("deploy.iso");
                self.images
                    .fetch(spec.deploy_iso, &deploy_iso)
                    .context("fetching deploy ISO")?;
                let images_dir = tree.join("images");
                let grub_dir = tree.join("boot").join("grub");
                fs::create_dir_all(&images_dir)?;
                fs::create_dir_all(&grub_dir)?;
                let efiboot = images_dir.join("efiboot.img");
                run_checked(
                    "xorriso",
                    &[
                        "-osirrox", "on", "-indev", path_str(&deploy_iso)?,
                        "-extract", "/images/efiboot.img", path_str(&efiboot)?,
                    ],
                )
                .context("extracting EFI boot image from deploy ISO")?;
                fs::write(grub_dir.join("grub.cfg"), grub_cfg(&cmdline))?;
                run_checked(
                    "mkisofs",
                    &[
                        "-r", "-V", ISO_VOLUME_ID, "-l",
                        "-e", "images/efiboot.img", "-no-emul-boot",
                        "-o", dest, tree_arg,
                    ],
                )?;
            }
        }
        Ok(())
    }
}

impl ArtifactBuilder for CommandArtifactBuilder {
    fn build_boot_iso(&self, dest: &Path, spec: &BootIsoSpec<'_>) -> Result<()> {
        self.boot_iso(dest, spec)
            .map_err(|e| VmediaError::ArtifactBuild {
                artifact: format!("boot ISO {}", dest.display()),
                reason: format!("{e:#}"),
            })
    }

    fn build_parameter_floppy(&self, dest: &Path, params: &RamdiskParams) -> Result<()> {
        self.floppy(dest, params)
            .map_err(|e| VmediaError::ArtifactBuild {
                artifact: "parameter floppy".into(),
                reason: format!("{e:#}"),
            })
    }
}
