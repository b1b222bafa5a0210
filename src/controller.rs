use std::fmt;

use tracing::{error, info};

use crate::config::{ShareConfig, ShareKind};
use crate::error::{Result, TransportError, VmediaError};
use crate::models::BootDevice;

pub type TransportResult = std::result::Result<(), TransportError>;

/// Where the controller finds staged artifacts and how it authenticates.
#[derive(Clone, PartialEq, Eq)]
pub struct ShareCoordinates {
    pub server: String,
    pub share_name: String,
    pub kind: ShareKind,
    pub user_domain: String,
    pub user_name: String,
    pub user_password: String,
}

impl ShareCoordinates {
    pub fn from_config(share: &ShareConfig) -> Self {
        Self {
            server: share.server.clone(),
            share_name: share.name.clone(),
            kind: share.kind,
            user_domain: share.user_domain.clone(),
            user_name: share.user_name.clone(),
            user_password: share.user_password.clone(),
        }
    }
}

impl fmt::Debug for ShareCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareCoordinates")
            .field("server", &self.server)
            .field("share_name", &self.share_name)
            .field("kind", &self.kind)
            .field("user_domain", &self.user_domain)
            .field("user_name", &self.user_name)
            .field("user_password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualDrive {
    Cdrom,
    Floppy,
}

impl VirtualDrive {
    fn insert_operation(&self) -> &'static str {
        match self {
            VirtualDrive::Cdrom => "inserting virtual cdrom",
            VirtualDrive::Floppy => "inserting virtual floppy",
        }
    }

    fn eject_operation(&self) -> &'static str {
        match self {
            VirtualDrive::Cdrom => "ejecting virtual cdrom",
            VirtualDrive::Floppy => "ejecting virtual floppy",
        }
    }
}

/// A single attach request, built fresh for every call.
#[derive(Debug, Clone)]
pub struct AttachCommand<'a> {
    pub drive: VirtualDrive,
    pub share: &'a ShareCoordinates,
    pub file_name: &'a str,
}

/// Virtual media primitives of one node's management controller.
///
/// Every call is synchronous: it returns once the controller has applied the
/// change. Detaching an empty drive must succeed.
pub trait MediaController: Send + Sync {
    fn attach_cd(&self, share: &ShareCoordinates, file_name: &str) -> TransportResult;
    fn attach_floppy(&self, share: &ShareCoordinates, file_name: &str) -> TransportResult;
    fn detach_cd(&self) -> TransportResult;
    fn detach_floppy(&self) -> TransportResult;
    fn set_boot_device(&self, device: BootDevice, persistent: bool) -> TransportResult;
}

pub fn attach_virtual_media(
    controller: &dyn MediaController,
    node_id: &str,
    cmd: &AttachCommand<'_>,
) -> Result<()> {
    let res = match cmd.drive {
        VirtualDrive::Cdrom => controller.attach_cd(cmd.share, cmd.file_name),
        VirtualDrive::Floppy => controller.attach_floppy(cmd.share, cmd.file_name),
    };
    tag(res, cmd.drive.insert_operation(), node_id)?;
    info!(node = node_id, drive = ?cmd.drive, file = cmd.file_name, "attached virtual media");
    Ok(())
}

pub fn detach_virtual_media(
    controller: &dyn MediaController,
    node_id: &str,
    drive: VirtualDrive,
) -> Result<()> {
    let res = match drive {
        VirtualDrive::Cdrom => controller.detach_cd(),
        VirtualDrive::Floppy => controller.detach_floppy(),
    };
    tag(res, drive.eject_operation(), node_id)?;
    info!(node = node_id, drive = ?drive, "detached virtual media");
    Ok(())
}

pub fn set_boot_device(
    controller: &dyn MediaController,
    node_id: &str,
    device: BootDevice,
    persistent: bool,
) -> Result<()> {
    tag(
        controller.set_boot_device(device, persistent),
        "setting boot device",
        node_id,
    )?;
    info!(node = node_id, ?device, persistent, "boot device set");
    Ok(())
}

fn tag(res: TransportResult, operation: &'static str, node_id: &str) -> Result<()> {
    res.map_err(|source| {
        error!(node = node_id, "error while {operation}: {source}");
        VmediaError::OutOfBand { operation, source }
    })
}
