use std::path::{Component, Path, PathBuf};

use crate::error::{Result, VmediaError};

/// Role of a file staged on the share for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactRole {
    DeployIso,
    BootIso,
    Floppy,
}

impl ArtifactRole {
    /// Deterministic share file name for this role on `node_id`.
    pub fn file_name(&self, node_id: &str) -> String {
        match self {
            ArtifactRole::DeployIso => format!("deploy-{node_id}.iso"),
            ArtifactRole::BootIso => format!("boot-{node_id}.iso"),
            ArtifactRole::Floppy => format!("image-{node_id}.img"),
        }
    }
}

pub fn deploy_iso_name(node_id: &str) -> String {
    ArtifactRole::DeployIso.file_name(node_id)
}

pub fn boot_iso_name(node_id: &str) -> String {
    ArtifactRole::BootIso.file_name(node_id)
}

pub fn floppy_image_name(node_id: &str) -> String {
    ArtifactRole::Floppy.file_name(node_id)
}

/// Layout of the locally mounted share.
#[derive(Debug, Clone)]
pub struct SharePaths {
    root: PathBuf,
}

impl SharePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full local path of an artifact. Only plain file names are accepted.
    pub fn artifact_path(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(VmediaError::InvalidParameter(format!(
                "'{name}' is not a plain file name on the share"
            ))),
        }
    }

    /// URL the image builder can read a share artifact from.
    pub fn artifact_url(&self, name: &str) -> Result<String> {
        Ok(format!("file://{}", self.artifact_path(name)?.display()))
    }
}
