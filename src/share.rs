//! Staging of artifacts on the network share read by the controller.
//!
//! Every write goes through [`ShareStaging::verify_mounted`] first: if the
//! share is not mounted, writing under its root would land on local disk
//! where the controller can never see it.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, VmediaError};
use crate::images::ImageService;
use crate::paths::SharePaths;
use crate::sys::MountTable;

#[derive(Clone)]
pub struct ShareStaging {
    paths: SharePaths,
    mounts: Arc<dyn MountTable>,
}

impl ShareStaging {
    pub fn new(paths: SharePaths, mounts: Arc<dyn MountTable>) -> Self {
        Self { paths, mounts }
    }

    pub fn paths(&self) -> &SharePaths {
        &self.paths
    }

    /// Fail unless the share root is a mounted directory.
    pub fn verify_mounted(&self) -> Result<()> {
        let root = self.paths.root();
        let unavailable = |reason: String| VmediaError::SharedFilesystemUnavailable {
            share: root.to_path_buf(),
            reason,
        };
        if !root.is_dir() {
            return Err(unavailable("not a directory or does not exist".into()));
        }
        match self.mounts.is_mount_point(root) {
            Ok(true) => Ok(()),
            Ok(false) => Err(unavailable("not mounted".into())),
            Err(e) => Err(unavailable(format!("cannot read mount table: {e}"))),
        }
    }

    pub fn artifact_exists(&self, name: &str) -> Result<bool> {
        Ok(self.paths.artifact_path(name)?.is_file())
    }

    /// Copy a locally produced file onto the share under `name`.
    pub fn stage_local_file(&self, local: &Path, name: &str) -> Result<String> {
        self.verify_mounted()?;
        let dest = self.paths.artifact_path(name)?;
        fs::copy(local, &dest).map_err(|source| VmediaError::Staging {
            operation: format!("copying {} to share", local.display()),
            source,
        })?;
        debug!(artifact = name, "staged local file on share");
        Ok(name.to_string())
    }

    /// Pull an image from the catalog straight onto the share under `name`.
    pub fn fetch_remote_image(
        &self,
        images: &dyn ImageService,
        reference: &str,
        name: &str,
    ) -> Result<String> {
        self.verify_mounted()?;
        let dest = self.paths.artifact_path(name)?;
        images.fetch(reference, &dest)?;
        debug!(artifact = name, reference, "fetched image onto share");
        Ok(name.to_string())
    }

    /// Best-effort delete. Missing files are fine and other failures are only logged.
    pub fn remove_artifact(&self, name: &str) {
        let path = match self.paths.artifact_path(name) {
            Ok(path) => path,
            Err(e) => {
                warn!(artifact = name, "not removing artifact: {e}");
                return;
            }
        };
        match fs::remove_file(&path) {
            Ok(()) => debug!(artifact = name, "removed artifact from share"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(artifact = name, "failed to remove {}: {e}", path.display()),
        }
    }
}
