use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Network file system protocol the controller uses to read the share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareKind {
    #[default]
    Nfs,
    Cifs,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Local mount point of the share; artifacts are written here.
    pub root: PathBuf,
    /// Host exporting the share, as seen by the controller.
    pub server: String,
    /// Export name of the share.
    pub name: String,
    pub kind: ShareKind,
    pub user_name: String,
    pub user_password: String,
    pub user_domain: String,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/remote_image_share_root"),
            server: String::new(),
            name: "share".into(),
            kind: ShareKind::Nfs,
            user_name: String::new(),
            user_password: String::new(),
            user_domain: String::new(),
        }
    }
}

impl fmt::Debug for ShareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareConfig")
            .field("root", &self.root)
            .field("server", &self.server)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("user_name", &self.user_name)
            .field("user_password", &"***")
            .field("user_domain", &self.user_domain)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmediaConfig {
    pub share: ShareConfig,
    /// Kernel command line appended when building boot ISOs.
    pub kernel_append_params: String,
    /// Where temporary floppy images are produced before staging.
    pub scratch_dir: Option<PathBuf>,
    /// Audit log of completed phases.
    pub ops_log: Option<PathBuf>,
}

impl Default for VmediaConfig {
    fn default() -> Self {
        Self {
            share: ShareConfig::default(),
            kernel_append_params: "nofb nomodeset vga=normal".into(),
            scratch_dir: None,
            ops_log: None,
        }
    }
}

impl VmediaConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
