use std::{fs, path::PathBuf};

use tempfile::{NamedTempFile, TempDir};

use crate::error::Result;

/// Scratch space for artifacts produced locally before they reach the share.
#[derive(Debug, Clone)]
pub struct TempManager {
    base: PathBuf,
}

impl TempManager {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Scratch manager rooted at the configured directory, or the system temp dir.
    pub fn from_config(scratch_dir: Option<&PathBuf>) -> Result<Self> {
        match scratch_dir {
            Some(dir) => Self::new(dir.clone()),
            None => Self::new(std::env::temp_dir()),
        }
    }

    /// A file removed when the handle is dropped.
    pub fn scratch_file(&self, suffix: &str) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix("vmedia-")
            .suffix(suffix)
            .tempfile_in(&self.base)?)
    }

    /// A directory tree removed when the handle is dropped.
    pub fn scratch_dir(&self) -> Result<TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("vmedia-")
            .tempdir_in(&self.base)?)
    }
}
