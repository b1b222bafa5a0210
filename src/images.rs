use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, VmediaError};

/// Schemes the image service knows how to retrieve.
const FETCHABLE_SCHEMES: [&str; 4] = ["http", "https", "glance", "file"];

/// Retrieval of image bytes and metadata from the image catalog.
pub trait ImageService: Send + Sync {
    /// Write the image behind `reference` to `dest`, replacing any existing file.
    fn fetch(&self, reference: &str, dest: &Path) -> Result<()>;

    /// Catalog properties of an image, restricted to `keys`.
    fn image_properties(&self, reference: &str, keys: &[&str]) -> Result<BTreeMap<String, String>>;

    fn is_ordinary_file_name(&self, reference: &str) -> bool {
        is_ordinary_file_name(reference)
    }
}

impl<T: ImageService + ?Sized> ImageService for Arc<T> {
    fn fetch(&self, reference: &str, dest: &Path) -> Result<()> {
        (**self).fetch(reference, dest)
    }

    fn image_properties(&self, reference: &str, keys: &[&str]) -> Result<BTreeMap<String, String>> {
        (**self).image_properties(reference, keys)
    }

    fn is_ordinary_file_name(&self, reference: &str) -> bool {
        (**self).is_ordinary_file_name(reference)
    }
}

fn scheme(reference: &str) -> Option<String> {
    reference
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
}

/// A catalog image is addressed by bare UUID or a `glance://` URL.
pub fn is_catalog_image(reference: &str) -> bool {
    Uuid::parse_str(reference).is_ok() || scheme(reference).as_deref() == Some("glance")
}

/// True when the reference is a bare file name expected to already be on the share.
pub fn is_ordinary_file_name(reference: &str) -> bool {
    if is_catalog_image(reference) {
        return false;
    }
    match scheme(reference) {
        Some(s) => !FETCHABLE_SCHEMES.contains(&s.as_str()),
        None => true,
    }
}

/// Image service backed by a local catalog mirror.
///
/// `file://` URLs and absolute paths are copied as-is. Catalog ids resolve to
/// `<catalog>/<id>`, with properties read from `<catalog>/<id>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryImageService {
    catalog: PathBuf,
}

impl DirectoryImageService {
    pub fn new(catalog: impl Into<PathBuf>) -> Self {
        Self {
            catalog: catalog.into(),
        }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        if let Some(path) = reference.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if let Some(id) = reference.strip_prefix("glance://") {
            return self.catalog_entry(id, reference);
        }
        if Uuid::parse_str(reference).is_ok() {
            return self.catalog_entry(reference, reference);
        }
        if Path::new(reference).is_absolute() {
            return Ok(PathBuf::from(reference));
        }
        Err(VmediaError::ImageFetch {
            reference: reference.to_string(),
            reason: "unsupported image reference".into(),
        })
    }

    fn catalog_entry(&self, id: &str, reference: &str) -> Result<PathBuf> {
        let id = Uuid::parse_str(id).map_err(|e| VmediaError::ImageFetch {
            reference: reference.to_string(),
            reason: format!("invalid image id: {e}"),
        })?;
        Ok(self.catalog.join(id.to_string()))
    }
}

impl ImageService for DirectoryImageService {
    fn fetch(&self, reference: &str, dest: &Path) -> Result<()> {
        let source = self.resolve(reference)?;
        debug!(reference, dest = %dest.display(), "fetching image");
        fs::copy(&source, dest).map_err(|e| VmediaError::ImageFetch {
            reference: reference.to_string(),
            reason: format!("{}: {e}", source.display()),
        })?;
        Ok(())
    }

    fn image_properties(&self, reference: &str, keys: &[&str]) -> Result<BTreeMap<String, String>> {
        let image = self.resolve(reference)?;
        let mut meta_path = image.into_os_string();
        meta_path.push(".json");
        let text = fs::read_to_string(&meta_path).map_err(|e| VmediaError::ImageFetch {
            reference: reference.to_string(),
            reason: format!("reading properties: {e}"),
        })?;
        let all: BTreeMap<String, serde_json::Value> = serde_json::from_str(&text)?;
        Ok(all
            .into_iter()
            .filter(|(k, _)| keys.contains(&k.as_str()))
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                serde_json::Value::Null => None,
                other => Some((k, other.to_string())),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE_ID: &str = "5c2d5c0e-5d9a-4f5e-8d2c-7c1e0f6d2a11";

    #[test]
    fn classifies_references() {
        assert!(is_ordinary_file_name("deploy.iso"));
        assert!(is_ordinary_file_name("smb://host/deploy.iso"));
        assert!(!is_ordinary_file_name("http://img/deploy.iso"));
        assert!(!is_ordinary_file_name("HTTPS://img/deploy.iso"));
        assert!(!is_ordinary_file_name("file:///srv/deploy.iso"));
        assert!(!is_ordinary_file_name(IMAGE_ID));
        assert!(!is_ordinary_file_name(&format!("glance://{IMAGE_ID}")));
        assert!(is_catalog_image(IMAGE_ID));
        assert!(!is_catalog_image("deploy.iso"));
    }

    #[test]
    fn fetches_file_urls_and_catalog_ids() {
        let catalog = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::write(catalog.path().join(IMAGE_ID), b"kernel").unwrap();
        let loose = catalog.path().join("loose.iso");
        fs::write(&loose, b"iso").unwrap();
        let svc = DirectoryImageService::new(catalog.path());

        let dest = out.path().join("a");
        svc.fetch(IMAGE_ID, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"kernel");

        let dest = out.path().join("b");
        svc.fetch(&format!("file://{}", loose.display()), &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"iso");
    }

    #[test]
    fn unsupported_reference_is_fetch_error() {
        let catalog = tempfile::tempdir().unwrap();
        let svc = DirectoryImageService::new(catalog.path());
        let err = svc
            .fetch("http://img/deploy.iso", &catalog.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, VmediaError::ImageFetch { .. }));

        let err = svc
            .fetch(&format!("glance://{IMAGE_ID}"), &catalog.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, VmediaError::ImageFetch { .. }));
    }

    #[test]
    fn reads_requested_properties_only() {
        let catalog = tempfile::tempdir().unwrap();
        fs::write(catalog.path().join(IMAGE_ID), b"img").unwrap();
        fs::write(
            catalog.path().join(format!("{IMAGE_ID}.json")),
            r#"{"kernel_id": "k-1", "ramdisk_id": "r-1", "os": "linux", "min_ram": 512}"#,
        )
        .unwrap();
        let svc = DirectoryImageService::new(catalog.path());
        let props = svc
            .image_properties(IMAGE_ID, &["kernel_id", "ramdisk_id"])
            .unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props["kernel_id"], "k-1");
        assert_eq!(props["ramdisk_id"], "r-1");
    }
}
