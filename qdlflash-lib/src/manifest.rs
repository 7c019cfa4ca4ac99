//! Manifest and version list schema.
//!
//! A [`Manifest`] names every image making up one flashable OS version. The
//! host loads a list of [`VersionEntry`] values (usually from JSON) and hands
//! the selected manifest to the flash manager.

use crate::partition::PartitionTable;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Longest partition name the on-device table can store.
pub const MAX_NAME_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Image name; also the name of the partition it is written to.
    pub name: String,
    pub url: String,
    /// Decompressed payload length in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the decompressed payload.
    pub checksum: String,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub sparse: bool,
    /// Partition size to reserve. Defaults to `size`, which is too small for
    /// sparse images that expand on the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_size: Option<u64>,
}

impl ImageDescriptor {
    /// Key under which the verified payload is cached.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.name, self.checksum)
    }

    pub fn required_partition_size(&self) -> u64 {
        self.partition_size.unwrap_or(self.size).max(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub images: Vec<ImageDescriptor>,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Sum of all decompressed image sizes. Saturates; [`validate`](Self::validate)
    /// rejects manifests where it would overflow.
    pub fn total_size(&self) -> u64 {
        self.images
            .iter()
            .fold(0u64, |total, image| total.saturating_add(image.size))
    }

    pub fn image(&self, name: &str) -> Option<&ImageDescriptor> {
        self.images.iter().find(|image| image.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(Error::invalid_input("manifest lists no images"));
        }

        let mut names = HashSet::new();
        for image in &self.images {
            if image.name.is_empty() || image.name.len() > MAX_NAME_LEN {
                return Err(Error::invalid_input(format!(
                    "image name `{}` must be 1..={} bytes",
                    image.name, MAX_NAME_LEN
                )));
            }
            if !image
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            {
                return Err(Error::invalid_input(format!(
                    "image name `{}` contains unsupported characters",
                    image.name
                )));
            }
            if !names.insert(image.name.as_str()) {
                return Err(Error::invalid_input(format!(
                    "image `{}` is listed twice",
                    image.name
                )));
            }
            if image.checksum.len() != 64 || hex::decode(&image.checksum).is_err() {
                return Err(Error::invalid_input(format!(
                    "image `{}` has an invalid SHA-256 checksum `{}`",
                    image.name, image.checksum
                )));
            }
            if image.checksum.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(Error::invalid_input(format!(
                    "image `{}` checksum must be lowercase hex",
                    image.name
                )));
            }
        }

        self.images
            .iter()
            .try_fold(0u64, |total, image| total.checked_add(image.size))
            .ok_or_else(|| Error::invalid_input("image sizes add up to more than 2^64 bytes"))?;
        PartitionTable::for_manifest(self)
            .map_err(|e| Error::invalid_input(format!("manifest has no valid layout: {}", e)))?;
        Ok(())
    }
}

/// One selectable OS version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "isLatest", default)]
    pub is_latest: bool,
    pub manifest: Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionList(pub Vec<VersionEntry>);

impl VersionList {
    pub fn from_json(json: &str) -> Result<Self> {
        let list: VersionList = serde_json::from_str(json)?;
        if list.0.is_empty() {
            return Err(Error::invalid_input("version list is empty"));
        }
        for entry in &list.0 {
            entry.manifest.validate().map_err(|e| {
                Error::invalid_input(format!("version `{}`: {}", entry.id, e))
            })?;
        }
        Ok(list)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// The entry flagged `isLatest`, else the first one.
    pub fn latest(&self) -> Option<&VersionEntry> {
        self.0.iter().find(|v| v.is_latest).or_else(|| self.0.first())
    }

    pub fn find(&self, id: &str) -> Option<&VersionEntry> {
        self.0.iter().find(|v| v.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionEntry> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUM: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn versions_json() -> String {
        format!(
            r#"[
              {{"id": "12.4", "name": "OS 12.4", "manifest": {{"images": [
                {{"name": "boot", "url": "https://example.com/boot.img.gz", "size": 0,
                  "checksum": "{SUM}", "compressed": true, "sparse": false}}
              ]}}}},
              {{"id": "12.5", "name": "OS 12.5", "isLatest": true, "manifest": {{"images": [
                {{"name": "system", "url": "file:///tmp/system.img", "size": 0,
                  "checksum": "{SUM}", "compressed": false, "sparse": true,
                  "partition_size": 1048576}}
              ]}}}}
            ]"#
        )
    }

    #[test]
    fn parses_version_list() {
        let list = VersionList::from_json(&versions_json()).unwrap();
        assert_eq!(list.latest().unwrap().id, "12.5");
        let old = list.find("12.4").unwrap();
        assert!(!old.is_latest);
        assert!(old.manifest.images[0].compressed);
        let system = list.latest().unwrap().manifest.image("system").unwrap();
        assert!(system.sparse);
        assert_eq!(system.required_partition_size(), 1_048_576);
    }

    #[test]
    fn latest_falls_back_to_first() {
        let json = versions_json().replace("\"isLatest\": true,", "");
        let list = VersionList::from_json(&json).unwrap();
        assert_eq!(list.latest().unwrap().id, "12.4");
    }

    #[test]
    fn rejects_duplicate_names_and_bad_checksums() {
        let image = ImageDescriptor {
            name: "boot".into(),
            url: "file:///boot.img".into(),
            size: 1,
            checksum: SUM.into(),
            compressed: false,
            sparse: false,
            partition_size: None,
        };
        let dup = Manifest {
            images: vec![image.clone(), image.clone()],
        };
        assert!(matches!(dup.validate(), Err(Error::InvalidInput(_))));

        let mut bad = image.clone();
        bad.checksum = "abc".into();
        assert!(Manifest { images: vec![bad] }.validate().is_err());

        let mut upper = image;
        upper.checksum = SUM.to_uppercase();
        assert!(Manifest { images: vec![upper] }.validate().is_err());

        assert!(Manifest::default().validate().is_err());
    }

    #[test]
    fn rejects_sizes_that_overflow() {
        let image = |name: &str, size: u64| ImageDescriptor {
            name: name.into(),
            url: format!("file:///{}.img", name),
            size,
            checksum: SUM.into(),
            compressed: false,
            sparse: false,
            partition_size: None,
        };
        let manifest = Manifest {
            images: vec![image("boot", u64::MAX), image("system", 2)],
        };
        assert!(matches!(manifest.validate(), Err(Error::InvalidInput(_))));
        assert_eq!(manifest.total_size(), u64::MAX);

        let mut sparse = image("userdata", 1);
        sparse.partition_size = Some(u64::MAX - 10);
        assert!(
            Manifest {
                images: vec![sparse]
            }
            .validate()
            .is_err()
        );
    }
}
