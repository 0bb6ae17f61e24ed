//! LISH manifests
//!
//! A manifest describes a dataset as files split into fixed-size chunks, each
//! identified by its digest, plus the directories and links of the tree.
//! Manifests are immutable once built and travel as versioned JSON, optionally
//! zstd-compressed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};
use thiserror::Error;

use crate::chunker::{chunk_count, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::digest::{ChecksumAlgorithm, ChunkId};

/// Only manifest format version understood by this node
pub const MANIFEST_VERSION: u32 = 1;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported manifest version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

pub type DatasetId = String;

/// Regular file, split into chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(alias = "checksums")]
    pub chunk_digests: Vec<ChunkId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

/// Symbolic link, or a hardlink to another file of the same dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEntry {
    pub path: String,
    pub target: String,
    #[serde(default, alias = "hardlink", skip_serializing_if = "Option::is_none")]
    pub is_hardlink: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

impl LinkEntry {
    pub fn hardlink(&self) -> bool {
        self.is_hardlink.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub id: DatasetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created: String,
    pub chunk_size: u64,
    #[serde(alias = "checksumAlgo")]
    pub checksum_algorithm: ChecksumAlgorithm,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub directories: Vec<DirectoryEntry>,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

/// How a manifest is written out
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    pub minify: bool,
    pub compress: bool,
}

/// Fresh random dataset id
pub fn new_dataset_id() -> DatasetId {
    uuid::Uuid::new_v4().to_string()
}

impl Manifest {
    /// Empty manifest with the given id (or a fresh one), stamped now
    pub fn new(id: Option<DatasetId>, chunk_size: u64, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            version: MANIFEST_VERSION,
            id: id.unwrap_or_else(new_dataset_id),
            name: None,
            description: None,
            created: chrono::Utc::now().to_rfc3339(),
            chunk_size,
            checksum_algorithm: algorithm,
            files: Vec::new(),
            directories: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.files.iter().map(|f| f.chunk_digests.len()).sum()
    }

    /// Every distinct digest of the manifest
    pub fn digests(&self) -> HashSet<ChunkId> {
        self.files
            .iter()
            .flat_map(|f| f.chunk_digests.iter().cloned())
            .collect()
    }

    /// Structural checks run on every manifest entering the node
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.version));
        }
        check_dataset_id(&self.id)?;
        check_chunk_size(self.chunk_size)?;

        let mut seen = HashSet::new();
        for file in &self.files {
            check_relative_path(&file.path)?;
            if !seen.insert(file.path.as_str()) {
                return Err(ManifestError::InvalidManifest(format!(
                    "duplicate file path: {}",
                    file.path
                )));
            }

            let expected = chunk_count(file.size, self.chunk_size);
            if file.chunk_digests.len() as u64 != expected {
                return Err(ManifestError::InvalidManifest(format!(
                    "{}: expected {} chunk digests, found {}",
                    file.path,
                    expected,
                    file.chunk_digests.len()
                )));
            }
            if let Some(bad) = file
                .chunk_digests
                .iter()
                .find(|d| !self.checksum_algorithm.is_well_formed(d))
            {
                return Err(ManifestError::InvalidManifest(format!(
                    "{}: malformed {} digest {}",
                    file.path, self.checksum_algorithm, bad
                )));
            }
        }
        for dir in &self.directories {
            check_relative_path(&dir.path)?;
        }
        for link in &self.links {
            check_relative_path(&link.path)?;
        }
        Ok(())
    }

    /// Serialize as JSON, optionally minified and zstd-compressed
    pub fn to_bytes(&self, options: ExportOptions) -> Result<Vec<u8>> {
        let json = if options.minify {
            serde_json::to_vec(self)?
        } else {
            serde_json::to_vec_pretty(self)?
        };
        if options.compress {
            Ok(zstd::encode_all(&json[..], ZSTD_LEVEL)?)
        } else {
            Ok(json)
        }
    }

    /// Parse and validate a manifest, decompressing zstd input transparently
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = if bytes.starts_with(&ZSTD_MAGIC) {
            let json = zstd::decode_all(bytes)?;
            serde_json::from_slice(&json)?
        } else {
            serde_json::from_slice(bytes)?
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn save(&self, path: &Path, options: ExportOptions) -> Result<()> {
        let bytes = self.to_bytes(options)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new(None, DEFAULT_CHUNK_SIZE, ChecksumAlgorithm::default())
    }
}

/// Dataset ids name a directory under the download dir: one plain component
pub fn check_dataset_id(id: &str) -> Result<()> {
    let invalid = || ManifestError::InvalidManifest(format!("invalid id: {:?}", id));
    if id.trim().is_empty() || id.chars().any(char::is_control) {
        return Err(invalid());
    }
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == id => Ok(()),
        _ => Err(invalid()),
    }
}

pub fn check_chunk_size(chunk_size: u64) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(ManifestError::InvalidManifest(format!(
            "chunkSize must be between 1 and {}, got {}",
            MAX_CHUNK_SIZE, chunk_size
        )));
    }
    Ok(())
}

fn check_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ManifestError::InvalidManifest("empty path".to_string()));
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ManifestError::InvalidManifest(format!(
                    "path must be relative without '..': {}",
                    path
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let algo = ChecksumAlgorithm::Sha256;
        let mut manifest = Manifest::new(Some("dataset-1".to_string()), 4, algo);
        manifest.name = Some("sample".to_string());
        manifest.files.push(FileEntry {
            path: "a.txt".to_string(),
            size: 10,
            permissions: Some("644".to_string()),
            modified: None,
            created: None,
            chunk_digests: vec![algo.digest(b"0123"), algo.digest(b"4567"), algo.digest(b"89")],
        });
        manifest.files.push(FileEntry {
            path: "sub/empty".to_string(),
            size: 0,
            permissions: None,
            modified: None,
            created: None,
            chunk_digests: vec![],
        });
        manifest.directories.push(DirectoryEntry {
            path: "sub".to_string(),
            permissions: Some("755".to_string()),
            modified: None,
            created: None,
        });
        manifest.links.push(LinkEntry {
            path: "link".to_string(),
            target: "a.txt".to_string(),
            is_hardlink: None,
            modified: None,
            created: None,
        });
        manifest
    }

    #[test]
    fn test_sample_is_valid() {
        let manifest = sample_manifest();
        manifest.validate().unwrap();
        assert_eq!(manifest.total_size(), 10);
        assert_eq!(manifest.chunk_count(), 3);
        assert_eq!(manifest.digests().len(), 3);
    }

    #[test]
    fn test_json_uses_camel_case_field_names() {
        let manifest = sample_manifest();
        let value: serde_json::Value =
            serde_json::from_slice(&manifest.to_bytes(ExportOptions::default()).unwrap()).unwrap();
        assert_eq!(value["chunkSize"], 4);
        assert_eq!(value["checksumAlgorithm"], "sha256");
        assert!(value["files"][0]["chunkDigests"].is_array());
        assert!(value["links"][0].get("isHardlink").is_none());
        assert!(value.get("description").is_none());
    }

    #[test]
    fn test_compressed_export_is_detected() {
        let manifest = sample_manifest();
        let options = ExportOptions {
            minify: true,
            compress: true,
        };
        let bytes = manifest.to_bytes(options).unwrap();
        assert!(bytes.starts_with(&ZSTD_MAGIC));
        assert_eq!(Manifest::from_bytes(&bytes).unwrap(), manifest);
    }

    #[test]
    fn test_accepts_legacy_field_names() {
        let algo = ChecksumAlgorithm::Sha256;
        let json = serde_json::json!({
            "version": 1,
            "id": "legacy",
            "created": "2024-01-01T00:00:00Z",
            "chunkSize": 8,
            "checksumAlgo": "sha256",
            "files": [{"path": "f", "size": 3, "checksums": [algo.digest(b"abc")]}],
            "links": [{"path": "h", "target": "f", "hardlink": true}]
        });
        let manifest = Manifest::from_bytes(json.to_string().as_bytes()).unwrap();
        assert_eq!(manifest.files[0].chunk_digests.len(), 1);
        assert!(manifest.links[0].hardlink());
        assert!(manifest.directories.is_empty());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut manifest = sample_manifest();
        manifest.version = 2;
        let bytes = serde_json::to_vec(&manifest).unwrap();
        assert!(matches!(
            Manifest::from_bytes(&bytes),
            Err(ManifestError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let manifest = sample_manifest();
        let mut value = serde_json::to_value(&manifest).unwrap();
        value["checksumAlgorithm"] = serde_json::Value::String("md5".to_string());
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            Manifest::from_bytes(&bytes),
            Err(ManifestError::Json(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_digest_count() {
        let mut manifest = sample_manifest();
        manifest.files[0].chunk_digests.pop();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        for bad in ["../etc/passwd", "/abs", "a/../../b"] {
            let mut manifest = sample_manifest();
            manifest.files[1].path = bad.to_string();
            assert!(manifest.validate().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_rejects_escaping_id() {
        for bad in ["../escaped", "..", ".", "/home/u/.ssh", "a/b", "nested/../x", "trailing/"] {
            let mut manifest = sample_manifest();
            manifest.id = bad.to_string();
            assert!(
                matches!(manifest.validate(), Err(ManifestError::InvalidManifest(_))),
                "{}",
                bad
            );
        }
        let mut manifest = sample_manifest();
        manifest.id = "3f2b9c1e-0d4a-4c55-9a7e-1b2c3d4e5f60".to_string();
        manifest.validate().unwrap();
    }

    #[test]
    fn test_rejects_duplicate_paths() {
        let mut manifest = sample_manifest();
        manifest.files[1].path = "a.txt".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let mut manifest = sample_manifest();
        manifest.chunk_size = 0;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_chunk_size_limit() {
        assert!(check_chunk_size(MAX_CHUNK_SIZE).is_ok());
        assert!(check_chunk_size(MAX_CHUNK_SIZE + 1).is_err());

        let oversized = Manifest::new(None, 2 * MAX_CHUNK_SIZE, ChecksumAlgorithm::Sha256);
        assert!(matches!(
            oversized.validate(),
            Err(ManifestError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/sample.lish");
        let manifest = sample_manifest();
        manifest.save(&path, ExportOptions::default()).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), manifest);
    }
}
