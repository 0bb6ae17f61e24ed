//! Manifest builder
//!
//! Walks a file or directory tree once, splits every regular file into
//! fixed-size windows and digests each window on a bounded rayon pool.

use chrono::{DateTime, SecondsFormat, Utc};
use rayon::prelude::*;
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

use crate::chunker::{chunk_count, chunk_span, read_chunk_at, Chunker, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::digest::{ChecksumAlgorithm, ChunkId, DigestError};
use crate::manifest::{
    check_dataset_id, DatasetId, DirectoryEntry, FileEntry, LinkEntry, Manifest, ManifestError,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Input must be a file or directory: {0}")]
    UnsupportedInput(PathBuf),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl BuildError {
    fn io(path: &Path, source: io::Error) -> Self {
        BuildError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// File as announced before hashing starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub path: String,
    pub size: u64,
    pub chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildProgress {
    FileList(Vec<PlannedFile>),
    FileStart { path: String, size: u64, chunks: u64 },
    Chunk { path: String, current: u64, total: u64 },
    FileDone { path: String },
}

pub struct ManifestBuilder {
    chunk_size: u64,
    algorithm: ChecksumAlgorithm,
    concurrency: usize,
    id: Option<DatasetId>,
    name: Option<String>,
    description: Option<String>,
}

enum Scanned {
    Directory {
        rel: String,
        meta: Metadata,
    },
    File {
        rel: String,
        full: PathBuf,
        meta: Metadata,
    },
    Link {
        rel: String,
        target: String,
        hardlink: bool,
        meta: Metadata,
    },
}

impl ManifestBuilder {
    /// Builder for `algorithm`, rejected here if unknown so nothing is hashed
    pub fn new(chunk_size: u64, algorithm: &str) -> Result<Self> {
        Self::with_algorithm(chunk_size, algorithm.parse()?)
    }

    pub fn with_algorithm(chunk_size: u64, algorithm: ChecksumAlgorithm) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(BuildError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            chunk_size,
            algorithm,
            concurrency: 0,
            id: None,
            name: None,
            description: None,
        })
    }

    /// Hashing workers; 0 means available parallelism
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    pub fn id(mut self, id: impl Into<DatasetId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn build(&self, root: &Path) -> Result<Manifest> {
        self.build_with_progress(root, &|_| {})
    }

    pub fn build_with_progress(
        &self,
        root: &Path,
        progress: &(dyn Fn(BuildProgress) + Sync),
    ) -> Result<Manifest> {
        if let Some(id) = &self.id {
            check_dataset_id(id)?;
        }
        let threads = if self.concurrency == 0 {
            num_cpus::get()
        } else {
            self.concurrency
        };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;

        let root_meta = std::fs::symlink_metadata(root).map_err(|e| BuildError::io(root, e))?;
        let scanned = if root_meta.is_file() {
            let file_name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| BuildError::UnsupportedInput(root.to_path_buf()))?;
            vec![Scanned::File {
                rel: file_name,
                full: root.to_path_buf(),
                meta: root_meta,
            }]
        } else if root_meta.is_dir() {
            scan_tree(root)?
        } else {
            return Err(BuildError::UnsupportedInput(root.to_path_buf()));
        };

        let planned: Vec<PlannedFile> = scanned
            .iter()
            .filter_map(|entry| match entry {
                Scanned::File { rel, meta, .. } => Some(PlannedFile {
                    path: rel.clone(),
                    size: meta.len(),
                    chunks: chunk_count(meta.len(), self.chunk_size),
                }),
                _ => None,
            })
            .collect();
        info!(
            "Building manifest for {:?}: {} files, {} workers, {} over {}-byte chunks",
            root,
            planned.len(),
            threads,
            self.algorithm,
            self.chunk_size
        );
        progress(BuildProgress::FileList(planned));

        let mut manifest = Manifest::new(self.id.clone(), self.chunk_size, self.algorithm);
        manifest.name = self.name.clone();
        manifest.description = self.description.clone();

        for entry in scanned {
            match entry {
                Scanned::Directory { rel, meta } => {
                    let (modified, created) = timestamps(&meta);
                    manifest.directories.push(DirectoryEntry {
                        path: rel,
                        permissions: permissions(&meta),
                        modified,
                        created,
                    });
                }
                Scanned::Link {
                    rel,
                    target,
                    hardlink,
                    meta,
                } => {
                    let (modified, created) = timestamps(&meta);
                    manifest.links.push(LinkEntry {
                        path: rel,
                        target,
                        is_hardlink: hardlink.then_some(true),
                        modified,
                        created,
                    });
                }
                Scanned::File { rel, full, meta } => {
                    let size = meta.len();
                    let chunk_digests = self.hash_file(&pool, &rel, &full, size, progress)?;
                    let (modified, created) = timestamps(&meta);
                    manifest.files.push(FileEntry {
                        path: rel,
                        size,
                        permissions: permissions(&meta),
                        modified,
                        created,
                        chunk_digests,
                    });
                }
            }
        }

        manifest.files.sort_by(|a, b| a.path.cmp(&b.path));
        manifest.directories.sort_by(|a, b| a.path.cmp(&b.path));
        manifest.links.sort_by(|a, b| a.path.cmp(&b.path));

        info!(
            "Built manifest {} ({} files, {} chunks, {} bytes)",
            manifest.id,
            manifest.files.len(),
            manifest.chunk_count(),
            manifest.total_size()
        );
        Ok(manifest)
    }

    fn hash_file(
        &self,
        pool: &rayon::ThreadPool,
        rel: &str,
        full: &Path,
        size: u64,
        progress: &(dyn Fn(BuildProgress) + Sync),
    ) -> Result<Vec<ChunkId>> {
        let total = chunk_count(size, self.chunk_size);
        progress(BuildProgress::FileStart {
            path: rel.to_string(),
            size,
            chunks: total,
        });

        let digests = if total == 0 {
            Vec::new()
        } else if pool.current_num_threads() <= 1 {
            self.hash_sequential(rel, full, total, progress)
                .map_err(|e| BuildError::io(full, e))?
        } else {
            self.hash_parallel(pool, rel, full, size, total, progress)
                .map_err(|e| BuildError::io(full, e))?
        };

        if digests.len() as u64 != total {
            return Err(BuildError::io(
                full,
                io::Error::new(io::ErrorKind::UnexpectedEof, "file changed size while hashing"),
            ));
        }

        debug!("Hashed {} ({} chunks)", rel, total);
        progress(BuildProgress::FileDone {
            path: rel.to_string(),
        });
        Ok(digests)
    }

    fn hash_sequential(
        &self,
        rel: &str,
        full: &Path,
        total: u64,
        progress: &(dyn Fn(BuildProgress) + Sync),
    ) -> io::Result<Vec<ChunkId>> {
        let file = File::open(full)?;
        let mut chunker = Chunker::with_chunk_size(file, self.chunk_size as usize);
        let mut digests = Vec::with_capacity(total as usize);
        while let Some(chunk) = chunker.next_chunk()? {
            digests.push(self.algorithm.digest(&chunk));
            progress(BuildProgress::Chunk {
                path: rel.to_string(),
                current: digests.len() as u64,
                total,
            });
        }
        Ok(digests)
    }

    fn hash_parallel(
        &self,
        pool: &rayon::ThreadPool,
        rel: &str,
        full: &Path,
        size: u64,
        total: u64,
        progress: &(dyn Fn(BuildProgress) + Sync),
    ) -> io::Result<Vec<ChunkId>> {
        let chunk_size = self.chunk_size;
        let algorithm = self.algorithm;
        let done = AtomicU64::new(0);

        pool.install(|| {
            (0..total)
                .into_par_iter()
                .map_init(
                    || File::open(full),
                    |file: &mut io::Result<File>, index: u64| -> io::Result<ChunkId> {
                        let file = file
                            .as_mut()
                            .map_err(|e| io::Error::new(e.kind(), e.to_string()))?;
                        let (offset, len) = chunk_span(size, chunk_size, index).ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidInput, "chunk index out of range")
                        })?;
                        let data = read_chunk_at(file, offset, len)?;
                        let digest = algorithm.digest(&data);
                        let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                        progress(BuildProgress::Chunk {
                            path: rel.to_string(),
                            current,
                            total,
                        });
                        Ok(digest)
                    },
                )
                .collect::<io::Result<Vec<_>>>()
        })
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            algorithm: ChecksumAlgorithm::default(),
            concurrency: 0,
            id: None,
            name: None,
            description: None,
        }
    }
}

fn scan_tree(root: &Path) -> Result<Vec<Scanned>> {
    let mut scanned = Vec::new();
    let mut inodes: std::collections::HashMap<(u64, u64), String> =
        std::collections::HashMap::new();

    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            BuildError::Io {
                path,
                source: io::Error::from(e),
            }
        })?;
        let full = entry.path().to_path_buf();
        let rel = relative_path(root, &full);
        let meta = std::fs::symlink_metadata(&full).map_err(|e| BuildError::io(&full, e))?;
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(&full).map_err(|e| BuildError::io(&full, e))?;
            scanned.push(Scanned::Link {
                rel,
                target: target.to_string_lossy().replace('\\', "/"),
                hardlink: false,
                meta,
            });
        } else if file_type.is_dir() {
            scanned.push(Scanned::Directory { rel, meta });
        } else if file_type.is_file() {
            if let Some(key) = inode_key(&meta) {
                if let Some(first) = inodes.get(&key) {
                    scanned.push(Scanned::Link {
                        rel,
                        target: first.clone(),
                        hardlink: true,
                        meta,
                    });
                    continue;
                }
                inodes.insert(key, rel.clone());
            }
            scanned.push(Scanned::File { rel, full, meta });
        } else {
            debug!("Skipping special file {:?}", full);
        }
    }
    Ok(scanned)
}

fn relative_path(root: &Path, full: &Path) -> String {
    let rel = full.strip_prefix(root).unwrap_or(full);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn inode_key(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (meta.ino() > 0 && meta.nlink() > 1).then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn inode_key(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}

#[cfg(unix)]
fn permissions(meta: &Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(format!("{:o}", meta.permissions().mode() & 0o777))
}

#[cfg(not(unix))]
fn permissions(_meta: &Metadata) -> Option<String> {
    None
}

fn format_time(time: io::Result<SystemTime>) -> Option<String> {
    time.ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn timestamps(meta: &Metadata) -> (Option<String>, Option<String>) {
    let modified = format_time(meta.modified());
    let created = format_time(meta.created()).or_else(|| modified.clone());
    (modified, created)
}
