//! RocksDB-backed chunk state store
//!
//! Persists every imported dataset together with one possession record per
//! chunk slot (file, chunk index). The store is the single source of truth for
//! which chunks this node has.
//!
//! Key layout:
//!
//! ```text
//! m\0{id}                                      dataset metadata (JSON)
//! c\0{id}\0{gen:016x}\0f{file:08x}             file record (JSON)
//! c\0{id}\0{gen:016x}\0k{file:08x}{chunk:08x}  have byte + digest
//! c\0{id}\0{gen:016x}\0x{digest}\0{file:08x}{chunk:08x}   digest index
//! c\0{id}\0{gen:016x}\0r{idx:08x}              directory entry (JSON)
//! c\0{id}\0{gen:016x}\0l{idx:08x}              link entry (JSON)
//! ```
//!
//! A re-import writes a new generation and drops the old one in the same
//! write batch, so readers see either the old or the new dataset.

use rocksdb::{Direction, IteratorMode, Options, Snapshot, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, trace};

use crate::chunker::chunk_span;
use crate::digest::{ChecksumAlgorithm, ChunkId};
use crate::manifest::{DirectoryEntry, FileEntry, LinkEntry, Manifest, ManifestError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const HAVE: u8 = 1;
const MISSING: u8 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetMeta {
    version: u32,
    id: String,
    name: Option<String>,
    description: Option<String>,
    created: String,
    chunk_size: u64,
    checksum_algorithm: ChecksumAlgorithm,
    directory: Option<String>,
    added: String,
    generation: u64,
    file_count: u64,
    directory_count: u64,
    link_count: u64,
    total_size: u64,
    chunk_count: u64,
    missing_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord {
    path: String,
    size: u64,
    permissions: Option<String>,
    modified: Option<String>,
    created: Option<String>,
}

/// Dataset as persisted: the manifest plus local-only fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDataset {
    pub manifest: Manifest,
    pub directory: Option<String>,
    pub added: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSummary {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created: String,
    pub added: String,
    pub directory: Option<String>,
    pub chunk_size: u64,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub total_size: u64,
    pub file_count: u64,
    pub directory_count: u64,
    pub link_count: u64,
    pub chunk_count: u64,
    pub have_count: u64,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub path: String,
    pub size: u64,
    pub permissions: Option<String>,
    pub modified: Option<String>,
    pub created: Option<String>,
    pub chunk_count: u64,
    pub have_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDetail {
    #[serde(flatten)]
    pub summary: DatasetSummary,
    pub files: Vec<FileSummary>,
    pub directories: Vec<DirectoryEntry>,
    pub links: Vec<LinkEntry>,
}

/// A chunk slot this node does not have yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingChunk {
    pub file_index: u32,
    pub chunk_index: u32,
    pub digest: ChunkId,
}

/// Chunks this node holds for a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Have {
    All,
    Some(HashSet<ChunkId>),
}

impl Have {
    pub fn contains(&self, digest: &ChunkId) -> bool {
        match self {
            Have::All => true,
            Have::Some(set) => set.contains(digest),
        }
    }
}

/// Where the bytes of a had chunk live on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    #[default]
    Added,
    Name,
    Created,
    TotalSize,
    FileCount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Persistent chunk possession store
#[derive(Clone)]
pub struct ChunkStore {
    db: Arc<DB>,
    writers: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

fn meta_key(id: &str) -> Vec<u8> {
    format!("m\0{}", id).into_bytes()
}

fn dataset_prefix(id: &str) -> Vec<u8> {
    format!("c\0{}\0", id).into_bytes()
}

fn generation_prefix(id: &str, generation: u64) -> Vec<u8> {
    format!("c\0{}\0{:016x}\0", id, generation).into_bytes()
}

fn with_suffix(prefix: &[u8], suffix: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix.as_bytes());
    key
}

fn chunk_key(gen_prefix: &[u8], file: u32, chunk: u32) -> Vec<u8> {
    with_suffix(gen_prefix, &format!("k{:08x}{:08x}", file, chunk))
}

fn index_prefix(gen_prefix: &[u8], digest: &ChunkId) -> Vec<u8> {
    with_suffix(gen_prefix, &format!("x{}\0", digest))
}

/// Exclusive upper bound for keys starting with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            break;
        }
    }
    end
}

fn parse_slot(hex: &[u8]) -> Option<(u32, u32)> {
    if hex.len() != 16 {
        return None;
    }
    let s = std::str::from_utf8(hex).ok()?;
    let file = u32::from_str_radix(&s[..8], 16).ok()?;
    let chunk = u32::from_str_radix(&s[8..], 16).ok()?;
    Some((file, chunk))
}

fn parse_chunk_value(value: &[u8]) -> Result<(bool, ChunkId)> {
    let (have, digest) = value
        .split_first()
        .ok_or_else(|| StoreError::Corrupt("empty chunk record".to_string()))?;
    let digest = std::str::from_utf8(digest)
        .map_err(|e| StoreError::Corrupt(format!("chunk digest: {}", e)))?;
    Ok((*have == HAVE, ChunkId::new(digest)))
}

fn chunk_value(have: bool, digest: &ChunkId) -> Vec<u8> {
    let mut value = Vec::with_capacity(1 + digest.as_str().len());
    value.push(if have { HAVE } else { MISSING });
    value.extend_from_slice(digest.as_str().as_bytes());
    value
}

/// Visit every key under `prefix` in order until `f` returns false
fn scan_prefix<F>(snapshot: &Snapshot<'_>, prefix: &[u8], mut f: F) -> Result<()>
where
    F: FnMut(&[u8], &[u8]) -> Result<bool>,
{
    for item in snapshot.iterator(IteratorMode::From(prefix, Direction::Forward)) {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        if !f(&key, &value)? {
            break;
        }
    }
    Ok(())
}

fn read_meta(snapshot: &Snapshot<'_>, id: &str) -> Result<Option<DatasetMeta>> {
    match snapshot.get(meta_key(id))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn require_meta(snapshot: &Snapshot<'_>, id: &str) -> Result<DatasetMeta> {
    read_meta(snapshot, id)?.ok_or_else(|| StoreError::DatasetNotFound(id.to_string()))
}

fn summary_of(meta: &DatasetMeta) -> DatasetSummary {
    DatasetSummary {
        id: meta.id.clone(),
        name: meta.name.clone(),
        description: meta.description.clone(),
        created: meta.created.clone(),
        added: meta.added.clone(),
        directory: meta.directory.clone(),
        chunk_size: meta.chunk_size,
        checksum_algorithm: meta.checksum_algorithm,
        total_size: meta.total_size,
        file_count: meta.file_count,
        directory_count: meta.directory_count,
        link_count: meta.link_count,
        chunk_count: meta.chunk_count,
        have_count: meta.chunk_count - meta.missing_count,
        complete: meta.missing_count == 0,
    }
}

/// Everything below a dataset's current generation, decoded
struct Children {
    files: Vec<(FileRecord, Vec<(bool, ChunkId)>)>,
    directories: Vec<DirectoryEntry>,
    links: Vec<LinkEntry>,
}

fn read_children(snapshot: &Snapshot<'_>, meta: &DatasetMeta) -> Result<Children> {
    let prefix = generation_prefix(&meta.id, meta.generation);
    let mut children = Children {
        files: Vec::new(),
        directories: Vec::new(),
        links: Vec::new(),
    };

    scan_prefix(snapshot, &prefix, |key, value| {
        let rest = &key[prefix.len()..];
        match rest.first() {
            Some(b'f') => {
                let record: FileRecord = serde_json::from_slice(value)?;
                children.files.push((record, Vec::new()));
            }
            Some(b'k') => {
                let (file, _) = parse_slot(&rest[1..])
                    .ok_or_else(|| StoreError::Corrupt("chunk key".to_string()))?;
                let slot = parse_chunk_value(value)?;
                children
                    .files
                    .get_mut(file as usize)
                    .ok_or_else(|| StoreError::Corrupt(format!("chunk of unknown file {}", file)))?
                    .1
                    .push(slot);
            }
            Some(b'l') => children.links.push(serde_json::from_slice(value)?),
            Some(b'r') => children.directories.push(serde_json::from_slice(value)?),
            _ => {}
        }
        Ok(true)
    })?;

    Ok(children)
}

/// Slots carrying `digest`, in file-then-chunk order
fn slots_for_digest(
    snapshot: &Snapshot<'_>,
    gen_prefix: &[u8],
    digest: &ChunkId,
) -> Result<Vec<(u32, u32)>> {
    let prefix = index_prefix(gen_prefix, digest);
    let mut slots = Vec::new();
    scan_prefix(snapshot, &prefix, |key, _| {
        if let Some(slot) = parse_slot(&key[prefix.len()..]) {
            slots.push(slot);
        }
        Ok(true)
    })?;
    Ok(slots)
}

impl ChunkStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_enable_pipelined_write(true);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened chunk store at {:?}", path.as_ref());
        Ok(Self {
            db: Arc::new(db),
            writers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Serializes writers of one dataset
    async fn writer_lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut writers = self.writers.lock().await;
            Arc::clone(writers.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the writer entry for `id` unless another task still holds or awaits it
    async fn release_writer(&self, id: &str) {
        let mut writers = self.writers.lock().await;
        if writers.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            writers.remove(id);
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DB) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::IoError(std::io::Error::other(e.to_string())))?
    }

    /// Replace any prior record for the manifest's id
    ///
    /// Only slots whose digest is in `present` start as had.
    pub async fn upsert(
        &self,
        manifest: &Manifest,
        directory: Option<String>,
        present: Option<&HashSet<ChunkId>>,
    ) -> Result<()> {
        manifest.validate()?;

        let manifest = manifest.clone();
        let present = present.cloned().unwrap_or_default();
        let guard = self.writer_lock(&manifest.id).await;

        let (generation, missing) = self
            .blocking(move |db| {
                let _guard = guard;
                let previous = read_meta(&db.snapshot(), &manifest.id)?;
                let mut batch = WriteBatch::default();

                let generation = match &previous {
                    Some(old) => {
                        let old_prefix = generation_prefix(&old.id, old.generation);
                        batch.delete_range(&old_prefix, &prefix_end(&old_prefix));
                        old.generation + 1
                    }
                    None => 0,
                };
                let gen_prefix = generation_prefix(&manifest.id, generation);

                let mut chunk_count = 0u64;
                let mut missing_count = 0u64;
                for (file_index, file) in manifest.files.iter().enumerate() {
                    let file_index = file_index as u32;
                    let record = FileRecord {
                        path: file.path.clone(),
                        size: file.size,
                        permissions: file.permissions.clone(),
                        modified: file.modified.clone(),
                        created: file.created.clone(),
                    };
                    batch.put(
                        with_suffix(&gen_prefix, &format!("f{:08x}", file_index)),
                        serde_json::to_vec(&record)?,
                    );

                    for (chunk_index, digest) in file.chunk_digests.iter().enumerate() {
                        let chunk_index = chunk_index as u32;
                        let have = present.contains(digest);
                        if !have {
                            missing_count += 1;
                        }
                        chunk_count += 1;
                        batch.put(
                            chunk_key(&gen_prefix, file_index, chunk_index),
                            chunk_value(have, digest),
                        );
                        batch.put(
                            with_suffix(
                                &index_prefix(&gen_prefix, digest),
                                &format!("{:08x}{:08x}", file_index, chunk_index),
                            ),
                            b"",
                        );
                    }
                }
                for (i, dir) in manifest.directories.iter().enumerate() {
                    batch.put(
                        with_suffix(&gen_prefix, &format!("r{:08x}", i)),
                        serde_json::to_vec(dir)?,
                    );
                }
                for (i, link) in manifest.links.iter().enumerate() {
                    batch.put(
                        with_suffix(&gen_prefix, &format!("l{:08x}", i)),
                        serde_json::to_vec(link)?,
                    );
                }

                let meta = DatasetMeta {
                    version: manifest.version,
                    id: manifest.id.clone(),
                    name: manifest.name.clone(),
                    description: manifest.description.clone(),
                    created: manifest.created.clone(),
                    chunk_size: manifest.chunk_size,
                    checksum_algorithm: manifest.checksum_algorithm,
                    directory,
                    added: chrono::Utc::now().to_rfc3339(),
                    generation,
                    file_count: manifest.files.len() as u64,
                    directory_count: manifest.directories.len() as u64,
                    link_count: manifest.links.len() as u64,
                    total_size: manifest.total_size(),
                    chunk_count,
                    missing_count,
                };
                batch.put(meta_key(&manifest.id), serde_json::to_vec(&meta)?);
                db.write(batch)?;
                Ok((generation, missing_count))
            })
            .await?;

        debug!(
            "Upserted dataset generation {} ({} chunks missing)",
            generation, missing
        );
        Ok(())
    }

    /// Delete a dataset and all of its records; returns whether it existed
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let guard = self.writer_lock(id).await;
        let id_owned = id.to_string();
        let existed = self
            .blocking(move |db| {
                let _guard = guard;
                if db.get(meta_key(&id_owned))?.is_none() {
                    return Ok(false);
                }
                let prefix = dataset_prefix(&id_owned);
                let mut batch = WriteBatch::default();
                batch.delete(meta_key(&id_owned));
                batch.delete_range(&prefix, &prefix_end(&prefix));
                db.write(batch)?;
                Ok(true)
            })
            .await;
        self.release_writer(id).await;

        if existed? {
            info!("Removed dataset {}", id);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |db| Ok(db.get(meta_key(&id))?.is_some()))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredDataset>> {
        let id = id.to_string();
        self.blocking(move |db| {
            let snapshot = db.snapshot();
            let Some(meta) = read_meta(&snapshot, &id)? else {
                return Ok(None);
            };
            let children = read_children(&snapshot, &meta)?;
            let files = children
                .files
                .into_iter()
                .map(|(record, slots)| FileEntry {
                    path: record.path,
                    size: record.size,
                    permissions: record.permissions,
                    modified: record.modified,
                    created: record.created,
                    chunk_digests: slots.into_iter().map(|(_, digest)| digest).collect(),
                })
                .collect();

            Ok(Some(StoredDataset {
                manifest: Manifest {
                    version: meta.version,
                    id: meta.id,
                    name: meta.name,
                    description: meta.description,
                    created: meta.created,
                    chunk_size: meta.chunk_size,
                    checksum_algorithm: meta.checksum_algorithm,
                    files,
                    directories: children.directories,
                    links: children.links,
                },
                directory: meta.directory,
                added: meta.added,
            }))
        })
        .await
    }

    pub async fn list_summaries(
        &self,
        sort_by: SortBy,
        order: SortOrder,
    ) -> Result<Vec<DatasetSummary>> {
        let mut summaries = self
            .blocking(|db| {
                let snapshot = db.snapshot();
                let mut summaries = Vec::new();
                scan_prefix(&snapshot, b"m\0", |_, value| {
                    let meta: DatasetMeta = serde_json::from_slice(value)?;
                    summaries.push(summary_of(&meta));
                    Ok(true)
                })?;
                Ok(summaries)
            })
            .await?;

        summaries.sort_by(|a, b| {
            let ordering = match sort_by {
                SortBy::Added => a.added.cmp(&b.added),
                SortBy::Name => a.name.cmp(&b.name),
                SortBy::Created => a.created.cmp(&b.created),
                SortBy::TotalSize => a.total_size.cmp(&b.total_size),
                SortBy::FileCount => a.file_count.cmp(&b.file_count),
            };
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        Ok(summaries)
    }

    pub async fn get_detail(&self, id: &str) -> Result<Option<DatasetDetail>> {
        let id = id.to_string();
        self.blocking(move |db| {
            let snapshot = db.snapshot();
            let Some(meta) = read_meta(&snapshot, &id)? else {
                return Ok(None);
            };
            let children = read_children(&snapshot, &meta)?;
            let files = children
                .files
                .into_iter()
                .map(|(record, slots)| FileSummary {
                    path: record.path,
                    size: record.size,
                    permissions: record.permissions,
                    modified: record.modified,
                    created: record.created,
                    chunk_count: slots.len() as u64,
                    have_count: slots.iter().filter(|(have, _)| *have).count() as u64,
                })
                .collect();
            Ok(Some(DatasetDetail {
                summary: summary_of(&meta),
                files,
                directories: children.directories,
                links: children.links,
            }))
        })
        .await
    }

    /// True when every chunk slot is had; datasets without chunks are complete
    pub async fn is_complete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |db| Ok(require_meta(&db.snapshot(), &id)?.missing_count == 0))
            .await
    }

    /// Slots not yet had, in file-then-chunk order
    pub async fn missing_chunks(&self, id: &str) -> Result<Vec<MissingChunk>> {
        let id = id.to_string();
        self.blocking(move |db| {
            let snapshot = db.snapshot();
            let meta = require_meta(&snapshot, &id)?;
            let mut missing = Vec::with_capacity(meta.missing_count as usize);
            if meta.missing_count == 0 {
                return Ok(missing);
            }

            let prefix = with_suffix(&generation_prefix(&meta.id, meta.generation), "k");
            scan_prefix(&snapshot, &prefix, |key, value| {
                let (have, digest) = parse_chunk_value(value)?;
                if !have {
                    let (file_index, chunk_index) = parse_slot(&key[prefix.len()..])
                        .ok_or_else(|| StoreError::Corrupt("chunk key".to_string()))?;
                    missing.push(MissingChunk {
                        file_index,
                        chunk_index,
                        digest,
                    });
                }
                Ok(true)
            })?;
            Ok(missing)
        })
        .await
    }

    /// Mark the first not-yet-had slot carrying `digest`
    ///
    /// Returns false when no unhad slot with that digest is left.
    pub async fn mark_have(&self, id: &str, digest: &ChunkId) -> Result<bool> {
        let guard = self.writer_lock(id).await;
        let id = id.to_string();
        let digest = digest.clone();
        self.blocking(move |db| {
            let _guard = guard;
            let snapshot = db.snapshot();
            let mut meta = require_meta(&snapshot, &id)?;
            let gen_prefix = generation_prefix(&meta.id, meta.generation);

            for (file, chunk) in slots_for_digest(&snapshot, &gen_prefix, &digest)? {
                let key = chunk_key(&gen_prefix, file, chunk);
                let value = snapshot
                    .get(&key)?
                    .ok_or_else(|| StoreError::Corrupt(format!("dangling index {}", digest)))?;
                let (have, _) = parse_chunk_value(&value)?;
                if have {
                    continue;
                }

                meta.missing_count = meta.missing_count.saturating_sub(1);
                let mut batch = WriteBatch::default();
                batch.put(&key, chunk_value(true, &digest));
                batch.put(meta_key(&id), serde_json::to_vec(&meta)?);
                db.write(batch)?;
                trace!(
                    "Marked {} have at file {} chunk {} ({} missing)",
                    digest.short(),
                    file,
                    chunk,
                    meta.missing_count
                );
                return Ok(true);
            }
            Ok(false)
        })
        .await
    }

    pub async fn have(&self, id: &str) -> Result<Have> {
        let id = id.to_string();
        self.blocking(move |db| {
            let snapshot = db.snapshot();
            let meta = require_meta(&snapshot, &id)?;
            if meta.missing_count == 0 {
                return Ok(Have::All);
            }
            let prefix = with_suffix(&generation_prefix(&meta.id, meta.generation), "k");
            let mut had = HashSet::new();
            scan_prefix(&snapshot, &prefix, |_, value| {
                let (have, digest) = parse_chunk_value(value)?;
                if have {
                    had.insert(digest);
                }
                Ok(true)
            })?;
            Ok(Have::Some(had))
        })
        .await
    }

    /// Resolve a had slot carrying `digest` to its bytes on disk
    pub async fn locate_chunk(&self, id: &str, digest: &ChunkId) -> Result<Option<ChunkLocation>> {
        let id = id.to_string();
        let digest = digest.clone();
        self.blocking(move |db| {
            let snapshot = db.snapshot();
            let Some(meta) = read_meta(&snapshot, &id)? else {
                return Ok(None);
            };
            let Some(directory) = meta.directory.as_ref() else {
                return Ok(None);
            };
            let gen_prefix = generation_prefix(&meta.id, meta.generation);

            for (file, chunk) in slots_for_digest(&snapshot, &gen_prefix, &digest)? {
                let Some(value) = snapshot.get(chunk_key(&gen_prefix, file, chunk))? else {
                    continue;
                };
                if !parse_chunk_value(&value)?.0 {
                    continue;
                }
                let Some(record) =
                    snapshot.get(with_suffix(&gen_prefix, &format!("f{:08x}", file)))?
                else {
                    continue;
                };
                let record: FileRecord = serde_json::from_slice(&record)?;
                let Some((offset, length)) =
                    chunk_span(record.size, meta.chunk_size, chunk as u64)
                else {
                    continue;
                };
                return Ok(Some(ChunkLocation {
                    path: Path::new(directory).join(&record.path),
                    offset,
                    length,
                }));
            }
            Ok(None)
        })
        .await
    }
}
