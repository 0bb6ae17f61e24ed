//! Transfer engine
//!
//! Turns a dataset's missing chunk slots into a verified local copy. A
//! transfer asks connected peers what they hold, fetches each missing digest
//! once, checks it against the manifest, writes it to every slot that carries
//! it and only then marks those slots as had. Bytes that fail verification
//! are never written.
//!
//! Phases: `Negotiating -> Fetching <-> Verifying -> Complete`, with `Failed`
//! reachable from any of them.

use futures::{StreamExt, TryStreamExt};
use libp2p::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::chunker::write_chunk_at;
use crate::digest::{verify_chunk, ChunkId, DigestError};
use crate::events::{CompleteEvent, ErrorEvent, EventBus, ProgressEvent, TransferEvent};
use crate::manifest::{Manifest, ManifestError};
use crate::messages::{ChunkRequest, ResponseStatus};
use crate::metrics::Metrics;
use crate::networks::{NetworkError, NetworkRegistry, NetworkState};
use crate::pending_chunks::{PendingChunks, RetriesExhausted};
use crate::session::SessionHandle;
use crate::store::{ChunkStore, Have, MissingChunk, StoreError, StoredDataset};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("No peer on network {network} advertises dataset {dataset} after {attempts} attempts")]
    NoPeers {
        network: String,
        dataset: String,
        attempts: u32,
    },

    #[error("No connected peer has chunk {0}")]
    ChunkUnavailable(ChunkId),

    #[error(transparent)]
    ChunkFailed(#[from] RetriesExhausted),

    #[error("Dataset {dataset} still misses {missing} chunks")]
    Incomplete { dataset: String, missing: usize },

    #[error("Transfer of {0} is already running")]
    AlreadyActive(String),

    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;

fn join_error(e: tokio::task::JoinError) -> TransferError {
    TransferError::Io(std::io::Error::other(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub download_dir: PathBuf,
    pub chunk_retries: u32,
    pub max_parallel_chunks: usize,
    pub peer_discovery_attempts: u32,
    pub peer_retry_interval: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./data/downloads"),
            chunk_retries: 3,
            max_parallel_chunks: 8,
            peer_discovery_attempts: 10,
            peer_retry_interval: Duration::from_millis(1000),
        }
    }
}

/// Where the manifest of a download comes from
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Manifest(Manifest),
}

impl ManifestSource {
    /// Load and validate the manifest
    pub async fn load(self) -> Result<Manifest> {
        match self {
            ManifestSource::Path(path) => {
                let bytes = tokio::fs::read(&path).await?;
                Ok(Manifest::from_bytes(&bytes)?)
            }
            ManifestSource::Bytes(bytes) => Ok(Manifest::from_bytes(&bytes)?),
            ManifestSource::Manifest(manifest) => {
                manifest.validate()?;
                Ok(manifest)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    Negotiating,
    Fetching,
    Verifying,
    Complete,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferPhase::Complete | TransferPhase::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub dataset_id: String,
    pub network_id: String,
    pub phase: TransferPhase,
    pub total_chunks: u64,
    pub have_chunks: u64,
    pub bytes_fetched: u64,
    pub directory: PathBuf,
    pub error: Option<String>,
    #[serde(skip)]
    verifying: usize,
}

/// Caller side of a running download
#[derive(Clone)]
pub struct DownloadHandle {
    dataset_id: String,
    network_id: String,
    status: watch::Receiver<TransferStatus>,
    cancel: Arc<watch::Sender<bool>>,
}

impl DownloadHandle {
    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.clone()
    }

    /// Ask the transfer to stop; it ends as Failed
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for Complete or Failed
    pub async fn wait(&self) -> TransferStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|s| s.phase.is_terminal()).await {
            return status.clone();
        }
        let status = rx.borrow().clone();
        status
    }
}

struct EngineInner {
    store: ChunkStore,
    networks: Arc<NetworkRegistry>,
    events: EventBus,
    metrics: Metrics,
    settings: TransferSettings,
    active: Mutex<HashMap<String, DownloadHandle>>,
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(
        store: ChunkStore,
        networks: Arc<NetworkRegistry>,
        events: EventBus,
        metrics: Metrics,
        settings: TransferSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                networks,
                events,
                metrics,
                settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start downloading a dataset from the peers of `network_id`
    ///
    /// Input, store and network state errors are returned here. Everything
    /// that goes wrong after the transfer starts is reported through the
    /// handle and a `download:error` event.
    pub async fn download(&self, network_id: &str, source: ManifestSource) -> Result<DownloadHandle> {
        let manifest = source.load().await?;
        let session = self.inner.networks.session(network_id).await?;
        let network_state = self.inner.networks.watch_state(network_id).await;

        let mut active = self.inner.active.lock().await;
        if active.contains_key(&manifest.id) {
            return Err(TransferError::AlreadyActive(manifest.id));
        }

        let directory = self.prepare(&manifest).await?;
        let (status_tx, status_rx) = watch::channel(TransferStatus {
            dataset_id: manifest.id.clone(),
            network_id: network_id.to_string(),
            phase: TransferPhase::Negotiating,
            total_chunks: manifest.chunk_count() as u64,
            have_chunks: 0,
            bytes_fetched: 0,
            directory: directory.clone(),
            error: None,
            verifying: 0,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = DownloadHandle {
            dataset_id: manifest.id.clone(),
            network_id: network_id.to_string(),
            status: status_rx,
            cancel: Arc::new(cancel_tx),
        };
        active.insert(manifest.id.clone(), handle.clone());
        drop(active);

        info!(
            "Starting download of {} ({} chunks) on network {} into {}",
            manifest.id,
            manifest.chunk_count(),
            network_id,
            directory.display()
        );
        let transfer = Transfer {
            engine: self.clone(),
            network_id: network_id.to_string(),
            manifest,
            session,
            directory,
            status: status_tx,
            cancel: cancel_rx,
            network_state,
        };
        tokio::spawn(transfer.run());
        Ok(handle)
    }

    /// Transfers that have not finished yet
    pub async fn active(&self) -> Vec<TransferStatus> {
        let mut out: Vec<TransferStatus> = self
            .inner
            .active
            .lock()
            .await
            .values()
            .map(|h| h.status())
            .collect();
        out.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        out
    }

    pub async fn handle(&self, dataset_id: &str) -> Option<DownloadHandle> {
        self.inner.active.lock().await.get(dataset_id).cloned()
    }

    /// Cancel a running transfer; false when none is running for that id
    pub async fn cancel(&self, dataset_id: &str) -> bool {
        match self.handle(dataset_id).await {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Register the dataset in the store and lay out its target directory
    ///
    /// A stored dataset with the same manifest keeps its directory and the
    /// chunks it already has, so an interrupted download resumes.
    async fn prepare(&self, manifest: &Manifest) -> Result<PathBuf> {
        let store = &self.inner.store;
        let directory = match store.get(&manifest.id).await? {
            Some(StoredDataset {
                manifest: stored,
                directory: Some(directory),
                ..
            }) if &stored == manifest => {
                debug!("Resuming {} in {}", manifest.id, directory);
                PathBuf::from(directory)
            }
            _ => {
                let directory = self.inner.settings.download_dir.join(&manifest.id);
                store
                    .upsert(
                        manifest,
                        Some(directory.to_string_lossy().into_owned()),
                        None,
                    )
                    .await?;
                directory
            }
        };

        let layout_manifest = manifest.clone();
        let layout_dir = directory.clone();
        tokio::task::spawn_blocking(move || layout(&layout_manifest, &layout_dir))
            .await
            .map_err(join_error)??;
        Ok(directory)
    }
}

/// Create directories and pre-size every file
fn layout(manifest: &Manifest, root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    for dir in &manifest.directories {
        std::fs::create_dir_all(root.join(&dir.path))?;
    }
    for file in &manifest.files {
        let path = root.join(&file.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if handle.metadata()?.len() != file.size {
            handle.set_len(file.size)?;
        }
    }
    Ok(())
}

fn is_contained(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Recreate the manifest's links once all files are in place
fn create_links(manifest: &Manifest, root: &Path) {
    for link in &manifest.links {
        let path = root.join(&link.path);
        if path.symlink_metadata().is_ok() {
            continue;
        }
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create {}: {}", parent.display(), e);
                continue;
            }
        }
        let result = if link.hardlink() {
            if !is_contained(&link.target) {
                warn!("Skipping hardlink {} to {}", link.path, link.target);
                continue;
            }
            std::fs::hard_link(root.join(&link.target), &path)
        } else {
            symlink(&link.target, &path)
        };
        if let Err(e) = result {
            warn!("Cannot create link {}: {}", link.path, e);
        }
    }
}

#[cfg(unix)]
fn symlink(target: &str, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn symlink(_target: &str, _path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::other("symbolic links are not supported here"))
}

/// Missing slots grouped by digest, in the order the store listed them
fn group_by_digest(missing: Vec<MissingChunk>) -> Vec<(ChunkId, Vec<MissingChunk>)> {
    let mut index: HashMap<ChunkId, usize> = HashMap::new();
    let mut groups: Vec<(ChunkId, Vec<MissingChunk>)> = Vec::new();
    for slot in missing {
        match index.get(&slot.digest) {
            Some(&i) => groups[i].1.push(slot),
            None => {
                index.insert(slot.digest.clone(), groups.len());
                groups.push((slot.digest.clone(), vec![slot]));
            }
        }
    }
    groups
}

struct Transfer {
    engine: TransferEngine,
    network_id: String,
    manifest: Manifest,
    session: SessionHandle,
    directory: PathBuf,
    status: watch::Sender<TransferStatus>,
    cancel: watch::Receiver<bool>,
    network_state: watch::Receiver<NetworkState>,
}

impl Transfer {
    fn inner(&self) -> &EngineInner {
        &self.engine.inner
    }

    fn dataset_id(&self) -> &str {
        &self.manifest.id
    }

    async fn run(self) {
        let started = Instant::now();
        let result = tokio::select! {
            result = self.fetch_all() => result,
            reason = self.cancelled() => Err(TransferError::Cancelled(reason)),
        };

        if result.is_ok() {
            let manifest = self.manifest.clone();
            let root = self.directory.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || create_links(&manifest, &root)).await
            {
                warn!("Link creation for {} failed: {}", self.dataset_id(), e);
            }
        }
        self.inner().active.lock().await.remove(self.dataset_id());

        match result {
            Ok(()) => {
                self.status.send_modify(|s| {
                    s.phase = TransferPhase::Complete;
                    s.have_chunks = s.total_chunks;
                });
                self.inner().metrics.download_completed();
                info!(
                    "Download of {} complete in {:.1}s",
                    self.dataset_id(),
                    started.elapsed().as_secs_f64()
                );
                self.inner()
                    .events
                    .publish(TransferEvent::Complete(CompleteEvent {
                        dataset_id: self.dataset_id().to_string(),
                        network_id: self.network_id.clone(),
                        directory: self.directory.clone(),
                    }));
            }
            Err(e) => {
                let message = e.to_string();
                error!("Download of {} failed: {}", self.dataset_id(), message);
                self.status.send_modify(|s| {
                    s.phase = TransferPhase::Failed;
                    s.error = Some(message.clone());
                });
                self.inner().metrics.download_failed();
                self.inner().events.publish(TransferEvent::Error(ErrorEvent {
                    dataset_id: self.dataset_id().to_string(),
                    network_id: self.network_id.clone(),
                    error: message,
                }));
            }
        }
    }

    /// Resolves with a reason once the caller cancels or the network goes away
    async fn cancelled(&self) -> String {
        let mut cancel = self.cancel.clone();
        let mut network = self.network_state.clone();
        loop {
            if *cancel.borrow_and_update() {
                return "cancelled by request".to_string();
            }
            if *network.borrow_and_update() != NetworkState::Enabled {
                return format!("network {} disabled", self.network_id);
            }
            tokio::select! {
                changed = cancel.changed() => if changed.is_err() {
                    return "cancelled by request".to_string();
                },
                changed = network.changed() => if changed.is_err() {
                    return format!("network {} removed", self.network_id);
                },
            }
        }
    }

    /// A closed session means the network was disabled under us
    fn network_error(&self, e: NetworkError) -> TransferError {
        match e {
            NetworkError::Closed(_) => {
                TransferError::Cancelled(format!("network {} disabled", self.network_id))
            }
            other => other.into(),
        }
    }

    fn set_phase(&self, phase: TransferPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    async fn fetch_all(&self) -> Result<()> {
        let store = &self.inner().store;
        let missing = store.missing_chunks(self.dataset_id()).await?;
        let missing_count = missing.len() as u64;
        self.status
            .send_modify(|s| s.have_chunks = s.total_chunks.saturating_sub(missing_count));

        if !missing.is_empty() {
            let peers = self.negotiate().await?;
            self.set_phase(TransferPhase::Fetching);

            let groups = group_by_digest(missing);
            let settings = &self.inner().settings;
            let pending =
                PendingChunks::with_config(settings.chunk_retries, settings.peer_retry_interval);
            for (digest, _) in &groups {
                pending.add(digest.clone());
            }
            debug!(
                "Fetching {} distinct chunks of {} from {} peers",
                groups.len(),
                self.dataset_id(),
                peers.len()
            );

            let peers = &peers;
            let pending = &pending;
            futures::stream::iter(groups.into_iter().map(Ok))
                .try_for_each_concurrent(settings.max_parallel_chunks.max(1), |(digest, slots)| {
                    self.fetch_chunk(digest, slots, peers, pending)
                })
                .await?;
        }

        self.set_phase(TransferPhase::Verifying);
        if !store.is_complete(self.dataset_id()).await? {
            let missing = store.missing_chunks(self.dataset_id()).await?.len();
            return Err(TransferError::Incomplete {
                dataset: self.dataset_id().to_string(),
                missing,
            });
        }
        Ok(())
    }

    /// Ask every connected peer what it holds of this dataset
    async fn negotiate(&self) -> Result<Vec<(PeerId, Have)>> {
        let settings = &self.inner().settings;
        let attempts = settings.peer_discovery_attempts.max(1);
        for attempt in 1..=attempts {
            let connected = self
                .session
                .connected_peers()
                .await
                .map_err(|e| self.network_error(e))?;
            let answers = futures::stream::iter(connected)
                .map(|peer| async move {
                    let response = self
                        .session
                        .request(peer, ChunkRequest::have(self.dataset_id()))
                        .await;
                    (peer, response)
                })
                .buffer_unordered(16)
                .collect::<Vec<_>>()
                .await;

            let mut advertised = Vec::new();
            for (peer, response) in answers {
                match response {
                    Ok(r) if r.response_status() == ResponseStatus::Ok => {
                        advertised.push((peer, r.to_have()));
                    }
                    Ok(_) => debug!("Peer {} does not have {}", peer, self.dataset_id()),
                    Err(e @ NetworkError::Closed(_)) => return Err(self.network_error(e)),
                    Err(e) => debug!("Have query to {} failed: {}", peer, e),
                }
            }
            if !advertised.is_empty() {
                advertised.sort_by_key(|(peer, _)| *peer);
                info!(
                    "{} peers advertise {} (attempt {})",
                    advertised.len(),
                    self.dataset_id(),
                    attempt
                );
                return Ok(advertised);
            }
            if attempt < attempts {
                tokio::time::sleep(settings.peer_retry_interval).await;
            }
        }
        Err(TransferError::NoPeers {
            network: self.network_id.clone(),
            dataset: self.dataset_id().to_string(),
            attempts,
        })
    }

    async fn fetch_chunk(
        &self,
        digest: ChunkId,
        slots: Vec<MissingChunk>,
        peers: &[(PeerId, Have)],
        pending: &PendingChunks,
    ) -> Result<()> {
        let candidates: Vec<PeerId> = peers
            .iter()
            .filter(|(_, have)| have.contains(&digest))
            .map(|(peer, _)| *peer)
            .collect();
        if candidates.is_empty() {
            return Err(TransferError::ChunkUnavailable(digest));
        }

        loop {
            if !self.inner().store.exists(self.dataset_id()).await? {
                return Err(TransferError::Cancelled(format!(
                    "dataset {} removed",
                    self.dataset_id()
                )));
            }

            let attempt = pending.begin_attempt(&digest).unwrap_or(1);
            let peer = candidates[(attempt as usize - 1) % candidates.len()];
            let started = Instant::now();

            let reason = match self
                .session
                .request(peer, ChunkRequest::chunk(self.dataset_id(), &digest))
                .await
            {
                Ok(response) => match response.response_status() {
                    ResponseStatus::Ok => match self.verify(&digest, response.data).await? {
                        Ok(data) => {
                            self.store_chunk(&digest, &slots, data, started).await?;
                            pending.complete(&digest);
                            return Ok(());
                        }
                        Err(e) => {
                            self.inner().metrics.verification_failed();
                            warn!("Discarding chunk from {}: {}", peer, e);
                            e.to_string()
                        }
                    },
                    ResponseStatus::NotFound => format!("peer {} does not have the chunk", peer),
                    ResponseStatus::Error => format!("peer {}: {}", peer, response.error),
                },
                Err(e @ NetworkError::Closed(_)) => return Err(self.network_error(e)),
                Err(e) => e.to_string(),
            };

            pending.record_failure(&digest, reason)?;
            tokio::time::sleep(pending.retry_interval()).await;
        }
    }

    /// Hash received bytes off the async runtime
    async fn verify(
        &self,
        digest: &ChunkId,
        data: Vec<u8>,
    ) -> Result<std::result::Result<Vec<u8>, DigestError>> {
        self.status.send_modify(|s| {
            s.verifying += 1;
            s.phase = TransferPhase::Verifying;
        });
        let algorithm = self.manifest.checksum_algorithm;
        let expected = digest.clone();
        let verified =
            tokio::task::spawn_blocking(move || verify_chunk(algorithm, &data, &expected).map(|_| data))
                .await
                .map_err(join_error);
        self.status.send_modify(|s| {
            s.verifying = s.verifying.saturating_sub(1);
            if s.verifying == 0 && !s.phase.is_terminal() {
                s.phase = TransferPhase::Fetching;
            }
        });
        verified
    }

    /// Write verified bytes to every slot and mark each one had
    async fn store_chunk(
        &self,
        digest: &ChunkId,
        slots: &[MissingChunk],
        data: Vec<u8>,
        started: Instant,
    ) -> Result<()> {
        let chunk_size = self.manifest.chunk_size;
        let targets: Vec<(PathBuf, u64)> = slots
            .iter()
            .filter_map(|slot| {
                let file = self.manifest.files.get(slot.file_index as usize)?;
                Some((
                    self.directory.join(&file.path),
                    slot.chunk_index as u64 * chunk_size,
                ))
            })
            .collect();
        let len = data.len();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            for (path, offset) in targets {
                let mut file = OpenOptions::new().write(true).open(&path)?;
                write_chunk_at(&mut file, offset, &data)?;
                file.sync_data()?;
            }
            Ok(())
        })
        .await
        .map_err(join_error)??;

        let store = &self.inner().store;
        let mut marked = 0u64;
        for _ in slots {
            match store.mark_have(self.dataset_id(), digest).await {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(StoreError::DatasetNotFound(_)) => {
                    return Err(TransferError::Cancelled(format!(
                        "dataset {} removed",
                        self.dataset_id()
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.inner()
            .metrics
            .chunk_fetched(len, started.elapsed().as_millis() as u64);
        let mut progress = None;
        self.status.send_modify(|s| {
            s.have_chunks = (s.have_chunks + marked).min(s.total_chunks);
            s.bytes_fetched += len as u64;
            progress = Some(ProgressEvent {
                dataset_id: s.dataset_id.clone(),
                network_id: s.network_id.clone(),
                have_chunks: s.have_chunks,
                total_chunks: s.total_chunks,
                bytes_fetched: s.bytes_fetched,
            });
        });
        if let Some(progress) = progress {
            self.inner().events.publish(TransferEvent::Progress(progress));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ChecksumAlgorithm;
    use crate::manifest::{DirectoryEntry, FileEntry};
    use crate::netconfig::{generate_psk, NetworkConfigStore, NetworkDefinition};
    use crate::p2p::SwarmSettings;
    use libp2p::identity::Keypair;

    fn slot(file: u32, chunk: u32, data: &[u8]) -> MissingChunk {
        MissingChunk {
            file_index: file,
            chunk_index: chunk,
            digest: ChecksumAlgorithm::Sha256.digest(data),
        }
    }

    #[test]
    fn test_group_by_digest_keeps_store_order() {
        let groups = group_by_digest(vec![
            slot(0, 0, b"a"),
            slot(0, 1, b"b"),
            slot(1, 0, b"a"),
            slot(1, 1, b"c"),
        ]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].0, ChecksumAlgorithm::Sha256.digest(b"a"));
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, ChecksumAlgorithm::Sha256.digest(b"b"));
        assert_eq!(groups[2].0, ChecksumAlgorithm::Sha256.digest(b"c"));
    }

    fn manifest() -> Manifest {
        let algo = ChecksumAlgorithm::Sha256;
        let mut manifest = Manifest::new(Some("ds".to_string()), 4, algo);
        manifest.files.push(FileEntry {
            path: "sub/f".to_string(),
            size: 6,
            permissions: None,
            modified: None,
            created: None,
            chunk_digests: vec![algo.digest(b"abcd"), algo.digest(b"ef")],
        });
        manifest.directories.push(DirectoryEntry {
            path: "empty".to_string(),
            permissions: None,
            modified: None,
            created: None,
        });
        manifest
    }

    #[test]
    fn test_layout_presizes_files() {
        let dir = tempfile::tempdir().unwrap();
        layout(&manifest(), dir.path()).unwrap();
        assert_eq!(
            std::fs::metadata(dir.path().join("sub/f")).unwrap().len(),
            6
        );
        assert!(dir.path().join("empty").is_dir());

        // Existing bytes survive a second layout
        std::fs::write(dir.path().join("sub/f"), b"abcdef").unwrap();
        layout(&manifest(), dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("sub/f")).unwrap(), b"abcdef");
    }

    #[test]
    fn test_contained_paths() {
        assert!(is_contained("a/b"));
        assert!(!is_contained("../a"));
        assert!(!is_contained("/etc/passwd"));
    }

    #[tokio::test]
    async fn test_manifest_source_rejects_invalid() {
        let mut bad = manifest();
        bad.chunk_size = 0;
        assert!(ManifestSource::Manifest(bad).load().await.is_err());
        assert!(ManifestSource::Bytes(b"{}".to_vec()).load().await.is_err());
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ChunkStore,
        networks: Arc<NetworkRegistry>,
        events: EventBus,
        engine: TransferEngine,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("db")).unwrap();
        let configs = NetworkConfigStore::open(&dir.path().join("networks.json"))
            .await
            .unwrap();
        configs
            .import(NetworkDefinition {
                version: 1,
                network_id: "net".to_string(),
                name: "net".to_string(),
                description: None,
                bootstrap_peer_addresses: vec![],
                created: "2024-01-01T00:00:00Z".to_string(),
                pre_shared_key: generate_psk(),
            })
            .await
            .unwrap();
        let metrics = Metrics::new();
        let networks = Arc::new(NetworkRegistry::new(
            configs,
            Keypair::generate_ed25519(),
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            SwarmSettings::default(),
            store.clone(),
            metrics.clone(),
        ));
        let events = EventBus::new();
        let engine = TransferEngine::new(
            store.clone(),
            networks.clone(),
            events.clone(),
            metrics,
            TransferSettings {
                download_dir: dir.path().join("downloads"),
                chunk_retries: 1,
                max_parallel_chunks: 2,
                peer_discovery_attempts: 2,
                peer_retry_interval: Duration::from_millis(50),
            },
        );
        Fixture {
            _dir: dir,
            store,
            networks,
            events,
            engine,
        }
    }

    #[tokio::test]
    async fn test_download_requires_enabled_network() {
        let f = fixture().await;
        let err = f
            .engine
            .download("net", ManifestSource::Manifest(manifest()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Network(NetworkError::NotEnabled(_))
        ));
        assert!(!f.store.exists("ds").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_peers_fails_with_error_event() {
        let f = fixture().await;
        f.networks.set_enabled("net", true).await.unwrap();
        let mut events = f.events.subscribe();

        let handle = f
            .engine
            .download("net", ManifestSource::Manifest(manifest()))
            .await
            .unwrap();
        let status = handle.wait().await;
        assert_eq!(status.phase, TransferPhase::Failed);
        assert!(status.error.unwrap().contains("No peer"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "download:error");
        assert!(f.engine.active().await.is_empty());
        assert!(!f.store.is_complete("ds").await.unwrap());
        f.networks.shutdown().await;
    }

    #[tokio::test]
    async fn test_complete_dataset_finishes_without_peers() {
        let f = fixture().await;
        f.networks.set_enabled("net", true).await.unwrap();
        let mut manifest = manifest();
        manifest.files[0].size = 0;
        manifest.files[0].chunk_digests.clear();

        let handle = f
            .engine
            .download("net", ManifestSource::Manifest(manifest))
            .await
            .unwrap();
        let status = handle.wait().await;
        assert_eq!(status.phase, TransferPhase::Complete);
        assert!(status.directory.join("sub/f").exists());
        f.networks.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabling_network_cancels_transfer() {
        let f = fixture().await;
        f.networks.set_enabled("net", true).await.unwrap();
        let engine = TransferEngine::new(
            f.store.clone(),
            f.networks.clone(),
            f.events.clone(),
            Metrics::new(),
            TransferSettings {
                download_dir: f._dir.path().join("downloads"),
                peer_discovery_attempts: 1000,
                peer_retry_interval: Duration::from_millis(50),
                ..TransferSettings::default()
            },
        );

        let handle = engine
            .download("net", ManifestSource::Manifest(manifest()))
            .await
            .unwrap();
        f.networks.set_enabled("net", false).await.unwrap();
        let status = handle.wait().await;
        assert_eq!(status.phase, TransferPhase::Failed);
        assert!(status.error.unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn test_cancel_by_handle() {
        let f = fixture().await;
        f.networks.set_enabled("net", true).await.unwrap();
        let engine = TransferEngine::new(
            f.store.clone(),
            f.networks.clone(),
            f.events.clone(),
            Metrics::new(),
            TransferSettings {
                download_dir: f._dir.path().join("downloads"),
                peer_discovery_attempts: 1000,
                peer_retry_interval: Duration::from_millis(50),
                ..TransferSettings::default()
            },
        );

        let handle = engine
            .download("net", ManifestSource::Manifest(manifest()))
            .await
            .unwrap();
        assert!(matches!(
            engine
                .download("net", ManifestSource::Manifest(manifest()))
                .await,
            Err(TransferError::AlreadyActive(_))
        ));
        assert!(engine.cancel("ds").await);
        let status = handle.wait().await;
        assert_eq!(status.phase, TransferPhase::Failed);
        assert!(status.error.unwrap().contains("cancelled"));
        f.networks.shutdown().await;
    }
}
