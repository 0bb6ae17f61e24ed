//! Node facade
//!
//! Owns the chunk store, the network registry, the transfer engine and the
//! event bus, and exposes the operations of the control surface on top of
//! them.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::builder::{BuildError, ManifestBuilder};
use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::config::{Config, ConfigError};
use crate::digest::ChecksumAlgorithm;
use crate::events::{EventBus, TransferEvent};
use crate::manifest::{ExportOptions, Manifest, ManifestError};
use crate::metrics::Metrics;
use crate::netconfig::{NetConfigError, NetworkConfigStore};
use crate::networks::{NetworkError, NetworkRegistry, NetworkState};
use crate::p2p::{load_or_create_keypair, P2PError};
use crate::store::{
    ChunkStore, DatasetDetail, DatasetSummary, SortBy, SortOrder, StoreError,
};
use crate::transfer::{DownloadHandle, ManifestSource, TransferEngine, TransferError, TransferStatus};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    NetConfig(#[from] NetConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    P2P(#[from] P2PError),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// How a local file tree is turned into a dataset
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub chunk_size: u64,
    pub algorithm: ChecksumAlgorithm,
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            algorithm: ChecksumAlgorithm::default(),
            id: None,
            name: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetwork {
    pub network_id: String,
    pub name: String,
    pub state: NetworkState,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub peer_id: String,
    pub version: String,
    pub networks: Vec<NodeNetwork>,
}

#[derive(Clone)]
pub struct LishNode {
    peer_id: String,
    hash_workers: usize,
    store: ChunkStore,
    networks: Arc<NetworkRegistry>,
    transfers: TransferEngine,
    events: EventBus,
    metrics: Metrics,
}

impl LishNode {
    /// Open (or create) the node's state under `config.data_dir`
    pub async fn open(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let keypair = load_or_create_keypair(&config.node_key_path())?;
        let peer_id = keypair.public().to_peer_id().to_string();
        let store = ChunkStore::open(config.store_path())?;
        let configs = NetworkConfigStore::open(&config.networks_path()).await?;
        let metrics = Metrics::new();
        let events = EventBus::new();

        let networks = Arc::new(NetworkRegistry::new(
            configs,
            keypair,
            config.listen_multiaddr()?,
            config.swarm_settings(),
            store.clone(),
            metrics.clone(),
        ));
        let transfers = TransferEngine::new(
            store.clone(),
            networks.clone(),
            events.clone(),
            metrics.clone(),
            config.transfer_settings(),
        );

        info!("Node {} opened at {}", peer_id, config.data_dir.display());
        Ok(Self {
            peer_id,
            hash_workers: config.hash_workers,
            store,
            networks,
            transfers,
            events,
            metrics,
        })
    }

    /// Enable networks persisted as enabled
    pub async fn start(&self) -> usize {
        let started = self.networks.enable_persisted().await;
        info!("{} networks enabled on startup", started);
        started
    }

    pub async fn shutdown(&self) {
        self.networks.shutdown().await;
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn networks(&self) -> &NetworkRegistry {
        &self.networks
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Describe data already on disk and register it as fully present
    pub async fn import_local(&self, path: &Path, options: ImportOptions) -> Result<Manifest> {
        let root = tokio::fs::canonicalize(path)
            .await
            .map_err(|source| BuildError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut builder = ManifestBuilder::with_algorithm(options.chunk_size, options.algorithm)?
            .concurrency(self.hash_workers);
        if let Some(id) = options.id {
            builder = builder.id(id);
        }
        if let Some(name) = options.name {
            builder = builder.name(name);
        }
        if let Some(description) = options.description {
            builder = builder.description(description);
        }

        let build_root = root.clone();
        let manifest = tokio::task::spawn_blocking(move || builder.build(&build_root))
            .await
            .map_err(|e| NodeError::Task(e.to_string()))??;

        let directory: PathBuf = if root.is_file() {
            root.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone())
        } else {
            root.clone()
        };
        self.store
            .upsert(
                &manifest,
                Some(directory.to_string_lossy().into_owned()),
                Some(&manifest.digests()),
            )
            .await?;
        info!(
            "Imported {} as dataset {} ({} files, {} chunks)",
            root.display(),
            manifest.id,
            manifest.files.len(),
            manifest.chunk_count()
        );
        Ok(manifest)
    }

    /// Manifest of a stored dataset, local-only fields stripped
    pub async fn export_manifest(&self, id: &str, options: ExportOptions) -> Result<Vec<u8>> {
        let stored = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| NodeError::DatasetNotFound(id.to_string()))?;
        Ok(stored.manifest.to_bytes(options)?)
    }

    pub async fn datasets(&self, sort: SortBy, order: SortOrder) -> Result<Vec<DatasetSummary>> {
        Ok(self.store.list_summaries(sort, order).await?)
    }

    pub async fn dataset(&self, id: &str) -> Result<DatasetDetail> {
        self.store
            .get_detail(id)
            .await?
            .ok_or_else(|| NodeError::DatasetNotFound(id.to_string()))
    }

    /// Remove a dataset; a running download of it stops
    pub async fn remove_dataset(&self, id: &str) -> Result<bool> {
        self.transfers.cancel(id).await;
        Ok(self.store.remove(id).await?)
    }

    pub async fn download(&self, network_id: &str, source: ManifestSource) -> Result<DownloadHandle> {
        Ok(self.transfers.download(network_id, source).await?)
    }

    pub async fn transfers(&self) -> Vec<TransferStatus> {
        self.transfers.active().await
    }

    pub async fn cancel_transfer(&self, id: &str) -> bool {
        self.transfers.cancel(id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub async fn node_info(&self) -> NodeInfo {
        let mut networks = Vec::new();
        for info in self.networks.list().await {
            let addresses = if info.state == NetworkState::Enabled {
                self.networks
                    .addresses(info.config.id())
                    .await
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            networks.push(NodeNetwork {
                network_id: info.config.id().to_string(),
                name: info.config.definition.name.clone(),
                state: info.state,
                addresses,
            });
        }
        NodeInfo {
            peer_id: self.peer_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            networks,
        }
    }

    /// Prometheus text for `/metrics`
    pub async fn metrics_text(&self) -> Result<String> {
        let datasets = self
            .store
            .list_summaries(SortBy::default(), SortOrder::default())
            .await?
            .len();
        let enabled = self.networks.enabled_count().await;
        Ok(self.metrics.to_prometheus(datasets, enabled))
    }
}
