//! LISHnet Core
//!
//! Chunked dataset manifests, a persistent chunk store, PSK-isolated
//! libp2p overlays and the transfer engine that moves verified chunks
//! between nodes.

pub mod api;
pub mod builder;
pub mod chunker;
pub mod config;
pub mod digest;
pub mod events;
pub mod manifest;
pub mod messages;
pub mod metrics;
pub mod netconfig;
pub mod networks;
pub mod node;
pub mod p2p;
pub mod pending_chunks;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transfer;

pub use builder::{BuildError, BuildProgress, ManifestBuilder};
pub use chunker::DEFAULT_CHUNK_SIZE;
pub use config::{Command, Config, ConfigError};
pub use digest::{verify_chunk, ChecksumAlgorithm, ChunkId, DigestError};
pub use events::{EventBus, TransferEvent};
pub use manifest::{ExportOptions, Manifest, ManifestError};
pub use metrics::Metrics;
pub use netconfig::{generate_psk, NetConfigError, NetworkConfig, NetworkDefinition};
pub use networks::{NetworkError, NetworkInfo, NetworkRegistry, NetworkState};
pub use node::{ImportOptions, LishNode, NodeError};
pub use p2p::{create_swarm, Behaviour, P2PError, SwarmSettings};
pub use runtime::{make_lish, make_net, run_node};
pub use store::{ChunkStore, Have, SortBy, SortOrder, StoreError};
pub use transfer::{
    DownloadHandle, ManifestSource, TransferError, TransferPhase, TransferStatus,
};
