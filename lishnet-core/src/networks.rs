//! Network registry
//!
//! Maps each configured network to its lifecycle state and, while enabled,
//! its running session. Operations on one network are serialized by that
//! network's slot lock; different networks never wait on each other.

use libp2p::{identity::Keypair, Multiaddr, PeerId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::netconfig::{NetConfigError, NetworkConfig, NetworkConfigStore, NetworkDefinition};
use crate::p2p::{P2PError, SwarmSettings};
use crate::session::{start_session, NetworkStatus, PeerInfo, RunningSession, SessionHandle};
use crate::store::ChunkStore;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Network not found: {0}")]
    NotFound(String),

    #[error("Network not enabled: {0}")]
    NotEnabled(String),

    #[error(transparent)]
    Config(#[from] NetConfigError),

    #[error(transparent)]
    P2P(#[from] P2PError),

    #[error("Failed to listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Network session closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

/// A stored network with its live state
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    #[serde(flatten)]
    pub config: NetworkConfig,
    pub state: NetworkState,
}

struct NetworkSlot {
    state: watch::Sender<NetworkState>,
    session: Mutex<Option<RunningSession>>,
}

impl NetworkSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(NetworkState::Disabled);
        Self {
            state,
            session: Mutex::new(None),
        }
    }
}

pub struct NetworkRegistry {
    configs: NetworkConfigStore,
    keypair: Keypair,
    listen: Multiaddr,
    settings: SwarmSettings,
    store: ChunkStore,
    metrics: Metrics,
    slots: Mutex<HashMap<String, Arc<NetworkSlot>>>,
}

impl NetworkRegistry {
    pub fn new(
        configs: NetworkConfigStore,
        keypair: Keypair,
        listen: Multiaddr,
        settings: SwarmSettings,
        store: ChunkStore,
        metrics: Metrics,
    ) -> Self {
        Self {
            configs,
            keypair,
            listen,
            settings,
            store,
            metrics,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    async fn slot(&self, id: &str) -> Arc<NetworkSlot> {
        self.slots
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(NetworkSlot::new()))
            .clone()
    }

    async fn existing_slot(&self, id: &str) -> Option<Arc<NetworkSlot>> {
        self.slots.lock().await.get(id).cloned()
    }

    pub async fn state(&self, id: &str) -> NetworkState {
        match self.existing_slot(id).await {
            Some(slot) => *slot.state.borrow(),
            None => NetworkState::Disabled,
        }
    }

    /// Watch lifecycle changes of a network
    pub async fn watch_state(&self, id: &str) -> watch::Receiver<NetworkState> {
        self.slot(id).await.state.subscribe()
    }

    pub async fn enabled_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|s| *s.state.borrow() == NetworkState::Enabled)
            .count()
    }

    /// Enable or disable a network and persist the choice
    ///
    /// Enabling an enabled network is a no-op. When the listener cannot
    /// start the network stays disabled and the error is returned.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let config = self
            .configs
            .get(id)
            .await
            .ok_or_else(|| NetworkError::NotFound(id.to_string()))?;
        if enabled {
            self.start(&config.definition).await?;
        } else {
            self.stop(id).await;
        }
        self.configs.set_enabled(id, enabled).await?;
        Ok(())
    }

    async fn start(&self, definition: &NetworkDefinition) -> Result<()> {
        let id = definition.network_id.as_str();
        let slot = self.slot(id).await;
        let mut session = slot.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        slot.state.send_replace(NetworkState::Enabling);
        match start_session(
            definition,
            self.keypair.clone(),
            self.listen.clone(),
            self.settings,
            self.store.clone(),
            self.metrics.clone(),
        )
        .await
        {
            Ok(running) => {
                *session = Some(running);
                slot.state.send_replace(NetworkState::Enabled);
                info!("Network {} ({}) enabled", definition.name, id);
                Ok(())
            }
            Err(e) => {
                slot.state.send_replace(NetworkState::Disabled);
                warn!("Network {} failed to start: {}", id, e);
                Err(e)
            }
        }
    }

    async fn stop(&self, id: &str) {
        let Some(slot) = self.existing_slot(id).await else {
            return;
        };
        let mut session = slot.session.lock().await;
        let Some(running) = session.take() else {
            return;
        };

        slot.state.send_replace(NetworkState::Disabling);
        running.handle.shutdown().await;
        if let Err(e) = running.task.await {
            warn!("Network {} session task ended abnormally: {}", id, e);
        }
        slot.state.send_replace(NetworkState::Disabled);
        info!("Network {} disabled", id);
    }

    /// Handle to the running session of an enabled network
    pub async fn session(&self, id: &str) -> Result<SessionHandle> {
        let slot = self
            .existing_slot(id)
            .await
            .ok_or_else(|| self.not_enabled(id))?;
        if *slot.state.borrow() != NetworkState::Enabled {
            return Err(self.not_enabled(id));
        }
        let session = slot.session.lock().await;
        session
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or_else(|| self.not_enabled(id))
    }

    fn not_enabled(&self, id: &str) -> NetworkError {
        NetworkError::NotEnabled(id.to_string())
    }

    pub async fn connect(&self, id: &str, addr: &str) -> Result<PeerId> {
        let addr: Multiaddr = addr
            .parse()
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", addr, e)))?;
        let peer = self.session(id).await?.dial(addr.clone()).await?;
        info!("Network {}: connected to {} via {}", id, peer, addr);
        Ok(peer)
    }

    pub async fn status(&self, id: &str) -> Result<NetworkStatus> {
        self.session(id).await?.status().await
    }

    pub async fn addresses(&self, id: &str) -> Result<Vec<String>> {
        self.session(id).await?.addresses().await
    }

    pub async fn peers(&self, id: &str) -> Result<Vec<PeerInfo>> {
        self.session(id).await?.peers().await
    }

    pub async fn find_peer(&self, id: &str, peer: &str) -> Result<Vec<String>> {
        let peer: PeerId = peer
            .parse()
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", peer, e)))?;
        self.session(id).await?.find_peer(peer).await
    }

    pub async fn list(&self) -> Vec<NetworkInfo> {
        let mut out = Vec::new();
        for config in self.configs.list().await {
            let state = self.state(config.id()).await;
            out.push(NetworkInfo { config, state });
        }
        out
    }

    pub async fn get(&self, id: &str) -> Result<NetworkInfo> {
        let config = self
            .configs
            .get(id)
            .await
            .ok_or_else(|| NetworkError::NotFound(id.to_string()))?;
        Ok(NetworkInfo {
            state: self.state(id).await,
            config,
        })
    }

    /// Definition without local state, for sharing
    pub async fn export(&self, id: &str) -> Result<NetworkDefinition> {
        Ok(self.get(id).await?.config.definition)
    }

    /// Add or replace a definition
    ///
    /// A running network is restarted so a changed key or bootstrap list
    /// takes effect.
    pub async fn import(&self, definition: NetworkDefinition) -> Result<NetworkInfo> {
        let id = definition.network_id.clone();
        let config = self.configs.import(definition).await?;
        if self.state(&id).await == NetworkState::Enabled {
            self.stop(&id).await;
            self.start(&config.definition).await?;
        }
        self.get(&id).await
    }

    pub async fn import_many(&self, definitions: Vec<NetworkDefinition>) -> Result<usize> {
        Ok(self.configs.import_many(definitions).await?)
    }

    /// Disable (if running) and remove a network
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.stop(id).await;
        self.slots.lock().await.remove(id);
        Ok(self.configs.delete(id).await?)
    }

    /// Enable every network stored as enabled; returns how many started
    pub async fn enable_persisted(&self) -> usize {
        let mut started = 0;
        for config in self.configs.list().await {
            if !config.enabled {
                continue;
            }
            match self.start(&config.definition).await {
                Ok(()) => started += 1,
                Err(e) => warn!("Could not enable network {}: {}", config.id(), e),
            }
        }
        started
    }

    /// Stop every session without touching the persisted flags
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netconfig::generate_psk;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: NetworkRegistry,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let configs = NetworkConfigStore::open(&dir.path().join("networks.json"))
            .await
            .unwrap();
        let store = ChunkStore::open(dir.path().join("db")).unwrap();
        let settings = SwarmSettings {
            dial_timeout: Duration::from_secs(5),
            ..SwarmSettings::default()
        };
        let registry = NetworkRegistry::new(
            configs,
            Keypair::generate_ed25519(),
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            settings,
            store,
            Metrics::new(),
        );
        Fixture {
            _dir: dir,
            registry,
        }
    }

    fn definition(id: &str) -> NetworkDefinition {
        NetworkDefinition {
            version: 1,
            network_id: id.to_string(),
            name: format!("net {}", id),
            description: None,
            bootstrap_peer_addresses: vec![],
            created: "2024-01-01T00:00:00Z".to_string(),
            pre_shared_key: generate_psk(),
        }
    }

    #[tokio::test]
    async fn test_enable_disable_lifecycle() {
        let f = fixture().await;
        f.registry.import(definition("a")).await.unwrap();
        assert_eq!(f.registry.state("a").await, NetworkState::Disabled);
        assert!(matches!(
            f.registry.status("a").await,
            Err(NetworkError::NotEnabled(_))
        ));

        f.registry.set_enabled("a", true).await.unwrap();
        assert_eq!(f.registry.state("a").await, NetworkState::Enabled);
        assert_eq!(f.registry.enabled_count().await, 1);

        // Redundant enable keeps the same session
        let before = f.registry.addresses("a").await.unwrap();
        f.registry.set_enabled("a", true).await.unwrap();
        assert_eq!(f.registry.addresses("a").await.unwrap(), before);

        let status = f.registry.status("a").await.unwrap();
        assert_eq!(status.network_id, "a");
        assert_eq!(status.connected_peers, 0);
        assert!(before[0].contains("/p2p/"));

        f.registry.set_enabled("a", false).await.unwrap();
        assert_eq!(f.registry.state("a").await, NetworkState::Disabled);
        assert!(f.registry.status("a").await.is_err());
        assert!(!f.registry.get("a").await.unwrap().config.enabled);
    }

    #[tokio::test]
    async fn test_unknown_network() {
        let f = fixture().await;
        assert!(matches!(
            f.registry.set_enabled("missing", true).await,
            Err(NetworkError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listen_failure_leaves_network_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let configs = NetworkConfigStore::open(&dir.path().join("networks.json"))
            .await
            .unwrap();
        configs.import(definition("a")).await.unwrap();
        let registry = NetworkRegistry::new(
            configs,
            Keypair::generate_ed25519(),
            "/ip4/203.0.113.1/tcp/0".parse().unwrap(),
            SwarmSettings {
                dial_timeout: Duration::from_secs(2),
                ..SwarmSettings::default()
            },
            ChunkStore::open(dir.path().join("db")).unwrap(),
            Metrics::new(),
        );

        assert!(registry.set_enabled("a", true).await.is_err());
        assert_eq!(registry.state("a").await, NetworkState::Disabled);
        assert!(!registry.get("a").await.unwrap().config.enabled);
    }

    #[tokio::test]
    async fn test_delete_disables_first() {
        let f = fixture().await;
        f.registry.import(definition("a")).await.unwrap();
        f.registry.set_enabled("a", true).await.unwrap();

        assert!(f.registry.delete("a").await.unwrap());
        assert_eq!(f.registry.state("a").await, NetworkState::Disabled);
        assert!(f.registry.list().await.is_empty());
        assert!(!f.registry.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_enable_persisted() {
        let f = fixture().await;
        f.registry.import(definition("a")).await.unwrap();
        f.registry.import(definition("b")).await.unwrap();
        f.registry.configs.set_enabled("b", true).await.unwrap();

        assert_eq!(f.registry.enable_persisted().await, 1);
        assert_eq!(f.registry.state("a").await, NetworkState::Disabled);
        assert_eq!(f.registry.state("b").await, NetworkState::Enabled);

        f.registry.shutdown().await;
        assert_eq!(f.registry.state("b").await, NetworkState::Disabled);
        assert!(f.registry.get("b").await.unwrap().config.enabled);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_address() {
        let f = fixture().await;
        f.registry.import(definition("a")).await.unwrap();
        f.registry.set_enabled("a", true).await.unwrap();
        assert!(matches!(
            f.registry.connect("a", "not an address").await,
            Err(NetworkError::InvalidAddress(_))
        ));
        f.registry.shutdown().await;
    }
}
