//! Network definitions and their persistent store
//!
//! A network is identified by `networkID` and keyed by a pre-shared key. The
//! id only names the network; the key decides who can join, so two
//! definitions with the same id and different keys are separate overlays.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use libp2p::pnet::PreSharedKey;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const NETWORK_DEFINITION_VERSION: u32 = 1;

const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";

#[derive(Debug, Error)]
pub enum NetConfigError {
    #[error("Invalid network definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid pre-shared key: {0}")]
    InvalidKey(String),

    #[error("Network not found: {0}")]
    NotFound(String),

    #[error("Network already exists: {0}")]
    AlreadyExists(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetConfigError>;

fn default_version() -> u32 {
    NETWORK_DEFINITION_VERSION
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Shareable description of a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDefinition {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(rename = "networkID", alias = "networkId")]
    pub network_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(alias = "bootstrapPeers")]
    pub bootstrap_peer_addresses: Vec<String>,
    #[serde(default = "now")]
    pub created: String,
    #[serde(default)]
    pub pre_shared_key: String,
}

/// Locally stored network: the definition plus whether it should run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(flatten)]
    pub definition: NetworkDefinition,
    #[serde(default)]
    pub enabled: bool,
}

impl NetworkDefinition {
    /// New definition with a freshly generated key
    pub fn generate(name: &str, description: Option<String>, bootstrap: Vec<String>) -> Self {
        Self {
            version: NETWORK_DEFINITION_VERSION,
            network_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description,
            bootstrap_peer_addresses: bootstrap,
            created: now(),
            pre_shared_key: generate_psk(),
        }
    }

    pub fn psk(&self) -> Result<PreSharedKey> {
        parse_psk(&self.pre_shared_key)
    }

    /// Parsed bootstrap addresses
    pub fn bootstrap_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.bootstrap_peer_addresses
            .iter()
            .map(|a| {
                a.parse::<Multiaddr>().map_err(|e| {
                    NetConfigError::InvalidDefinition(format!("bootstrap address {}: {}", a, e))
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.network_id.trim().is_empty() {
            return Err(NetConfigError::InvalidDefinition(
                "networkID is required".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(NetConfigError::InvalidDefinition("name is required".to_string()));
        }
        self.psk()?;
        self.bootstrap_addrs()?;
        Ok(())
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let definition: NetworkDefinition = serde_json::from_slice(bytes)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl NetworkConfig {
    pub fn id(&self) -> &str {
        &self.definition.network_id
    }
}

/// Fresh 32-byte key as 64 hex characters
pub fn generate_psk() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Accepts 64 hex characters, swarm-key text, or base64 of swarm-key text
pub fn parse_psk(text: &str) -> Result<PreSharedKey> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(NetConfigError::InvalidKey("missing preSharedKey".to_string()));
    }

    if trimmed.len() == 64 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        let bytes = hex::decode(trimmed).map_err(|e| NetConfigError::InvalidKey(e.to_string()))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(PreSharedKey::new(key));
    }

    if trimmed.starts_with(SWARM_KEY_HEADER) {
        return PreSharedKey::from_str(trimmed)
            .map_err(|e| NetConfigError::InvalidKey(e.to_string()));
    }

    let decoded = BASE64
        .decode(trimmed)
        .map_err(|_| NetConfigError::InvalidKey("unrecognized key format".to_string()))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| NetConfigError::InvalidKey("unrecognized key format".to_string()))?;
    if !text.trim_start().starts_with(SWARM_KEY_HEADER) {
        return Err(NetConfigError::InvalidKey("unrecognized key format".to_string()));
    }
    PreSharedKey::from_str(text.trim()).map_err(|e| NetConfigError::InvalidKey(e.to_string()))
}

/// Network configs persisted as one JSON array
pub struct NetworkConfigStore {
    path: PathBuf,
    configs: Mutex<Vec<NetworkConfig>>,
}

impl NetworkConfigStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let configs = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(
            "Loaded {} network configs from {}",
            configs.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            configs: Mutex::new(configs),
        })
    }

    async fn persist(&self, configs: &[NetworkConfig]) -> Result<()> {
        let json = serde_json::to_vec_pretty(configs)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted {} network configs", configs.len());
        Ok(())
    }

    pub async fn list(&self) -> Vec<NetworkConfig> {
        self.configs.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<NetworkConfig> {
        self.configs
            .lock()
            .await
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    /// Add a new network; an empty networkID gets a generated one
    pub async fn add(&self, mut config: NetworkConfig) -> Result<NetworkConfig> {
        if config.definition.network_id.trim().is_empty() {
            config.definition.network_id = uuid::Uuid::new_v4().to_string();
        }
        config.definition.validate()?;

        let mut configs = self.configs.lock().await;
        if configs.iter().any(|c| c.id() == config.id()) {
            return Err(NetConfigError::AlreadyExists(config.id().to_string()));
        }
        configs.push(config.clone());
        self.persist(&configs).await?;
        info!("Added network {} ({})", config.definition.name, config.id());
        Ok(config)
    }

    pub async fn update(&self, config: NetworkConfig) -> Result<()> {
        config.definition.validate()?;
        let mut configs = self.configs.lock().await;
        let slot = configs
            .iter_mut()
            .find(|c| c.id() == config.id())
            .ok_or_else(|| NetConfigError::NotFound(config.id().to_string()))?;
        *slot = config;
        self.persist(&configs).await
    }

    /// Insert or replace a definition, keeping the enabled flag of an existing entry
    pub async fn import(&self, definition: NetworkDefinition) -> Result<NetworkConfig> {
        definition.validate()?;
        let mut configs = self.configs.lock().await;
        let config = match configs
            .iter_mut()
            .find(|c| c.id() == definition.network_id)
        {
            Some(existing) => {
                existing.definition = definition;
                existing.clone()
            }
            None => {
                let config = NetworkConfig {
                    definition,
                    enabled: false,
                };
                configs.push(config.clone());
                config
            }
        };
        self.persist(&configs).await?;
        info!("Imported network {} ({})", config.definition.name, config.id());
        Ok(config)
    }

    /// Add only definitions whose id is not stored yet; returns how many were added
    pub async fn import_many(&self, definitions: Vec<NetworkDefinition>) -> Result<usize> {
        let mut configs = self.configs.lock().await;
        let mut added = 0;
        for definition in definitions {
            definition.validate()?;
            if configs.iter().any(|c| c.id() == definition.network_id) {
                continue;
            }
            configs.push(NetworkConfig {
                definition,
                enabled: false,
            });
            added += 1;
        }
        if added > 0 {
            self.persist(&configs).await?;
        }
        Ok(added)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut configs = self.configs.lock().await;
        let slot = configs
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or_else(|| NetConfigError::NotFound(id.to_string()))?;
        if slot.enabled == enabled {
            return Ok(());
        }
        slot.enabled = enabled;
        self.persist(&configs).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut configs = self.configs.lock().await;
        let before = configs.len();
        configs.retain(|c| c.id() != id);
        if configs.len() == before {
            return Ok(false);
        }
        self.persist(&configs).await?;
        info!("Deleted network {}", id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str) -> NetworkDefinition {
        NetworkDefinition {
            version: 1,
            network_id: id.to_string(),
            name: format!("net {}", id),
            description: None,
            bootstrap_peer_addresses: vec![],
            created: "2024-01-01T00:00:00Z".to_string(),
            pre_shared_key: "11".repeat(32),
        }
    }

    #[test]
    fn test_parse_hex_psk() {
        let hex_key = "ab".repeat(32);
        let key = parse_psk(&hex_key).unwrap();
        assert_eq!(key, PreSharedKey::new([0xab; 32]));
    }

    #[test]
    fn test_parse_swarm_key_text_and_base64() {
        let text = format!("{}\n/base16/\n{}", SWARM_KEY_HEADER, "cd".repeat(32));
        let expected = PreSharedKey::new([0xcd; 32]);
        assert_eq!(parse_psk(&text).unwrap(), expected);
        assert_eq!(parse_psk(&BASE64.encode(text.as_bytes())).unwrap(), expected);
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(parse_psk("").is_err());
        assert!(parse_psk("not a key").is_err());
        assert!(parse_psk(&"ab".repeat(31)).is_err());
        assert!(parse_psk(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_generated_psk_parses() {
        let psk = generate_psk();
        assert_eq!(psk.len(), 64);
        assert!(parse_psk(&psk).is_ok());
        assert_ne!(generate_psk(), psk);
    }

    #[test]
    fn test_definition_json_field_names() {
        let json = definition("n1").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["networkID"], "n1");
        assert!(value["bootstrapPeerAddresses"].is_array());
        assert!(value["preSharedKey"].is_string());
        assert!(value.get("enabled").is_none());
    }

    #[test]
    fn test_import_accepts_missing_optional_fields() {
        let json = serde_json::json!({
            "networkID": "n1",
            "name": "minimal",
            "bootstrapPeers": ["/ip4/127.0.0.1/tcp/4001"],
            "preSharedKey": "22".repeat(32)
        });
        let definition = NetworkDefinition::from_json(json.to_string().as_bytes()).unwrap();
        assert_eq!(definition.version, 1);
        assert!(definition.description.is_none());
        assert_eq!(definition.bootstrap_addrs().unwrap().len(), 1);
    }

    #[test]
    fn test_required_fields() {
        let missing_bootstrap = serde_json::json!({"networkID": "n", "name": "x", "preSharedKey": "22".repeat(32)});
        assert!(NetworkDefinition::from_json(missing_bootstrap.to_string().as_bytes()).is_err());

        let missing_key = serde_json::json!({"networkID": "n", "name": "x", "bootstrapPeerAddresses": []});
        assert!(matches!(
            NetworkDefinition::from_json(missing_key.to_string().as_bytes()),
            Err(NetConfigError::InvalidKey(_))
        ));

        let mut bad_addr = definition("n");
        bad_addr.bootstrap_peer_addresses.push("not-an-addr".to_string());
        assert!(bad_addr.validate().is_err());
    }

    #[tokio::test]
    async fn test_store_add_update_delete_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("networks.json");
        let store = NetworkConfigStore::open(&path).await.unwrap();

        let added = store
            .add(NetworkConfig {
                definition: definition(""),
                enabled: false,
            })
            .await
            .unwrap();
        assert!(!added.id().is_empty());
        assert!(matches!(
            store.add(added.clone()).await,
            Err(NetConfigError::AlreadyExists(_))
        ));

        store.set_enabled(added.id(), true).await.unwrap();
        let reopened = NetworkConfigStore::open(&path).await.unwrap();
        assert!(reopened.get(added.id()).await.unwrap().enabled);

        assert!(store.delete(added.id()).await.unwrap());
        assert!(!store.delete(added.id()).await.unwrap());
        assert!(NetworkConfigStore::open(&path).await.unwrap().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_import_keeps_enabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = NetworkConfigStore::open(&dir.path().join("networks.json"))
            .await
            .unwrap();
        store.import(definition("n1")).await.unwrap();
        store.set_enabled("n1", true).await.unwrap();

        let mut renamed = definition("n1");
        renamed.name = "renamed".to_string();
        let config = store.import(renamed).await.unwrap();
        assert!(config.enabled);
        assert_eq!(config.definition.name, "renamed");
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_import_many_adds_only_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = NetworkConfigStore::open(&dir.path().join("networks.json"))
            .await
            .unwrap();
        store.import(definition("a")).await.unwrap();
        let added = store
            .import_many(vec![definition("a"), definition("b"), definition("c")])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.list().await.len(), 3);
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = NetworkConfigStore::open(&dir.path().join("networks.json"))
            .await
            .unwrap();
        let result = store
            .update(NetworkConfig {
                definition: definition("ghost"),
                enabled: true,
            })
            .await;
        assert!(matches!(result, Err(NetConfigError::NotFound(_))));
    }
}
