//! P2P networking layer using rust-libp2p
//!
//! Every enabled network gets its own swarm: TCP transport wrapped in the
//! pnet private-network handshake keyed by the network's pre-shared key, then
//! Noise authentication and Yamux multiplexing. Peers holding a different key
//! fail the handshake and never reach the behaviours.

use libp2p::{
    core::upgrade::Version,
    identify,
    identity::Keypair,
    noise, ping,
    pnet::{PnetConfig, PreSharedKey},
    request_response::{self, ProtocolSupport},
    swarm::NetworkBehaviour,
    tcp, yamux, Swarm, SwarmBuilder, Transport,
};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::protocol::{ChunkCodec, LISH_PROTOCOL};

pub const IDENTIFY_PROTOCOL: &str = "/lishnet/id/1.0.0";

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ping keep-alive, Identify for address discovery, and the chunk protocol
#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub lish: request_response::Behaviour<ChunkCodec>,
}

/// Timeouts applied to one swarm
#[derive(Debug, Clone, Copy)]
pub struct SwarmSettings {
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl Behaviour {
    fn new(key: &Keypair, settings: &SwarmSettings) -> Self {
        let lish = request_response::Behaviour::new(
            [(LISH_PROTOCOL, ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(settings.request_timeout),
        );

        Self {
            ping: ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30))),
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            )),
            lish,
        }
    }
}

/// Create a swarm that only talks to peers holding `psk`
pub fn create_swarm(
    keypair: Keypair,
    psk: PreSharedKey,
    settings: SwarmSettings,
) -> Result<Swarm<Behaviour>, P2PError> {
    let dial_timeout = settings.dial_timeout;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_other_transport(|key| -> Result<_, Box<dyn std::error::Error + Send + Sync>> {
            let noise_config = noise::Config::new(key)?;
            Ok(
                tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
                    .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
                    .upgrade(Version::V1Lazy)
                    .authenticate(noise_config)
                    .multiplex(yamux::Config::default())
                    .timeout(dial_timeout),
            )
        })
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|key| Behaviour::new(key, &settings))
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(settings.idle_timeout))
        .build();

    info!(
        "Created swarm {} for network key {}",
        swarm.local_peer_id(),
        psk.fingerprint()
    );
    Ok(swarm)
}

/// Load the node keypair, generating and persisting an Ed25519 key on first use
pub fn load_or_create_keypair(path: &Path) -> Result<Keypair, P2PError> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        return Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| P2PError::Identity(format!("{}: {}", path.display(), e)));
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| P2PError::Identity(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, encoded)?;
    info!(
        "Generated node identity {} at {}",
        keypair.public().to_peer_id(),
        path.display()
    );
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::Multiaddr;

    fn psk(byte: u8) -> PreSharedKey {
        PreSharedKey::new([byte; 32])
    }

    #[tokio::test]
    async fn test_create_swarm() {
        let keypair = Keypair::generate_ed25519();
        let expected = keypair.public().to_peer_id();
        let swarm = create_swarm(keypair, psk(1), SwarmSettings::default()).unwrap();
        assert_eq!(*swarm.local_peer_id(), expected);
    }

    #[tokio::test]
    async fn test_swarm_can_listen() {
        let mut swarm =
            create_swarm(Keypair::generate_ed25519(), psk(1), SwarmSettings::default()).unwrap();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
        assert!(swarm.listen_on(addr).is_ok());
    }

    #[test]
    fn test_keypair_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/node.key");
        let first = load_or_create_keypair(&path).unwrap();
        let second = load_or_create_keypair(&path).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn test_corrupt_keypair_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(
            load_or_create_keypair(&path),
            Err(P2PError::Identity(_))
        ));
    }
}
