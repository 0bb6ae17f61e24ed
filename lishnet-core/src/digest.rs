//! Content addressing for chunks
//!
//! Every manifest carries one checksum algorithm that is applied uniformly to
//! all of its chunk windows. A chunk is identified by the lowercase hex
//! encoding of its digest ([`ChunkId`]).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512, Sha512_256};
use sha3::{Sha3_256, Sha3_384, Sha3_512};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: ChunkId, actual: ChunkId },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Checksum algorithm applied to every chunk of a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
    Sha512_256,
    Sha3_256,
    Sha3_384,
    Sha3_512,
    Blake3,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 8] = [
        ChecksumAlgorithm::Sha256,
        ChecksumAlgorithm::Sha384,
        ChecksumAlgorithm::Sha512,
        ChecksumAlgorithm::Sha512_256,
        ChecksumAlgorithm::Sha3_256,
        ChecksumAlgorithm::Sha3_384,
        ChecksumAlgorithm::Sha3_512,
        ChecksumAlgorithm::Blake3,
    ];

    /// Name used in manifest files
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha384 => "sha384",
            ChecksumAlgorithm::Sha512 => "sha512",
            ChecksumAlgorithm::Sha512_256 => "sha512-256",
            ChecksumAlgorithm::Sha3_256 => "sha3-256",
            ChecksumAlgorithm::Sha3_384 => "sha3-384",
            ChecksumAlgorithm::Sha3_512 => "sha3-512",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }

    /// Digest length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256
            | ChecksumAlgorithm::Sha512_256
            | ChecksumAlgorithm::Sha3_256
            | ChecksumAlgorithm::Blake3 => 32,
            ChecksumAlgorithm::Sha384 | ChecksumAlgorithm::Sha3_384 => 48,
            ChecksumAlgorithm::Sha512 | ChecksumAlgorithm::Sha3_512 => 64,
        }
    }

    /// Digest a complete chunk
    pub fn digest(&self, data: &[u8]) -> ChunkId {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Start a streaming digest
    pub fn hasher(&self) -> ChunkHasher {
        let inner = match self {
            ChecksumAlgorithm::Sha256 => HasherInner::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha384 => HasherInner::Sha384(Sha384::new()),
            ChecksumAlgorithm::Sha512 => HasherInner::Sha512(Sha512::new()),
            ChecksumAlgorithm::Sha512_256 => HasherInner::Sha512_256(Sha512_256::new()),
            ChecksumAlgorithm::Sha3_256 => HasherInner::Sha3_256(Sha3_256::new()),
            ChecksumAlgorithm::Sha3_384 => HasherInner::Sha3_384(Sha3_384::new()),
            ChecksumAlgorithm::Sha3_512 => HasherInner::Sha3_512(Sha3_512::new()),
            ChecksumAlgorithm::Blake3 => HasherInner::Blake3(Box::new(blake3::Hasher::new())),
        };
        ChunkHasher {
            inner,
            bytes_processed: 0,
        }
    }

    /// Whether `id` has the shape of a digest produced by this algorithm
    pub fn is_well_formed(&self, id: &ChunkId) -> bool {
        let s = id.as_str();
        s.len() == self.output_len() * 2 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ChecksumAlgorithm::ALL
            .iter()
            .copied()
            .find(|algo| algo.name() == lowered)
            .ok_or_else(|| DigestError::UnsupportedAlgorithm(s.to_string()))
    }
}

impl TryFrom<String> for ChecksumAlgorithm {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChecksumAlgorithm> for String {
    fn from(algo: ChecksumAlgorithm) -> Self {
        algo.name().to_string()
    }
}

/// Hex-encoded chunk digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn from_digest_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        ChunkId::new(value)
    }
}

impl From<&str> for ChunkId {
    fn from(value: &str) -> Self {
        ChunkId::new(value)
    }
}

impl From<ChunkId> for String {
    fn from(id: ChunkId) -> Self {
        id.0
    }
}

impl AsRef<str> for ChunkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

enum HasherInner {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
    Sha512_256(Sha512_256),
    Sha3_256(Sha3_256),
    Sha3_384(Sha3_384),
    Sha3_512(Sha3_512),
    Blake3(Box<blake3::Hasher>),
}

/// Streaming digest over one chunk
pub struct ChunkHasher {
    inner: HasherInner,
    bytes_processed: usize,
}

impl ChunkHasher {
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha256(h) => h.update(data),
            HasherInner::Sha384(h) => h.update(data),
            HasherInner::Sha512(h) => h.update(data),
            HasherInner::Sha512_256(h) => h.update(data),
            HasherInner::Sha3_256(h) => h.update(data),
            HasherInner::Sha3_384(h) => h.update(data),
            HasherInner::Sha3_512(h) => h.update(data),
            HasherInner::Blake3(h) => {
                h.update(data);
            }
        }
        self.bytes_processed += data.len();
    }

    /// Read from a reader until EOF and update the hasher
    pub fn update_from_reader<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut buffer = [0u8; 8192];
        let mut total_read = 0;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            self.update(&buffer[..n]);
            total_read += n;
        }

        Ok(total_read)
    }

    pub fn finalize(self) -> ChunkId {
        match self.inner {
            HasherInner::Sha256(h) => ChunkId::from_digest_bytes(&h.finalize()),
            HasherInner::Sha384(h) => ChunkId::from_digest_bytes(&h.finalize()),
            HasherInner::Sha512(h) => ChunkId::from_digest_bytes(&h.finalize()),
            HasherInner::Sha512_256(h) => ChunkId::from_digest_bytes(&h.finalize()),
            HasherInner::Sha3_256(h) => ChunkId::from_digest_bytes(&h.finalize()),
            HasherInner::Sha3_384(h) => ChunkId::from_digest_bytes(&h.finalize()),
            HasherInner::Sha3_512(h) => ChunkId::from_digest_bytes(&h.finalize()),
            HasherInner::Blake3(h) => ChunkId::from_digest_bytes(h.finalize().as_bytes()),
        }
    }

    /// Finalize and compare against the expected digest
    pub fn finalize_and_verify(self, expected: &ChunkId) -> Result<ChunkId, DigestError> {
        let actual = self.finalize();
        if &actual != expected {
            return Err(DigestError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Ok(actual)
    }

    pub fn bytes_processed(&self) -> usize {
        self.bytes_processed
    }
}

/// Verify chunk bytes against their expected digest
pub fn verify_chunk(
    algorithm: ChecksumAlgorithm,
    data: &[u8],
    expected: &ChunkId,
) -> Result<(), DigestError> {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_and_verify(expected).map(|_| ())
}
