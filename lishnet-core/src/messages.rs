//! LISH chunk protocol messages
//!
//! Protobuf messages exchanged over `/lish/1.0.0`, declared with prost derive
//! macros. A request either asks which chunks of a dataset the peer has, or
//! asks for the bytes of one chunk.

use prost::Message as ProstMessage;
use std::collections::HashSet;

use crate::digest::ChunkId;
use crate::store::Have;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RequestKind {
    Have = 0,
    Chunk = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseStatus {
    Ok = 0,
    NotFound = 1,
    Error = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChunkRequest {
    #[prost(string, tag = "1")]
    pub dataset_id: String,

    #[prost(enumeration = "RequestKind", tag = "2")]
    pub kind: i32,

    /// Digest of the wanted chunk (Chunk requests only)
    #[prost(string, tag = "3")]
    pub digest: String,
}

impl ChunkRequest {
    pub fn have(dataset_id: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            kind: RequestKind::Have as i32,
            digest: String::new(),
        }
    }

    pub fn chunk(dataset_id: &str, digest: &ChunkId) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            kind: RequestKind::Chunk as i32,
            digest: digest.to_string(),
        }
    }

    /// None for kinds this node does not know
    pub fn request_kind(&self) -> Option<RequestKind> {
        RequestKind::try_from(self.kind).ok()
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChunkResponse {
    #[prost(enumeration = "ResponseStatus", tag = "1")]
    pub status: i32,

    /// Peer has every chunk of the dataset
    #[prost(bool, tag = "2")]
    pub have_all: bool,

    /// Chunks the peer has, when not all
    #[prost(string, repeated, tag = "3")]
    pub digests: Vec<String>,

    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,

    #[prost(string, tag = "5")]
    pub error: String,
}

impl ChunkResponse {
    pub fn from_have(have: &Have) -> Self {
        let (have_all, digests) = match have {
            Have::All => (true, Vec::new()),
            Have::Some(set) => (false, set.iter().map(|d| d.to_string()).collect()),
        };
        Self {
            status: ResponseStatus::Ok as i32,
            have_all,
            digests,
            data: Vec::new(),
            error: String::new(),
        }
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            status: ResponseStatus::Ok as i32,
            have_all: false,
            digests: Vec::new(),
            data,
            error: String::new(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: ResponseStatus::NotFound as i32,
            have_all: false,
            digests: Vec::new(),
            data: Vec::new(),
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error as i32,
            have_all: false,
            digests: Vec::new(),
            data: Vec::new(),
            error: error.into(),
        }
    }

    pub fn response_status(&self) -> ResponseStatus {
        ResponseStatus::try_from(self.status).unwrap_or(ResponseStatus::Error)
    }

    /// Possession advertised by a Have response
    pub fn to_have(&self) -> Have {
        if self.have_all {
            Have::All
        } else {
            Have::Some(
                self.digests
                    .iter()
                    .map(|d| ChunkId::new(d.as_str()))
                    .collect::<HashSet<_>>(),
            )
        }
    }
}

pub fn encode_message<M: ProstMessage>(msg: &M) -> Result<Vec<u8>, prost::EncodeError> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)?;
    Ok(buf)
}

pub fn decode_request(bytes: &[u8]) -> Result<ChunkRequest, prost::DecodeError> {
    ChunkRequest::decode(bytes)
}

pub fn decode_response(bytes: &[u8]) -> Result<ChunkResponse, prost::DecodeError> {
    ChunkResponse::decode(bytes)
}
