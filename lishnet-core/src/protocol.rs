//! LISH chunk protocol
//!
//! Request/response codec for `/lish/1.0.0`: prost messages framed by a
//! 4-byte big-endian length prefix. Also holds the seeding side, which answers
//! requests from the chunk store.

use futures::prelude::*;
use libp2p::{request_response::Codec, StreamProtocol};
use std::io;
use tracing::{debug, warn};

use crate::chunker::{read_chunk_at, MAX_CHUNK_SIZE};
use crate::digest::ChunkId;
use crate::messages::{
    decode_request, decode_response, encode_message, ChunkRequest, ChunkResponse, RequestKind,
};
use crate::store::{ChunkStore, StoreError};

pub const PROTOCOL_ID: &str = "/lish/1.0.0";

pub const LISH_PROTOCOL: StreamProtocol = StreamProtocol::new(PROTOCOL_ID);

/// Largest frame accepted from a peer: one full chunk plus the envelope
pub const MAX_MESSAGE_SIZE: usize = MAX_CHUNK_SIZE as usize + 4096;

async fn read_frame<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<T>(io: &mut T, bytes: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(bytes).await?;
    io.close().await
}

fn invalid_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[derive(Debug, Clone, Default)]
pub struct ChunkCodec;

#[async_trait::async_trait]
impl Codec for ChunkCodec {
    type Protocol = StreamProtocol;
    type Request = ChunkRequest;
    type Response = ChunkResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let frame = read_frame(io).await?;
        decode_request(&frame).map_err(invalid_data)
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let frame = read_frame(io).await?;
        decode_response(&frame).map_err(invalid_data)
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let buf = encode_message(&req).map_err(invalid_data)?;
        write_frame(io, &buf).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let buf = encode_message(&res).map_err(invalid_data)?;
        write_frame(io, &buf).await
    }
}

/// Answer a peer's request from the local store
///
/// Only chunks the store marks as had are served.
pub async fn serve_request(store: &ChunkStore, request: ChunkRequest) -> ChunkResponse {
    match request.request_kind() {
        Some(RequestKind::Have) => match store.have(&request.dataset_id).await {
            Ok(have) => ChunkResponse::from_have(&have),
            Err(StoreError::DatasetNotFound(_)) => ChunkResponse::not_found(),
            Err(e) => {
                warn!("Have query for {} failed: {}", request.dataset_id, e);
                ChunkResponse::failure(e.to_string())
            }
        },
        Some(RequestKind::Chunk) => {
            let digest = ChunkId::new(request.digest);
            match read_had_chunk(store, &request.dataset_id, &digest).await {
                Ok(Some(data)) => {
                    debug!(
                        "Serving chunk {} of {} ({} bytes)",
                        digest.short(),
                        request.dataset_id,
                        data.len()
                    );
                    ChunkResponse::with_data(data)
                }
                Ok(None) => ChunkResponse::not_found(),
                Err(e) => {
                    warn!(
                        "Failed to read chunk {} of {}: {}",
                        digest.short(),
                        request.dataset_id,
                        e
                    );
                    ChunkResponse::failure(e.to_string())
                }
            }
        }
        None => ChunkResponse::failure(format!("unknown request kind {}", request.kind)),
    }
}

async fn read_had_chunk(
    store: &ChunkStore,
    dataset_id: &str,
    digest: &ChunkId,
) -> Result<Option<Vec<u8>>, StoreError> {
    let Some(location) = store.locate_chunk(dataset_id, digest).await? else {
        return Ok(None);
    };
    let data = tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&location.path)?;
        read_chunk_at(&mut file, location.offset, location.length)
    })
    .await
    .map_err(|e| StoreError::IoError(io::Error::other(e.to_string())))??;
    Ok(Some(data))
}
