//! Fixed-size chunk windows over files
//!
//! A file of `size` bytes is covered by `ceil(size / chunk_size)` contiguous,
//! non-overlapping windows. Only the final window may be shorter.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest chunk a single protocol frame can carry: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Number of chunk windows covering `size` bytes
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size)
}

/// Byte offset and length of window `index`, or None past the end of the file
pub fn chunk_span(size: u64, chunk_size: u64, index: u64) -> Option<(u64, u64)> {
    if index >= chunk_count(size, chunk_size) {
        return None;
    }
    let offset = index * chunk_size;
    Some((offset, (size - offset).min(chunk_size)))
}

/// Read exactly `len` bytes at `offset`
pub fn read_chunk_at(file: &mut File, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Write a whole chunk at `offset`
pub fn write_chunk_at(file: &mut File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

/// Splits a reader into fixed-size chunks
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    eof_reached: bool,
}

impl<R: Read> Chunker<R> {
    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        Self {
            reader,
            chunk_size,
            eof_reached: false,
        }
    }

    /// Read the next chunk
    ///
    /// Returns `Ok(None)` once the reader is exhausted. The last chunk may be
    /// shorter than the chunk size.
    pub fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.eof_reached {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_read = 0;

        while total_read < self.chunk_size {
            match self.reader.read(&mut buffer[total_read..]) {
                Ok(0) => {
                    self.eof_reached = true;
                    if total_read == 0 {
                        return Ok(None);
                    }
                    buffer.truncate(total_read);
                    return Ok(Some(buffer));
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(Some(buffer))
    }
}
