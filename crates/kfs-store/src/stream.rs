//! Chunk streams.
//!
//! A file is stored as consecutive chunks of `chunk_size` bytes at item
//! indexes 0, 1, 2, ... under its content key. Reading walks the indexes
//! upward until the first missing one.

use std::io::{self, ErrorKind, Read};
use std::ops::Deref;

use bytes::{Buf, Bytes};
use kfs_core::{ContentKey, KeyError};
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::shard::ShardStore;
use crate::StoreError;

/// Fills `buf` from `source`, returning fewer bytes only at end of stream.
fn read_block<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Splits `source` into chunks and writes them to `shard` under `key`.
///
/// Returns the number of chunks written. Chunks written before a failure
/// are left in place.
pub fn write_all<R: Read>(
    shard: &ShardStore,
    key: &ContentKey,
    mut source: R,
    config: &StreamConfig,
) -> Result<u64, StoreError> {
    let chunk_size = usize::try_from(shard.config().chunk_size)
        .map_err(|_| KeyError::InvalidLayout("chunk size exceeds address space".to_string()))?;
    let mut buf = vec![0u8; chunk_size];
    let mut index = 0u64;

    loop {
        let n = read_block(&mut source, &mut buf)?;
        if n == 0 {
            break;
        }

        let chunk = if n < chunk_size && config.pad_last_chunk {
            buf[n..].fill(0);
            &buf[..]
        } else {
            &buf[..n]
        };
        shard.put_chunk(key, index, chunk)?;
        index += 1;

        if n < chunk_size {
            break;
        }
    }

    shard.touch();
    debug!(shard = shard.index(), key = %key, chunks = index, "Wrote file");
    Ok(index)
}

/// Returns a lazy reader over the chunks of `key`.
pub fn read_all<S>(shard: S, key: ContentKey) -> ChunkReader<S>
where
    S: Deref<Target = ShardStore>,
{
    ChunkReader {
        shard,
        key,
        next_index: 0,
        current: Bytes::new(),
        done: false,
    }
}

/// Forward-only reader over a file's chunks.
///
/// Yields chunks as [`Bytes`] through [`Iterator`], or a contiguous byte
/// stream through [`Read`]. Ends at the first missing chunk index.
#[derive(Debug)]
pub struct ChunkReader<S> {
    shard: S,
    key: ContentKey,
    next_index: u64,
    current: Bytes,
    done: bool,
}

impl<S> ChunkReader<S>
where
    S: Deref<Target = ShardStore>,
{
    /// Number of chunks yielded so far.
    pub fn chunks_read(&self) -> u64 {
        self.next_index
    }

    /// Reads the remaining chunks into one buffer.
    pub fn read_to_vec(mut self) -> Result<Vec<u8>, StoreError> {
        let mut out = self.current.to_vec();
        self.current = Bytes::new();
        for chunk in Iterator::by_ref(&mut self) {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError> {
        if self.done {
            return Ok(None);
        }

        let chunk = match self.shard.get_chunk(&self.key, self.next_index) {
            Ok(chunk) => chunk,
            Err(StoreError::Key(KeyError::IndexOutOfBounds { .. })) => None,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        match chunk {
            Some(data) => {
                trace!(key = %self.key, index = self.next_index, "Read chunk");
                self.next_index += 1;
                Ok(Some(data))
            }
            None => {
                self.done = true;
                self.shard.touch();
                Ok(None)
            }
        }
    }
}

impl<S> Iterator for ChunkReader<S>
where
    S: Deref<Target = ShardStore>,
{
    type Item = Result<Bytes, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

impl<S> Read for ChunkReader<S>
where
    S: Deref<Target = ShardStore>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while !self.current.has_remaining() {
            match self.next_chunk() {
                Ok(Some(chunk)) => self.current = chunk,
                Ok(None) => return Ok(0),
                Err(StoreError::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(ErrorKind::Other, e)),
            }
        }

        let n = buf.len().min(self.current.remaining());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}
