//! Splitting file content into chunks: whole-file, fixed-size blocks, or
//! content-defined blocks (FastCDC).
//!
//! Chunks are cut from a reader as it is consumed; only whole-file mode
//! reads the entire input before yielding.

use crate::fingerprint::{blake3_hash, ChunkHash};
use bytes::Bytes;
use fastcdc::v2020::StreamCDC;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

// FastCDC v2020 parameter bounds.
const CDC_MIN_RANGE: (usize, usize) = (64, 1_048_576);
const CDC_AVG_RANGE: (usize, usize) = (256, 4_194_304);
const CDC_MAX_RANGE: (usize, usize) = (1024, 16_777_216);

/// Chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkingMode {
    /// One chunk per file.
    File,
    /// Fixed-size blocks of `block_size` bytes (last block may be short).
    Fixed,
    /// FastCDC with `block_size` as the average chunk size.
    ContentDefined,
}

/// A chunk of plaintext with its content hash
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// BLAKE3 hash of the chunk content
    pub hash: ChunkHash,
    /// Byte offset of this chunk in the original data stream
    pub offset: u64,
}

/// Splits byte buffers according to a `ChunkingMode`.
#[derive(Debug, Clone)]
pub struct Chunker {
    mode: ChunkingMode,
    block_size: usize,
}

impl Chunker {
    /// Create a chunker. `block_size` is ignored in whole-file mode.
    pub fn new(mode: ChunkingMode, block_size: usize) -> Self {
        Self {
            mode,
            block_size: block_size.max(1),
        }
    }

    /// Strategy in use.
    pub fn mode(&self) -> ChunkingMode {
        self.mode
    }

    /// Chunk an in-memory buffer and hash every piece.
    /// Concatenating all chunk.data bytes reconstructs the original data.
    pub fn chunk(&self, data: Bytes) -> Vec<Chunk> {
        // Reading from a slice cannot fail.
        self.chunk_stream(&mut data.as_ref()).flatten().collect()
    }

    /// Cut chunks from `reader` as it is read.
    pub fn chunk_stream<'a>(&self, reader: &'a mut dyn Read) -> ChunkStream<'a> {
        let source = match self.mode {
            ChunkingMode::File => StreamSource::Whole(Some(reader)),
            ChunkingMode::Fixed => StreamSource::Fixed {
                reader,
                block_size: self.block_size,
                done: false,
            },
            ChunkingMode::ContentDefined => {
                let (min, avg, max) = self.cdc_sizes();
                StreamSource::Cdc(StreamCDC::new(reader, min, avg, max))
            }
        };
        ChunkStream { source, offset: 0 }
    }

    fn cdc_sizes(&self) -> (u32, u32, u32) {
        let clamp = |v: usize, (lo, hi): (usize, usize)| v.clamp(lo, hi) as u32;
        (
            clamp(self.block_size / 4, CDC_MIN_RANGE),
            clamp(self.block_size, CDC_AVG_RANGE),
            clamp(self.block_size.saturating_mul(4), CDC_MAX_RANGE),
        )
    }
}

enum StreamSource<'a> {
    Whole(Option<&'a mut dyn Read>),
    Fixed {
        reader: &'a mut dyn Read,
        block_size: usize,
        done: bool,
    },
    Cdc(StreamCDC<&'a mut dyn Read>),
}

/// Iterator over the chunks of a reader, in order.
pub struct ChunkStream<'a> {
    source: StreamSource<'a>,
    offset: u64,
}

impl Iterator for ChunkStream<'_> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = match &mut self.source {
            StreamSource::Whole(reader) => {
                let reader = reader.take()?;
                let mut data = Vec::new();
                if let Err(e) = reader.read_to_end(&mut data) {
                    return Some(Err(e));
                }
                data
            }
            StreamSource::Fixed {
                reader,
                block_size,
                done,
            } => {
                if *done {
                    return None;
                }
                match read_block(&mut **reader, *block_size) {
                    Ok(block) => {
                        *done = block.len() < *block_size;
                        block
                    }
                    Err(e) => {
                        *done = true;
                        return Some(Err(e));
                    }
                }
            }
            StreamSource::Cdc(stream) => match stream.next()? {
                Ok(cut) => cut.data,
                Err(e) => return Some(Err(io::Error::other(format!("chunking failed: {e:?}")))),
            },
        };
        if data.is_empty() {
            return None;
        }
        let chunk = make_chunk(Bytes::from(data), self.offset);
        self.offset += chunk.data.len() as u64;
        Some(Ok(chunk))
    }
}

/// Read up to `size` bytes, short only at end of input.
fn read_block(reader: &mut dyn Read, size: usize) -> io::Result<Vec<u8>> {
    let mut block = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    block.truncate(filled);
    Ok(block)
}

fn make_chunk(data: Bytes, offset: u64) -> Chunk {
    let hash = blake3_hash(&data);
    Chunk { data, hash, offset }
}
