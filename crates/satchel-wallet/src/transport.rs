//! Chunked transport for serialized PSBTs.
//!
//! Large PSBTs are split into numbered chunks for channels with small
//! frames, e.g. animated QR codes. Each chunk carries its position, the
//! total count and a 4-byte digest of the whole payload, so chunks can
//! arrive in any order, repeat, or come from several scans.
//!
//! Text form:
//!
//! ```text
//! sp:<index+1>/<total>:<digest hex>:<base64url payload>
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::TransportError;

const CHUNK_PREFIX: &str = "sp";
pub const DIGEST_LEN: usize = 4;

/// Longest sequence [`chunk`] produces or a collector accepts.
pub const MAX_CHUNKS: usize = 10_000;

fn check_total(total: usize) -> Result<(), TransportError> {
    if total > MAX_CHUNKS {
        return Err(TransportError::TooManyChunks {
            total,
            max: MAX_CHUNKS,
        });
    }
    Ok(())
}

/// One piece of a chunked payload. `index` is zero-based.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub digest: [u8; DIGEST_LEN],
    pub payload: Vec<u8>,
}

fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    let hash = Sha256::digest(data);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hash[..DIGEST_LEN]);
    out
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CHUNK_PREFIX}:{}/{}:{}:{}",
            self.index + 1,
            self.total,
            hex::encode(self.digest),
            URL_SAFE_NO_PAD.encode(&self.payload)
        )
    }
}

impl FromStr for Chunk {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |why: &str| TransportError::Malformed(why.to_string());
        let mut parts = s.trim().splitn(4, ':');
        if parts.next() != Some(CHUNK_PREFIX) {
            return Err(malformed("missing sp: prefix"));
        }
        let position = parts.next().ok_or_else(|| malformed("missing position"))?;
        let digest_hex = parts.next().ok_or_else(|| malformed("missing digest"))?;
        let payload = parts.next().ok_or_else(|| malformed("missing payload"))?;

        let (index, total) = position
            .split_once('/')
            .ok_or_else(|| malformed("position is not <index>/<total>"))?;
        let index: usize = index.parse().map_err(|_| malformed("bad index"))?;
        let total: usize = total.parse().map_err(|_| malformed("bad total"))?;
        if total == 0 {
            return Err(malformed("total is zero"));
        }
        check_total(total)?;
        if index == 0 || index > total {
            return Err(TransportError::OutOfOrder {
                index: index.saturating_sub(1),
                total,
            });
        }

        let digest_bytes = hex::decode(digest_hex).map_err(|_| malformed("bad digest hex"))?;
        let digest: [u8; DIGEST_LEN] = digest_bytes
            .try_into()
            .map_err(|_| malformed("digest must be 4 bytes"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| malformed(&format!("payload: {e}")))?;

        Ok(Chunk {
            index: index - 1,
            total,
            digest,
            payload,
        })
    }
}

/// Split `data` into chunks of at most `max_chunk_size` payload bytes.
pub fn chunk(data: &[u8], max_chunk_size: usize) -> Result<Vec<Chunk>, TransportError> {
    if data.is_empty() {
        return Err(TransportError::Empty);
    }
    if max_chunk_size == 0 {
        return Err(TransportError::InvalidChunkSize(max_chunk_size));
    }
    let total = data.len().div_ceil(max_chunk_size);
    check_total(total)?;
    let digest = digest(data);
    Ok(data
        .chunks(max_chunk_size)
        .enumerate()
        .map(|(index, payload)| Chunk {
            index,
            total,
            digest,
            payload: payload.to_vec(),
        })
        .collect())
}

/// [`chunk`] rendered in text form.
pub fn chunk_text(data: &[u8], max_chunk_size: usize) -> Result<Vec<String>, TransportError> {
    Ok(chunk(data, max_chunk_size)?
        .iter()
        .map(Chunk::to_string)
        .collect())
}

/// Rebuild the payload from chunks in any order.
///
/// Duplicates are accepted when identical.
pub fn reassemble(chunks: &[Chunk]) -> Result<Vec<u8>, TransportError> {
    let mut collector = ChunkCollector::new();
    for chunk in chunks {
        collector.add(chunk.clone())?;
    }
    collector.finish()
}

/// Parse text chunks and [`reassemble`] them.
pub fn reassemble_text<S: AsRef<str>>(chunks: &[S]) -> Result<Vec<u8>, TransportError> {
    let parsed = chunks
        .iter()
        .map(|s| s.as_ref().parse())
        .collect::<Result<Vec<Chunk>, _>>()?;
    reassemble(&parsed)
}

/// Reassembly progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub received: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}

/// Incremental reassembly for scanners that see one chunk at a time.
#[derive(Debug, Default)]
pub struct ChunkCollector {
    header: Option<(usize, [u8; DIGEST_LEN])>,
    chunks: BTreeMap<usize, Vec<u8>>,
}

impl ChunkCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a chunk. Chunks from a different payload are rejected without
    /// disturbing what has been collected.
    pub fn add(&mut self, chunk: Chunk) -> Result<Progress, TransportError> {
        if chunk.total == 0 {
            return Err(TransportError::Malformed("total is zero".into()));
        }
        check_total(chunk.total)?;
        if chunk.index >= chunk.total {
            return Err(TransportError::OutOfOrder {
                index: chunk.index,
                total: chunk.total,
            });
        }
        let (total, digest) = *self.header.get_or_insert((chunk.total, chunk.digest));
        if chunk.total != total {
            return Err(TransportError::Inconsistent(format!(
                "chunk claims {} parts, expected {total}",
                chunk.total
            )));
        }
        if chunk.digest != digest {
            return Err(TransportError::Inconsistent(
                "chunk belongs to a different payload".into(),
            ));
        }
        match self.chunks.get(&chunk.index) {
            Some(existing) if *existing != chunk.payload => {
                return Err(TransportError::Inconsistent(format!(
                    "conflicting copies of chunk {}",
                    chunk.index
                )));
            }
            Some(_) => {}
            None => {
                self.chunks.insert(chunk.index, chunk.payload);
            }
        }
        let progress = self.progress();
        debug!(received = progress.received, total = progress.total, "chunk collected");
        Ok(progress)
    }

    /// Parse and accept a text chunk.
    pub fn add_str(&mut self, text: &str) -> Result<Progress, TransportError> {
        self.add(text.parse()?)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            received: self.chunks.len(),
            total: self.header.map_or(0, |(total, _)| total),
        }
    }

    /// Zero-based indices not yet received.
    pub fn missing(&self) -> Vec<usize> {
        let total = self.header.map_or(0, |(total, _)| total);
        (0..total).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    /// The reassembled payload, verified against the announced digest.
    pub fn finish(self) -> Result<Vec<u8>, TransportError> {
        let Some((_, digest)) = self.header else {
            return Err(TransportError::Empty);
        };
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(TransportError::MissingChunks { missing });
        }
        let data: Vec<u8> = self.chunks.into_values().flatten().collect();
        if self::digest(&data) != digest {
            return Err(TransportError::ChecksumMismatch);
        }
        Ok(data)
    }
}
