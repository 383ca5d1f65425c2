use crate::crypto::merkle::{merkle_root, MerkleProof};
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed part payload size used when chopping a block for gossip.
pub const BLOCK_PART_SIZE: usize = 64 * 1024;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("merkle proof does not match part set header")]
    BadProof,
    #[error("part set incomplete")]
    Incomplete,
    #[error("parts exceed maximum block size of {max} bytes")]
    TooLarge { max: u64 },
}

/// Identifies a complete part set: the number of parts and the Merkle root
/// over their hashes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.total, self.hash)
    }
}

/// One slice of a serialized block plus its audit path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPart {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: MerkleProof,
}

/// Sparse assembly buffer for the parts of one block.
///
/// A proposer builds a complete set with [`PartSet::from_bytes`]; a receiver
/// starts from the header alone with [`PartSet::from_header`] and feeds parts
/// as they arrive, each checked against the Merkle root before insertion.
#[derive(Clone, Debug)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<BlockPart>>,
    count: u32,
    byte_size: u64,
}

impl PartSet {
    /// Chop serialized block bytes into fixed-size parts.
    pub fn from_bytes(data: &[u8]) -> PartSet {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(BLOCK_PART_SIZE).collect()
        };
        let root = merkle_root(&chunks);
        let proofs = MerkleProof::build_all(&chunks);
        let total = chunks.len() as u32;

        let parts = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (bytes, proof))| {
                Some(BlockPart {
                    index: i as u32,
                    bytes: bytes.to_vec(),
                    proof,
                })
            })
            .collect();

        PartSet {
            header: PartSetHeader { total, hash: root },
            parts,
            count: total,
            byte_size: data.len() as u64,
        }
    }

    /// Empty set awaiting parts advertised by `header`.
    pub fn from_header(header: PartSetHeader) -> PartSet {
        PartSet {
            header,
            parts: vec![None; header.total as usize],
            count: 0,
            byte_size: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn has_part(&self, index: u32) -> bool {
        self.parts
            .get(index as usize)
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    pub fn part(&self, index: u32) -> Option<&BlockPart> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Indices still missing; what a node asks peers to re-send.
    pub fn missing(&self) -> Vec<u32> {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Insert a received part after proof verification.
    ///
    /// Returns `Ok(true)` when the part was added, `Ok(false)` when it was
    /// already present. `max_bytes` bounds the total reconstructed size; a
    /// part pushing past it is refused before insertion.
    pub fn add_part(&mut self, part: BlockPart, max_bytes: u64) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfRange {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.has_part(part.index) {
            return Ok(false);
        }
        if part.proof.index != part.index
            || part.proof.total != self.header.total
            || !part.proof.verify(&self.header.hash, &part.bytes)
        {
            return Err(PartSetError::BadProof);
        }
        if self.byte_size + part.bytes.len() as u64 > max_bytes {
            return Err(PartSetError::TooLarge { max: max_bytes });
        }

        self.byte_size += part.bytes.len() as u64;
        self.count += 1;
        let index = part.index as usize;
        self.parts[index] = Some(part);
        Ok(true)
    }

    /// Concatenate all parts back into the serialized block.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete);
        }
        let mut out = Vec::with_capacity(self.byte_size as usize);
        for p in self.parts.iter().flatten() {
            out.extend_from_slice(&p.bytes);
        }
        Ok(out)
    }

    /// Iterate held parts in index order (for gossip).
    pub fn parts(&self) -> impl Iterator<Item = &BlockPart> {
        self.parts.iter().flatten()
    }
}
