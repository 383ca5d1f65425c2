use crate::types::{Hash, PartSetHeader, SignedVote, ValidatorId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a proposed or committed block: the hash of its canonical
/// bytes plus the part-set header used to transfer it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts: PartSetHeader,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.hash, self.parts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: u64,
    pub timestamp_ms: u64, // advisory only
    pub last_block_id: Option<BlockId>,
    pub proposer: ValidatorId,
    pub validator_set_hash: Hash,
    /// Application hash after executing height - 1.
    pub app_hash: Hash,
    pub tx_merkle_root: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Vec<u8>>,
    /// +2/3 precommits for the previous height; absent only at genesis + 1.
    pub last_commit: Option<Commit>,
}

/// Commit certificate: +2/3 precommits for one non-nil block at a height.
/// Rounds may differ between the commit round and late additions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub height: u64,
    pub round: u32,
    pub block_id: BlockId,
    pub votes: Vec<SignedVote>,
}

/// Consensus parameters the application may adjust via `end_block`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub max_block_bytes: u64,
    pub max_txs_per_block: u32,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            max_block_bytes: 4 * 1024 * 1024,
            max_txs_per_block: 10_000,
        }
    }
}

/// Partial overrides returned by the application; `None` keeps the
/// current value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParamUpdates {
    pub max_block_bytes: Option<u64>,
    pub max_txs_per_block: Option<u32>,
}

impl ConsensusParams {
    pub fn apply(&self, updates: &ConsensusParamUpdates) -> ConsensusParams {
        ConsensusParams {
            max_block_bytes: updates.max_block_bytes.unwrap_or(self.max_block_bytes),
            max_txs_per_block: updates.max_txs_per_block.unwrap_or(self.max_txs_per_block),
        }
    }
}
