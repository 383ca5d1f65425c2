//! Shared fixtures for the store-backed integration tests.
#![allow(dead_code)] // not every test crate uses every fixture

use lockstep::consensus::round_state::ChainState;
use lockstep::crypto::merkle::merkle_root;
use lockstep::types::serialization::{block_hash, encode_block};
use lockstep::types::{
    Block, BlockHeader, BlockId, Commit, PartSet, SignedVote, Validator, ValidatorId,
    ValidatorSet, Vote, VoteType,
};

pub const CHAIN_ID: &str = "test-chain";

pub fn make_id(seed: u8) -> ValidatorId {
    ValidatorId([seed; 32])
}

pub fn genesis(n: usize) -> (ChainState, Vec<ValidatorId>) {
    let ids: Vec<ValidatorId> = (0..n).map(|i| make_id(i as u8 + 1)).collect();
    let validators = ids
        .iter()
        .map(|id| Validator {
            id: *id,
            voting_power: 1,
            proposer_priority: 0,
        })
        .collect();
    (
        ChainState::genesis(CHAIN_ID, ValidatorSet::new(validators).unwrap()),
        ids,
    )
}

/// A block valid on top of `chain`, plus its id.
pub fn make_block(chain: &ChainState, proposer: ValidatorId, txs: Vec<Vec<u8>>) -> (Block, BlockId) {
    let block = Block {
        header: BlockHeader {
            chain_id: chain.chain_id.clone(),
            height: chain.height,
            timestamp_ms: 0,
            last_block_id: chain.last_block_id,
            proposer,
            validator_set_hash: chain.validators.set_hash(),
            app_hash: chain.last_app_hash,
            tx_merkle_root: merkle_root(&txs),
        },
        txs,
        last_commit: chain.last_commit.clone(),
    };
    let parts = PartSet::from_bytes(&encode_block(&block));
    let block_id = BlockId {
        hash: block_hash(&block),
        parts: parts.header(),
    };
    (block, block_id)
}

/// Commit certificate with precommits from every validator.
pub fn make_commit(chain: &ChainState, block_id: BlockId, round: u32) -> Commit {
    let height = chain.height;
    let votes = chain
        .validators
        .validators()
        .iter()
        .enumerate()
        .map(|(i, v)| SignedVote {
            vote: Vote {
                vote_type: VoteType::Precommit,
                height,
                round,
                block_id: Some(block_id),
                timestamp_ms: 0,
                validator: v.id,
                validator_index: i as u32,
            },
            signature: [0u8; 64],
        })
        .collect();
    Commit {
        height,
        round,
        block_id,
        votes,
    }
}
