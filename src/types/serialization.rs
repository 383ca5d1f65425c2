//! Deterministic binary codec for wire types and canonical sign-bytes.
//!
//! Canonical encodings are what validators sign; two implementations that
//! disagree on a single byte here will never reach agreement, so every
//! field is written explicitly in a fixed order.

use crate::crypto::hash::sha256;
use crate::crypto::merkle::MerkleProof;
use crate::types::{
    Block, BlockHeader, BlockId, BlockPart, Commit, Hash, PartSetHeader, Proposal, SignedProposal,
    SignedVote, ValidatorId, Vote, VoteType,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected eof")]
    Eof,
    #[error("invalid data: {0}")]
    Invalid(&'static str),
}

pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_bytes32(&mut self, v: &[u8; 32]) {
        self.buf.extend_from_slice(v);
    }
    pub fn put_bytes64(&mut self, v: &[u8; 64]) {
        self.buf.extend_from_slice(v);
    }
    pub fn put_vec(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }
    pub fn put_string(&mut self, s: &str) {
        self.put_vec(s.as_bytes());
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Eof);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }
    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
    pub fn get_bytes32(&mut self) -> Result<[u8; 32], CodecError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(out)
    }
    pub fn get_bytes64(&mut self) -> Result<[u8; 64], CodecError> {
        let b = self.take(64)?;
        let mut out = [0u8; 64];
        out.copy_from_slice(b);
        Ok(out)
    }
    pub fn get_vec(&mut self) -> Result<Vec<u8>, CodecError> {
        let n = self.get_u32()? as usize;
        let b = self.take(n)?;
        Ok(b.to_vec())
    }
    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let b = self.get_vec()?;
        String::from_utf8(b).map_err(|_| CodecError::Invalid("non-utf8 string"))
    }
}

// ---- VoteType ----

fn encode_vote_type(t: VoteType) -> u8 {
    match t {
        VoteType::Prevote => 1,
        VoteType::Precommit => 2,
    }
}

pub fn decode_vote_type(b: u8) -> Result<VoteType, CodecError> {
    match b {
        1 => Ok(VoteType::Prevote),
        2 => Ok(VoteType::Precommit),
        _ => Err(CodecError::Invalid("unknown VoteType")),
    }
}

// ---- BlockId / PartSetHeader ----

pub fn put_part_set_header(e: &mut Encoder, h: &PartSetHeader) {
    e.put_u32(h.total);
    e.put_bytes32(&h.hash.0);
}

pub fn get_part_set_header(d: &mut Decoder<'_>) -> Result<PartSetHeader, CodecError> {
    Ok(PartSetHeader {
        total: d.get_u32()?,
        hash: Hash(d.get_bytes32()?),
    })
}

pub fn put_block_id(e: &mut Encoder, id: &BlockId) {
    e.put_bytes32(&id.hash.0);
    put_part_set_header(e, &id.parts);
}

pub fn get_block_id(d: &mut Decoder<'_>) -> Result<BlockId, CodecError> {
    Ok(BlockId {
        hash: Hash(d.get_bytes32()?),
        parts: get_part_set_header(d)?,
    })
}

pub fn put_opt_block_id(e: &mut Encoder, id: &Option<BlockId>) {
    match id {
        None => e.put_u8(0),
        Some(id) => {
            e.put_u8(1);
            put_block_id(e, id);
        }
    }
}

pub fn get_opt_block_id(d: &mut Decoder<'_>) -> Result<Option<BlockId>, CodecError> {
    match d.get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(get_block_id(d)?)),
        _ => Err(CodecError::Invalid("opt block id tag")),
    }
}

// ---- Block ----

pub fn encode_block(b: &Block) -> Vec<u8> {
    let mut e = Encoder::new();
    encode_block_header(&mut e, &b.header);

    e.put_u32(b.txs.len() as u32);
    for tx in &b.txs {
        e.put_vec(tx);
    }

    match &b.last_commit {
        None => e.put_u8(0),
        Some(c) => {
            e.put_u8(1);
            encode_commit(&mut e, c);
        }
    }
    e.into_bytes()
}

pub fn decode_block(data: &[u8]) -> Result<Block, CodecError> {
    let mut d = Decoder::new(data);
    let header = decode_block_header(&mut d)?;

    let n = d.get_u32()? as usize;
    let mut txs = Vec::with_capacity(n.min(4096));
    for _ in 0..n {
        txs.push(d.get_vec()?);
    }

    let last_commit = match d.get_u8()? {
        0 => None,
        1 => Some(decode_commit(&mut d)?),
        _ => return Err(CodecError::Invalid("last commit tag")),
    };

    Ok(Block {
        header,
        txs,
        last_commit,
    })
}

fn encode_block_header(e: &mut Encoder, h: &BlockHeader) {
    e.put_string(&h.chain_id);
    e.put_u64(h.height);
    e.put_u64(h.timestamp_ms);
    put_opt_block_id(e, &h.last_block_id);
    e.put_bytes32(&h.proposer.0);
    e.put_bytes32(&h.validator_set_hash.0);
    e.put_bytes32(&h.app_hash.0);
    e.put_bytes32(&h.tx_merkle_root.0);
}

fn decode_block_header(d: &mut Decoder<'_>) -> Result<BlockHeader, CodecError> {
    Ok(BlockHeader {
        chain_id: d.get_string()?,
        height: d.get_u64()?,
        timestamp_ms: d.get_u64()?,
        last_block_id: get_opt_block_id(d)?,
        proposer: ValidatorId(d.get_bytes32()?),
        validator_set_hash: Hash(d.get_bytes32()?),
        app_hash: Hash(d.get_bytes32()?),
        tx_merkle_root: Hash(d.get_bytes32()?),
    })
}

/// Hash of the canonical block bytes; the first half of a BlockId.
pub fn block_hash(b: &Block) -> Hash {
    sha256(&encode_block(b))
}

// ---- Commit ----

fn encode_commit(e: &mut Encoder, c: &Commit) {
    e.put_u64(c.height);
    e.put_u32(c.round);
    put_block_id(e, &c.block_id);
    e.put_u32(c.votes.len() as u32);
    for v in &c.votes {
        put_signed_vote(e, v);
    }
}

fn decode_commit(d: &mut Decoder<'_>) -> Result<Commit, CodecError> {
    let height = d.get_u64()?;
    let round = d.get_u32()?;
    let block_id = get_block_id(d)?;
    let n = d.get_u32()? as usize;
    let mut votes = Vec::with_capacity(n.min(4096));
    for _ in 0..n {
        votes.push(get_signed_vote(d)?);
    }
    Ok(Commit {
        height,
        round,
        block_id,
        votes,
    })
}

// ---- Vote ----

fn put_vote(e: &mut Encoder, v: &Vote) {
    e.put_u8(encode_vote_type(v.vote_type));
    e.put_u64(v.height);
    e.put_u32(v.round);
    put_opt_block_id(e, &v.block_id);
    e.put_u64(v.timestamp_ms);
    e.put_bytes32(&v.validator.0);
    e.put_u32(v.validator_index);
}

fn get_vote(d: &mut Decoder<'_>) -> Result<Vote, CodecError> {
    Ok(Vote {
        vote_type: decode_vote_type(d.get_u8()?)?,
        height: d.get_u64()?,
        round: d.get_u32()?,
        block_id: get_opt_block_id(d)?,
        timestamp_ms: d.get_u64()?,
        validator: ValidatorId(d.get_bytes32()?),
        validator_index: d.get_u32()?,
    })
}

pub fn put_signed_vote(e: &mut Encoder, sv: &SignedVote) {
    put_vote(e, &sv.vote);
    e.put_bytes64(&sv.signature);
}

pub fn get_signed_vote(d: &mut Decoder<'_>) -> Result<SignedVote, CodecError> {
    Ok(SignedVote {
        vote: get_vote(d)?,
        signature: d.get_bytes64()?,
    })
}

pub fn encode_signed_vote(sv: &SignedVote) -> Vec<u8> {
    let mut e = Encoder::new();
    put_signed_vote(&mut e, sv);
    e.into_bytes()
}

pub fn decode_signed_vote(data: &[u8]) -> Result<SignedVote, CodecError> {
    let mut d = Decoder::new(data);
    get_signed_vote(&mut d)
}

/// Bytes a validator signs for a vote. Scoped to a chain id so a signature
/// can never be replayed on another network.
pub fn canonical_vote_bytes(chain_id: &str, v: &Vote) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_string(chain_id);
    e.put_u8(encode_vote_type(v.vote_type));
    e.put_u64(v.height);
    e.put_u32(v.round);
    put_opt_block_id(&mut e, &v.block_id);
    e.put_u64(v.timestamp_ms);
    e.into_bytes()
}

// ---- Proposal ----

pub fn put_signed_proposal(e: &mut Encoder, sp: &SignedProposal) {
    let p = &sp.proposal;
    e.put_u64(p.height);
    e.put_u32(p.round);
    e.put_i32(p.pol_round);
    put_block_id(e, &p.block_id);
    e.put_u64(p.timestamp_ms);
    e.put_bytes64(&sp.signature);
}

pub fn get_signed_proposal(d: &mut Decoder<'_>) -> Result<SignedProposal, CodecError> {
    Ok(SignedProposal {
        proposal: Proposal {
            height: d.get_u64()?,
            round: d.get_u32()?,
            pol_round: d.get_i32()?,
            block_id: get_block_id(d)?,
            timestamp_ms: d.get_u64()?,
        },
        signature: d.get_bytes64()?,
    })
}

pub fn encode_signed_proposal(sp: &SignedProposal) -> Vec<u8> {
    let mut e = Encoder::new();
    put_signed_proposal(&mut e, sp);
    e.into_bytes()
}

pub fn decode_signed_proposal(data: &[u8]) -> Result<SignedProposal, CodecError> {
    let mut d = Decoder::new(data);
    get_signed_proposal(&mut d)
}

pub fn canonical_proposal_bytes(chain_id: &str, p: &Proposal) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_string(chain_id);
    e.put_u64(p.height);
    e.put_u32(p.round);
    e.put_i32(p.pol_round);
    put_block_id(&mut e, &p.block_id);
    e.put_u64(p.timestamp_ms);
    e.into_bytes()
}

// ---- Block parts ----

pub fn put_block_part(e: &mut Encoder, p: &BlockPart) {
    e.put_u32(p.index);
    e.put_vec(&p.bytes);
    e.put_u32(p.proof.index);
    e.put_u32(p.proof.total);
    e.put_u32(p.proof.siblings.len() as u32);
    for s in &p.proof.siblings {
        e.put_bytes32(&s.0);
    }
}

pub fn get_block_part(d: &mut Decoder<'_>) -> Result<BlockPart, CodecError> {
    let index = d.get_u32()?;
    let bytes = d.get_vec()?;
    let proof_index = d.get_u32()?;
    let proof_total = d.get_u32()?;
    let n = d.get_u32()? as usize;
    if n > 64 {
        return Err(CodecError::Invalid("merkle path too long"));
    }
    let mut siblings = Vec::with_capacity(n);
    for _ in 0..n {
        siblings.push(Hash(d.get_bytes32()?));
    }
    Ok(BlockPart {
        index,
        bytes,
        proof: MerkleProof {
            index: proof_index,
            total: proof_total,
            siblings,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartSetHeader;

    fn sample_block_id(seed: u8) -> BlockId {
        BlockId {
            hash: Hash([seed; 32]),
            parts: PartSetHeader {
                total: 3,
                hash: Hash([seed.wrapping_add(1); 32]),
            },
        }
    }

    #[test]
    fn signed_vote_roundtrip() {
        let sv = SignedVote {
            vote: Vote {
                vote_type: VoteType::Precommit,
                height: 7,
                round: 2,
                block_id: Some(sample_block_id(9)),
                timestamp_ms: 123,
                validator: ValidatorId([4u8; 32]),
                validator_index: 3,
            },
            signature: [5u8; 64],
        };
        let decoded = decode_signed_vote(&encode_signed_vote(&sv)).unwrap();
        assert_eq!(decoded, sv);
    }

    #[test]
    fn nil_vote_roundtrip() {
        let sv = SignedVote {
            vote: Vote {
                vote_type: VoteType::Prevote,
                height: 1,
                round: 0,
                block_id: None,
                timestamp_ms: 0,
                validator: ValidatorId([1u8; 32]),
                validator_index: 0,
            },
            signature: [0u8; 64],
        };
        let decoded = decode_signed_vote(&encode_signed_vote(&sv)).unwrap();
        assert_eq!(decoded.vote.block_id, None);
    }

    #[test]
    fn proposal_negative_pol_round_roundtrip() {
        let sp = SignedProposal {
            proposal: Proposal {
                height: 4,
                round: 1,
                pol_round: -1,
                block_id: sample_block_id(2),
                timestamp_ms: 55,
            },
            signature: [7u8; 64],
        };
        let decoded = decode_signed_proposal(&encode_signed_proposal(&sp)).unwrap();
        assert_eq!(decoded.proposal.pol_round, -1);
        assert_eq!(decoded, sp);
    }

    #[test]
    fn canonical_vote_bytes_differ_by_chain_id() {
        let v = Vote {
            vote_type: VoteType::Prevote,
            height: 1,
            round: 0,
            block_id: None,
            timestamp_ms: 0,
            validator: ValidatorId([1u8; 32]),
            validator_index: 0,
        };
        assert_ne!(
            canonical_vote_bytes("chain-a", &v),
            canonical_vote_bytes("chain-b", &v)
        );
    }

    #[test]
    fn truncated_vote_fails() {
        let sv = SignedVote {
            vote: Vote {
                vote_type: VoteType::Prevote,
                height: 1,
                round: 0,
                block_id: None,
                timestamp_ms: 0,
                validator: ValidatorId([1u8; 32]),
                validator_index: 0,
            },
            signature: [0u8; 64],
        };
        let mut bytes = encode_signed_vote(&sv);
        bytes.truncate(bytes.len() - 1);
        assert!(decode_signed_vote(&bytes).is_err());
    }
}
