//! Messages exchanged with peers, as routed by the (external) transport.
//!
//! The transport owns connections and gossip policy; this module owns the
//! closed message sum and its codec. Everything carries (height, round) so
//! the receiver can validate against its round state before applying.

use crate::consensus::round_state::Step;
use crate::types::serialization::{
    decode_vote_type, get_block_id, get_block_part, get_part_set_header, get_signed_proposal,
    get_signed_vote, put_block_id, put_block_part, put_part_set_header, put_signed_proposal,
    put_signed_vote, CodecError, Decoder, Encoder,
};
use crate::types::{BlockId, BlockPart, PartSetHeader, SignedProposal, SignedVote, VoteType};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerMsgType {
    Proposal = 0x01,
    BlockPart = 0x02,
    Vote = 0x03,
    NewRoundStep = 0x04,
    NewValidBlock = 0x05,
    HasVote = 0x06,
    VoteSetMaj23 = 0x07,
    VoteSetBits = 0x08,
}

impl PeerMsgType {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => PeerMsgType::Proposal,
            0x02 => PeerMsgType::BlockPart,
            0x03 => PeerMsgType::Vote,
            0x04 => PeerMsgType::NewRoundStep,
            0x05 => PeerMsgType::NewValidBlock,
            0x06 => PeerMsgType::HasVote,
            0x07 => PeerMsgType::VoteSetMaj23,
            0x08 => PeerMsgType::VoteSetBits,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Proposal(SignedProposal),
    BlockPart {
        height: u64,
        round: u32,
        part: BlockPart,
    },
    Vote(SignedVote),
    /// Gossip hint: where the sender is; lets peers skip stale traffic.
    NewRoundStep {
        height: u64,
        round: u32,
        step: Step,
        last_commit_round: i32,
    },
    /// Gossip hint: the sender holds a polka'd (or committing) block.
    NewValidBlock {
        height: u64,
        round: u32,
        parts_header: PartSetHeader,
        parts_held: Vec<u32>,
        is_commit: bool,
    },
    /// Gossip hint: the sender holds this validator's vote.
    HasVote {
        height: u64,
        round: u32,
        vote_type: VoteType,
        validator_index: u32,
    },
    /// Gossip hint: the sender observed +2/3 for this BlockID.
    VoteSetMaj23 {
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: Option<BlockId>,
    },
    /// Bitmap answer to `VoteSetMaj23`: which of those votes the sender has.
    VoteSetBits {
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: Option<BlockId>,
        bits: Vec<u32>,
    },
}

fn step_tag(step: Step) -> u8 {
    match step {
        Step::NewHeight => 0,
        Step::NewRound => 1,
        Step::Propose => 2,
        Step::Prevote => 3,
        Step::PrevoteWait => 4,
        Step::Precommit => 5,
        Step::PrecommitWait => 6,
        Step::Commit => 7,
    }
}

fn step_from_tag(tag: u8) -> Result<Step, CodecError> {
    Ok(match tag {
        0 => Step::NewHeight,
        1 => Step::NewRound,
        2 => Step::Propose,
        3 => Step::Prevote,
        4 => Step::PrevoteWait,
        5 => Step::Precommit,
        6 => Step::PrecommitWait,
        7 => Step::Commit,
        _ => return Err(CodecError::Invalid("step tag")),
    })
}

fn put_opt_block_id(e: &mut Encoder, id: &Option<BlockId>) {
    match id {
        None => e.put_u8(0),
        Some(id) => {
            e.put_u8(1);
            put_block_id(e, id);
        }
    }
}

fn get_opt_block_id(d: &mut Decoder<'_>) -> Result<Option<BlockId>, CodecError> {
    match d.get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(get_block_id(d)?)),
        _ => Err(CodecError::Invalid("opt block id tag")),
    }
}

fn put_u32_list(e: &mut Encoder, list: &[u32]) {
    e.put_u32(list.len() as u32);
    for v in list {
        e.put_u32(*v);
    }
}

fn get_u32_list(d: &mut Decoder<'_>) -> Result<Vec<u32>, CodecError> {
    let n = d.get_u32()? as usize;
    if n > 1 << 20 {
        return Err(CodecError::Invalid("list too long"));
    }
    let mut out = Vec::with_capacity(n.min(4096));
    for _ in 0..n {
        out.push(d.get_u32()?);
    }
    Ok(out)
}

pub fn encode_peer_message(msg: &PeerMessage) -> (PeerMsgType, Vec<u8>) {
    let mut e = Encoder::new();
    let ty = match msg {
        PeerMessage::Proposal(sp) => {
            put_signed_proposal(&mut e, sp);
            PeerMsgType::Proposal
        }
        PeerMessage::BlockPart {
            height,
            round,
            part,
        } => {
            e.put_u64(*height);
            e.put_u32(*round);
            put_block_part(&mut e, part);
            PeerMsgType::BlockPart
        }
        PeerMessage::Vote(sv) => {
            put_signed_vote(&mut e, sv);
            PeerMsgType::Vote
        }
        PeerMessage::NewRoundStep {
            height,
            round,
            step,
            last_commit_round,
        } => {
            e.put_u64(*height);
            e.put_u32(*round);
            e.put_u8(step_tag(*step));
            e.put_i32(*last_commit_round);
            PeerMsgType::NewRoundStep
        }
        PeerMessage::NewValidBlock {
            height,
            round,
            parts_header,
            parts_held,
            is_commit,
        } => {
            e.put_u64(*height);
            e.put_u32(*round);
            put_part_set_header(&mut e, parts_header);
            put_u32_list(&mut e, parts_held);
            e.put_u8(u8::from(*is_commit));
            PeerMsgType::NewValidBlock
        }
        PeerMessage::HasVote {
            height,
            round,
            vote_type,
            validator_index,
        } => {
            e.put_u64(*height);
            e.put_u32(*round);
            e.put_u8(match vote_type {
                VoteType::Prevote => 1,
                VoteType::Precommit => 2,
            });
            e.put_u32(*validator_index);
            PeerMsgType::HasVote
        }
        PeerMessage::VoteSetMaj23 {
            height,
            round,
            vote_type,
            block_id,
        } => {
            e.put_u64(*height);
            e.put_u32(*round);
            e.put_u8(match vote_type {
                VoteType::Prevote => 1,
                VoteType::Precommit => 2,
            });
            put_opt_block_id(&mut e, block_id);
            PeerMsgType::VoteSetMaj23
        }
        PeerMessage::VoteSetBits {
            height,
            round,
            vote_type,
            block_id,
            bits,
        } => {
            e.put_u64(*height);
            e.put_u32(*round);
            e.put_u8(match vote_type {
                VoteType::Prevote => 1,
                VoteType::Precommit => 2,
            });
            put_opt_block_id(&mut e, block_id);
            put_u32_list(&mut e, bits);
            PeerMsgType::VoteSetBits
        }
    };
    (ty, e.into_bytes())
}

pub fn decode_peer_message(ty: PeerMsgType, payload: &[u8]) -> Result<PeerMessage, CodecError> {
    let mut d = Decoder::new(payload);
    let msg = match ty {
        PeerMsgType::Proposal => PeerMessage::Proposal(get_signed_proposal(&mut d)?),
        PeerMsgType::BlockPart => PeerMessage::BlockPart {
            height: d.get_u64()?,
            round: d.get_u32()?,
            part: get_block_part(&mut d)?,
        },
        PeerMsgType::Vote => PeerMessage::Vote(get_signed_vote(&mut d)?),
        PeerMsgType::NewRoundStep => PeerMessage::NewRoundStep {
            height: d.get_u64()?,
            round: d.get_u32()?,
            step: step_from_tag(d.get_u8()?)?,
            last_commit_round: d.get_i32()?,
        },
        PeerMsgType::NewValidBlock => PeerMessage::NewValidBlock {
            height: d.get_u64()?,
            round: d.get_u32()?,
            parts_header: get_part_set_header(&mut d)?,
            parts_held: get_u32_list(&mut d)?,
            is_commit: d.get_u8()? != 0,
        },
        PeerMsgType::HasVote => PeerMessage::HasVote {
            height: d.get_u64()?,
            round: d.get_u32()?,
            vote_type: decode_vote_type(d.get_u8()?)?,
            validator_index: d.get_u32()?,
        },
        PeerMsgType::VoteSetMaj23 => PeerMessage::VoteSetMaj23 {
            height: d.get_u64()?,
            round: d.get_u32()?,
            vote_type: decode_vote_type(d.get_u8()?)?,
            block_id: get_opt_block_id(&mut d)?,
        },
        PeerMsgType::VoteSetBits => PeerMessage::VoteSetBits {
            height: d.get_u64()?,
            round: d.get_u32()?,
            vote_type: decode_vote_type(d.get_u8()?)?,
            block_id: get_opt_block_id(&mut d)?,
            bits: get_u32_list(&mut d)?,
        },
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash;

    #[test]
    fn gossip_hint_roundtrips() {
        let msgs = [
            PeerMessage::NewRoundStep {
                height: 9,
                round: 2,
                step: Step::PrevoteWait,
                last_commit_round: -1,
            },
            PeerMessage::HasVote {
                height: 9,
                round: 2,
                vote_type: VoteType::Precommit,
                validator_index: 3,
            },
            PeerMessage::VoteSetMaj23 {
                height: 9,
                round: 2,
                vote_type: VoteType::Prevote,
                block_id: Some(BlockId {
                    hash: Hash([7u8; 32]),
                    parts: PartSetHeader {
                        total: 2,
                        hash: Hash([8u8; 32]),
                    },
                }),
            },
            PeerMessage::VoteSetBits {
                height: 9,
                round: 2,
                vote_type: VoteType::Prevote,
                block_id: None,
                bits: vec![0, 2, 3],
            },
        ];
        for msg in msgs {
            let (ty, payload) = encode_peer_message(&msg);
            assert_eq!(decode_peer_message(ty, &payload).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        assert!(PeerMsgType::from_u8(0xFF).is_none());
    }
}
