use crate::types::BlockId;
use serde::{Deserialize, Serialize};

/// Round number that has no proof-of-lock attached.
pub const NO_POL_ROUND: i32 = -1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    /// Round whose polka justifies this block, or [`NO_POL_ROUND`].
    /// Valid range is -1 or 0..round.
    pub pol_round: i32,
    pub block_id: BlockId,
    pub timestamp_ms: u64,
}

impl Proposal {
    pub fn pol_round_in_range(&self) -> bool {
        self.pol_round == NO_POL_ROUND
            || (self.pol_round >= 0 && (self.pol_round as u32) < self.round)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub proposal: Proposal,
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}
