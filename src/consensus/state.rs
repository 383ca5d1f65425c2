//! The per-validator decision engine.
//!
//! One logical task owns the [`RoundState`] and consumes a single merged
//! queue of peer messages, timer fires, and router replies. Every consumed
//! message is appended to the WAL before it is acted on; the WAL write is
//! the only I/O permitted inside the loop. All round transitions happen
//! here, in this one thread, so no locking is needed anywhere in the
//! decision path.

use crate::consensus::events::{ConsensusCommand, ConsensusEvent, PeerId, TimeoutInfo};
use crate::consensus::round_state::{ChainState, RoundState, Step, NO_ROUND};
use crate::consensus::vote_set::AddVoteResult;
use crate::crypto::ed25519::{verify, ConsensusSigner};
use crate::crypto::merkle::merkle_root;
use crate::eventbus::{BusEvent, EventBus};
use crate::metrics::Metrics;
use crate::storage::wal::{Wal, WalMessage};
use crate::types::serialization::{
    block_hash, canonical_proposal_bytes, canonical_vote_bytes, encode_block,
};
use crate::types::{
    Block, BlockHeader, BlockId, BlockPart, PartSet, PartSetError, Proposal, SignedProposal,
    SignedVote, ValidatorId, Vote, VoteType, NO_POL_ROUND,
};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    pub timeout_commit_ms: u64,
    /// Advance to the next height as soon as a block is finalized instead of
    /// waiting out `timeout_commit_ms` collecting late precommits.
    pub skip_timeout_commit: bool,
    pub create_empty_blocks: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: true,
            create_empty_blocks: true,
        }
    }
}

/// Injected checks so the core stays free of global state and the tests can
/// substitute their own. `process_proposal` is the application's accept /
/// reject hook for proposed blocks.
pub struct ConsensusDeps {
    pub verify_proposal_sig: Box<dyn Fn(&ValidatorId, &SignedProposal) -> bool + Send>,
    pub verify_vote_sig: Box<dyn Fn(&SignedVote) -> bool + Send>,
    pub process_proposal: Box<dyn Fn(&Block) -> bool + Send>,
}

impl ConsensusDeps {
    /// Real ed25519 verification over canonical bytes scoped to `chain_id`.
    pub fn ed25519(chain_id: String) -> Self {
        let vote_chain_id = chain_id.clone();
        Self {
            verify_proposal_sig: Box::new(move |proposer, sp| {
                let bytes = canonical_proposal_bytes(&chain_id, &sp.proposal);
                verify(proposer, &bytes, &sp.signature)
            }),
            verify_vote_sig: Box::new(move |sv| {
                let bytes = canonical_vote_bytes(&vote_chain_id, &sv.vote);
                verify(&sv.vote.validator, &bytes, &sv.signature)
            }),
            process_proposal: Box::new(|_| true),
        }
    }

    /// Everything passes; for tests that construct unsigned fixtures.
    pub fn permissive() -> Self {
        Self {
            verify_proposal_sig: Box::new(|_, _| true),
            verify_vote_sig: Box::new(|_| true),
            process_proposal: Box::new(|_| true),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct ConsensusCore {
    cfg: ConsensusConfig,
    deps: ConsensusDeps,
    signer: Option<Box<dyn ConsensusSigner>>,

    chain: ChainState,
    rs: RoundState,

    wal: Option<Wal>,
    bus: Arc<EventBus>,
    metrics: Option<Arc<Metrics>>,

    rx: Receiver<ConsensusEvent>,
    tx_cmd: Sender<ConsensusCommand>,

    /// Validator set of the previous height; late precommits for it are
    /// checked against the set that actually voted.
    last_validators: Option<crate::types::ValidatorSet>,

    /// Feeding recorded history: suppress signing, timers, and gossip so the
    /// recorded messages alone drive the machine.
    replay: bool,
    /// The first round has been entered (either live or for replay).
    started: bool,
    /// A FinalizeBlock command is in flight for the current height.
    finalize_sent: bool,
    /// WAL write failed: liveness is sacrificed for this height.
    halted: bool,
}

impl ConsensusCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ConsensusConfig,
        deps: ConsensusDeps,
        signer: Option<Box<dyn ConsensusSigner>>,
        chain: ChainState,
        wal: Option<Wal>,
        bus: Arc<EventBus>,
        metrics: Option<Arc<Metrics>>,
        rx: Receiver<ConsensusEvent>,
        tx_cmd: Sender<ConsensusCommand>,
    ) -> Self {
        let rs = RoundState::new(chain.height, chain.validators.clone(), now_ms());
        Self {
            cfg,
            deps,
            signer,
            chain,
            rs,
            wal,
            bus,
            metrics,
            rx,
            tx_cmd,
            last_validators: None,
            replay: false,
            started: false,
            finalize_sent: false,
            halted: false,
        }
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &ChainState {
        &self.chain
    }

    pub fn set_replay(&mut self, replay: bool) {
        self.replay = replay;
    }

    /// Enter the first round. `run` does this on its own; harnesses that
    /// drive the machine synchronously call it before feeding events.
    pub fn start(&mut self) {
        if !self.started {
            self.started = true;
            self.enter_new_round(0);
        }
    }

    /// Enter the first round with signing, timers, and gossip suppressed;
    /// recorded messages will drive everything from here.
    pub fn start_for_replay(&mut self) {
        self.replay = true;
        self.start();
    }

    /// Run until the inbound channel closes. Drains opportunistically after
    /// each blocking receive so bursts are handled in one batch.
    pub fn run(mut self) {
        info!(
            height = self.rs.height,
            validators = self.rs.validators.len(),
            "consensus core starting"
        );
        self.start();

        loop {
            let ev = match self.rx.recv() {
                Ok(ev) => ev,
                Err(_) => break,
            };
            self.process_event(ev);

            while let Ok(ev) = self.rx.try_recv() {
                self.process_event(ev);
            }
        }
        info!("consensus core stopped");
    }

    /// Apply one event. Public so the replay harness can single-step the
    /// machine without channels.
    pub fn process_event(&mut self, ev: ConsensusEvent) {
        if self.halted {
            // Only observation is allowed once the height is halted.
            if let ConsensusEvent::GetRoundState { reply } = ev {
                let _ = reply.send(self.rs.summary());
            }
            return;
        }

        match ev {
            ConsensusEvent::Proposal { proposal, peer } => {
                if self.wal_message(WalMessage::Proposal(proposal.clone())) {
                    self.handle_proposal(proposal, peer);
                }
            }
            ConsensusEvent::BlockPart {
                height,
                round,
                part,
                peer,
            } => {
                if self.wal_message(WalMessage::BlockPart {
                    height,
                    round,
                    part: part.clone(),
                }) {
                    self.handle_block_part(height, round, part, peer);
                }
            }
            ConsensusEvent::Vote { vote, peer } => {
                if self.wal_message(WalMessage::Vote(vote.clone())) {
                    self.handle_vote(vote, peer);
                }
            }
            ConsensusEvent::Timeout(t) => {
                if self.wal_message(WalMessage::Timeout(t)) {
                    self.handle_timeout(t);
                }
            }
            ConsensusEvent::ProposalTxsReady { height, round, txs } => {
                self.handle_proposal_txs_ready(height, round, txs)
            }
            ConsensusEvent::BlockFinalized {
                height,
                app_hash,
                validator_updates,
                param_updates,
            } => self.handle_block_finalized(height, app_hash, validator_updates, param_updates),
            ConsensusEvent::GetRoundState { reply } => {
                let _ = reply.send(self.rs.summary());
            }
        }
    }

    // -------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------

    /// Append the consumed message to the WAL before acting. Returns false
    /// (and halts the height) when the write fails: a gap in the log would
    /// make recovery diverge, so safety wins over liveness.
    fn wal_message(&mut self, msg: WalMessage) -> bool {
        if self.replay {
            return true;
        }
        let Some(wal) = self.wal.as_mut() else {
            return true;
        };
        match wal.write_message(now_ms(), msg) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, height = self.rs.height, "WAL write failed; halting height");
                self.halted = true;
                false
            }
        }
    }

    fn wal_end_height(&mut self, height: u64) -> bool {
        if self.replay {
            return true;
        }
        let Some(wal) = self.wal.as_mut() else {
            return true;
        };
        match wal.write_end_height(now_ms(), height) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, height, "WAL write failed; halting height");
                self.halted = true;
                false
            }
        }
    }

    fn command(&self, cmd: ConsensusCommand) {
        if self.replay && !matches!(cmd, ConsensusCommand::FinalizeBlock { .. }) {
            return;
        }
        let _ = self.tx_cmd.send(cmd);
    }

    fn publish(&self, ev: BusEvent) {
        self.bus.publish(&ev);
    }

    fn peer_error(&self, peer: Option<PeerId>, reason: impl Into<String>) {
        if let Some(peer) = peer {
            self.command(ConsensusCommand::PeerError {
                peer,
                reason: reason.into(),
            });
        }
    }

    fn my_id(&self) -> Option<ValidatorId> {
        self.signer.as_ref().map(|s| s.validator_id())
    }

    fn is_proposer(&self) -> bool {
        self.my_id() == Some(self.rs.proposer())
    }

    fn schedule_timeout(&self, step: Step) {
        if self.replay {
            return;
        }
        let round = self.rs.round as u64;
        let duration_ms = match step {
            Step::Propose => self
                .cfg
                .timeout_propose_ms
                .saturating_add(round * self.cfg.timeout_propose_delta_ms),
            Step::PrevoteWait => self
                .cfg
                .timeout_prevote_ms
                .saturating_add(round * self.cfg.timeout_prevote_delta_ms),
            Step::PrecommitWait => self
                .cfg
                .timeout_precommit_ms
                .saturating_add(round * self.cfg.timeout_precommit_delta_ms),
            Step::NewHeight => self.cfg.timeout_commit_ms,
            _ => return,
        };
        self.command(ConsensusCommand::ScheduleTimeout(TimeoutInfo {
            height: self.rs.height,
            round: self.rs.round,
            step,
            duration_ms,
        }));
    }

    // -------------------------------------------------------
    // Round transitions
    // -------------------------------------------------------

    fn enter_new_round(&mut self, round: u32) {
        debug!(height = self.rs.height, round, "entering new round");
        if let Some(m) = &self.metrics {
            m.consensus_round.set(round as i64);
        }
        if round > self.rs.round || self.rs.step == Step::NewHeight {
            self.rs.round = round;
            self.rs.step = Step::NewRound;
            // A later round means a fresh proposal slot; the valid block (if
            // any) survives and is re-proposed by whoever leads next.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.publish(BusEvent::NewRound {
            height: self.rs.height,
            round,
        });
        self.enter_propose();
    }

    fn enter_propose(&mut self) {
        self.rs.step = Step::Propose;
        self.schedule_timeout(Step::Propose);

        if self.replay || !self.is_proposer() {
            return;
        }

        if let (Some(block), Some(parts)) =
            (self.rs.valid_block.clone(), self.rs.valid_block_parts.clone())
        {
            // Locked/valid proposer must re-present its valid block so the
            // rest of the network can justify unlocking.
            let pol_round = self.rs.valid_round;
            self.propose_block(block, parts, pol_round);
        } else {
            self.command(ConsensusCommand::RequestProposalTxs {
                height: self.rs.height,
                round: self.rs.round,
                max_bytes: self.chain.params.max_block_bytes,
                max_txs: self.chain.params.max_txs_per_block,
            });
        }
    }

    fn handle_proposal_txs_ready(&mut self, height: u64, round: u32, txs: Vec<Vec<u8>>) {
        if self.replay
            || height != self.rs.height
            || round != self.rs.round
            || self.rs.step != Step::Propose
            || !self.is_proposer()
            || self.rs.proposal.is_some()
        {
            return;
        }
        if !self.cfg.create_empty_blocks && txs.is_empty() {
            return;
        }
        let Some(my_id) = self.my_id() else { return };

        let block = Block {
            header: BlockHeader {
                chain_id: self.chain.chain_id.clone(),
                height: self.rs.height,
                timestamp_ms: now_ms(),
                last_block_id: self.chain.last_block_id,
                proposer: my_id,
                validator_set_hash: self.rs.validators.set_hash(),
                app_hash: self.chain.last_app_hash,
                tx_merkle_root: merkle_root(&txs),
            },
            txs,
            last_commit: self.chain.last_commit.clone(),
        };
        let parts = PartSet::from_bytes(&encode_block(&block));
        self.propose_block(block, parts, NO_POL_ROUND);
    }

    /// Sign and install our own proposal, then gossip it and its parts.
    fn propose_block(&mut self, block: Block, parts: PartSet, pol_round: i32) {
        let Some(signer) = self.signer.as_ref() else {
            return;
        };
        let block_id = BlockId {
            hash: block_hash(&block),
            parts: parts.header(),
        };
        let proposal = Proposal {
            height: self.rs.height,
            round: self.rs.round,
            pol_round,
            block_id,
            timestamp_ms: now_ms(),
        };
        let signature = signer.sign(&canonical_proposal_bytes(&self.chain.chain_id, &proposal));
        let sp = SignedProposal {
            proposal,
            signature,
        };

        if !self.wal_message(WalMessage::Proposal(sp.clone())) {
            return;
        }
        for part in parts.parts() {
            if !self.wal_message(WalMessage::BlockPart {
                height: self.rs.height,
                round: self.rs.round,
                part: part.clone(),
            }) {
                return;
            }
        }

        info!(
            height = self.rs.height,
            round = self.rs.round,
            block = %block_id.hash,
            pol_round,
            "proposing block"
        );

        self.rs.proposal = Some(sp.clone());
        self.rs.proposal_block = Some(block);
        self.rs.proposal_block_parts = Some(parts.clone());

        self.command(ConsensusCommand::BroadcastProposal(sp));
        for part in parts.parts() {
            self.command(ConsensusCommand::BroadcastBlockPart {
                height: self.rs.height,
                round: self.rs.round,
                part: part.clone(),
            });
        }
        self.publish(BusEvent::CompleteProposal {
            height: self.rs.height,
            round: self.rs.round,
            block_id,
        });

        if self.rs.step == Step::Propose {
            self.enter_prevote();
        }
    }

    // -------------------------------------------------------
    // Inbound handlers
    // -------------------------------------------------------

    fn handle_proposal(&mut self, sp: SignedProposal, peer: Option<PeerId>) {
        if let Some(m) = &self.metrics {
            m.consensus_proposals_received.inc();
        }
        let p = &sp.proposal;
        if p.height != self.rs.height || p.round != self.rs.round {
            return;
        }
        if self.rs.step == Step::Commit {
            // Already assembling the committed block; a late proposal must
            // not disturb the fetch buffer.
            return;
        }
        // First proposal for the round wins; a byte-identical duplicate is
        // idempotent, anything else from the proposer is equivocation the
        // evidence pool learns about from the vote path.
        if self.rs.proposal.is_some() {
            return;
        }
        if !p.pol_round_in_range() {
            self.peer_error(peer, "proposal POLRound out of range");
            return;
        }
        let proposer = self.rs.proposer();
        if !(self.deps.verify_proposal_sig)(&proposer, &sp) {
            self.peer_error(peer, "proposal not signed by round proposer");
            return;
        }

        debug!(
            height = p.height,
            round = p.round,
            block = %p.block_id.hash,
            "received proposal"
        );
        self.rs.proposal_block_parts = Some(PartSet::from_header(sp.proposal.block_id.parts));
        self.rs.proposal = Some(sp);
    }

    fn handle_block_part(&mut self, height: u64, round: u32, part: BlockPart, peer: Option<PeerId>) {
        if height != self.rs.height {
            return;
        }
        if self.rs.step != Step::Commit && round != self.rs.round {
            return;
        }
        let max_bytes = self.chain.params.max_block_bytes;
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // No proposal (or commit target) announced the part set yet.
            return;
        };
        match parts.add_part(part, max_bytes) {
            Ok(true) => {}
            Ok(false) => return,
            Err(PartSetError::TooLarge { max }) => {
                warn!(height, round, max, "rejecting oversized block part");
                return;
            }
            Err(e) => {
                self.peer_error(peer, e.to_string());
                return;
            }
        }
        if parts.is_complete() {
            self.complete_proposal_block();
        }
    }

    /// All parts held: decode, cross-check the hash, and move the round
    /// forward from wherever it was waiting.
    fn complete_proposal_block(&mut self) {
        let Some(parts) = self.rs.proposal_block_parts.as_ref() else {
            return;
        };
        let bytes = match parts.assemble() {
            Ok(b) => b,
            Err(_) => return,
        };
        let block = match crate::types::serialization::decode_block(&bytes) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "assembled block parts do not decode");
                return;
            }
        };

        let expected_hash = if self.rs.commit_round != NO_ROUND {
            self.commit_target().map(|bid| bid.hash)
        } else {
            self.rs.proposal_block_id().map(|bid| bid.hash)
        };
        let actual = block_hash(&block);
        if expected_hash != Some(actual) {
            warn!(block = %actual, "assembled block hash does not match announced block id");
            return;
        }

        let block_id = BlockId {
            hash: actual,
            parts: parts.header(),
        };
        self.rs.proposal_block = Some(block);
        self.publish(BusEvent::CompleteProposal {
            height: self.rs.height,
            round: self.rs.round,
            block_id,
        });
        debug!(height = self.rs.height, block = %actual, "proposal block complete");

        match self.rs.step {
            Step::Propose => self.enter_prevote(),
            Step::Prevote | Step::PrevoteWait => self.check_prevote_quorum(),
            Step::Commit => self.try_finalize(),
            _ => {}
        }
    }

    fn handle_vote(&mut self, sv: SignedVote, peer: Option<PeerId>) {
        if let Some(m) = &self.metrics {
            m.consensus_votes_received.inc();
        }
        let v = &sv.vote;

        // Late precommits for the previous height extend the stored commit
        // certificate during the commit wait.
        if self.rs.height > 1
            && v.height == self.rs.height - 1
            && v.vote_type == VoteType::Precommit
        {
            if let (Some(last), Some(last_vals)) =
                (self.rs.last_commit.as_mut(), self.last_validators.as_ref())
            {
                if (self.deps.verify_vote_sig)(&sv) {
                    let _ = last.add_vote(last_vals, sv.clone());
                    self.publish(BusEvent::Vote(sv));
                }
            }
            return;
        }
        if v.height != self.rs.height {
            debug!(
                vote_height = v.height,
                height = self.rs.height,
                "ignoring vote for another height"
            );
            return;
        }
        if !(self.deps.verify_vote_sig)(&sv) {
            self.peer_error(peer, "invalid vote signature");
            return;
        }

        let vote_round = v.round;
        let vote_type = v.vote_type;
        match self.rs.votes.add_vote(sv.clone()) {
            Err(e) => {
                self.peer_error(peer, e.to_string());
                return;
            }
            Ok(AddVoteResult::Duplicate) => return,
            Ok(AddVoteResult::Conflicting(evidence)) => {
                warn!(
                    validator = ?evidence.validator(),
                    height = evidence.height(),
                    "conflicting votes detected; emitting evidence"
                );
                self.command(ConsensusCommand::Evidence(evidence));
                // The equivocating tally still stands; fall through.
            }
            Ok(AddVoteResult::Added) => {
                self.publish(BusEvent::Vote(sv));
            }
        }

        // Round skip: +1/3 of power already moved ahead of us.
        if vote_round > self.rs.round
            && self.rs.step != Step::Commit
            && self.rs.votes.power_at_round(vote_round) >= self.rs.votes.one_third_threshold()
        {
            info!(
                height = self.rs.height,
                from_round = self.rs.round,
                to_round = vote_round,
                "skipping to round with +1/3 votes"
            );
            self.enter_new_round(vote_round);
        }

        // A commit certificate may complete at any round of this height,
        // including one we already left.
        if self.rs.step != Step::Commit {
            self.check_commit_any_round();
            if self.rs.step == Step::Commit {
                return;
            }
        }

        match (vote_type, self.rs.step) {
            (VoteType::Prevote, Step::Prevote | Step::PrevoteWait) if vote_round == self.rs.round => {
                self.check_prevote_quorum()
            }
            (VoteType::Precommit, Step::Precommit | Step::PrecommitWait)
                if vote_round == self.rs.round =>
            {
                self.check_precommit_quorum()
            }
            _ => {}
        }
    }

    fn handle_timeout(&mut self, t: TimeoutInfo) {
        if t.height != self.rs.height || t.round != self.rs.round {
            return; // stale fire for a state already passed
        }
        if let Some(m) = &self.metrics {
            m.consensus_timeouts.inc();
        }
        match t.step {
            Step::Propose if self.rs.step == Step::Propose => {
                self.publish(BusEvent::TimeoutPropose {
                    height: t.height,
                    round: t.round,
                });
                self.enter_prevote();
            }
            Step::PrevoteWait if self.rs.step == Step::PrevoteWait => {
                self.publish(BusEvent::TimeoutWait {
                    height: t.height,
                    round: t.round,
                    step: Step::PrevoteWait,
                });
                self.enter_precommit(None);
            }
            Step::PrecommitWait if self.rs.step == Step::PrecommitWait => {
                self.publish(BusEvent::TimeoutWait {
                    height: t.height,
                    round: t.round,
                    step: Step::PrecommitWait,
                });
                self.enter_new_round(self.rs.round + 1);
            }
            Step::NewHeight if self.rs.step == Step::NewHeight => {
                self.enter_new_round(0);
            }
            _ => {} // transient: the machine has moved on
        }
    }

    // -------------------------------------------------------
    // Prevote
    // -------------------------------------------------------

    fn enter_prevote(&mut self) {
        let decision = self.decide_prevote();
        self.rs.step = Step::Prevote;
        self.sign_vote(VoteType::Prevote, decision);
        self.check_prevote_quorum();
    }

    /// The prevote rule. Locked validators stay with their lock unless a
    /// strictly later polka justifies moving; unlocked validators vote for
    /// a complete, valid proposal or nil.
    fn decide_prevote(&self) -> Option<BlockId> {
        if self.rs.locked_round != NO_ROUND {
            if let Some(bid) = self.later_polka_block() {
                return Some(bid);
            }
            return self.locked_block_id();
        }

        if self.rs.proposal_complete() && self.validate_proposal_block() {
            return self.rs.proposal_block_id();
        }
        None
    }

    fn locked_block_id(&self) -> Option<BlockId> {
        let block = self.rs.locked_block.as_ref()?;
        let parts = self.rs.locked_block_parts.as_ref()?;
        Some(BlockId {
            hash: block_hash(block),
            parts: parts.header(),
        })
    }

    /// A polka strictly after our lock for the block we currently hold is
    /// the only thing that lets a locked validator prevote elsewhere
    /// (POLSafety: polkas at or before the lock never count).
    fn later_polka_block(&self) -> Option<BlockId> {
        let proposal_bid = self.rs.proposal_block_id()?;
        if !self.rs.proposal_complete() || !self.validate_proposal_block() {
            return None;
        }
        if Some(proposal_bid) == self.locked_block_id() {
            return None;
        }
        let from = (self.rs.locked_round + 1) as u32;
        for r in from..self.rs.round {
            if let Some(set) = self.rs.votes.prevotes(r) {
                if set.two_thirds_majority() == Some(Some(proposal_bid)) {
                    return Some(proposal_bid);
                }
            }
        }
        None
    }

    /// Header consistency, size bounds, POLRound justification, and the
    /// application's own accept/reject.
    fn validate_proposal_block(&self) -> bool {
        let (Some(sp), Some(block), Some(parts)) = (
            &self.rs.proposal,
            &self.rs.proposal_block,
            &self.rs.proposal_block_parts,
        ) else {
            return false;
        };
        let h = &block.header;
        if h.chain_id != self.chain.chain_id
            || h.height != self.rs.height
            || h.last_block_id != self.chain.last_block_id
            || h.validator_set_hash != self.rs.validators.set_hash()
            || h.app_hash != self.chain.last_app_hash
            || h.tx_merkle_root != merkle_root(&block.txs)
        {
            return false;
        }
        if block.txs.len() as u32 > self.chain.params.max_txs_per_block
            || parts.byte_size() > self.chain.params.max_block_bytes
        {
            return false;
        }
        match (&block.last_commit, self.rs.height) {
            (None, 1) => {}
            (Some(c), height)
                if height > 1
                    && c.height == height - 1
                    && Some(c.block_id) == self.chain.last_block_id => {}
            _ => return false,
        }

        // A POLRound must point at an actual polka for this block.
        let pol = sp.proposal.pol_round;
        if pol != NO_POL_ROUND {
            let justified = self
                .rs
                .votes
                .prevotes(pol as u32)
                .map(|set| set.two_thirds_majority() == Some(Some(sp.proposal.block_id)))
                .unwrap_or(false);
            if !justified {
                return false;
            }
        }

        (self.deps.process_proposal)(block)
    }

    fn check_prevote_quorum(&mut self) {
        if self.rs.step != Step::Prevote && self.rs.step != Step::PrevoteWait {
            return;
        }
        let Some(set) = self.rs.votes.prevotes(self.rs.round) else {
            return;
        };
        if let Some(maj) = set.two_thirds_majority() {
            self.enter_precommit(Some(maj));
        } else if set.has_two_thirds_any() && self.rs.step == Step::Prevote {
            self.rs.step = Step::PrevoteWait;
            self.schedule_timeout(Step::PrevoteWait);
        }
    }

    // -------------------------------------------------------
    // Precommit
    // -------------------------------------------------------

    /// `polka`: `Some(Some(b))` is a polka for block b; `Some(None)` a polka
    /// for nil (unlock); `None` means the prevote wait expired with no majority
    /// (precommit nil, keep any lock).
    fn enter_precommit(&mut self, polka: Option<Option<BlockId>>) {
        let mut decision: Option<BlockId> = None;

        match polka {
            Some(Some(bid)) => {
                let holds_block = self.rs.proposal_block_id() == Some(bid)
                    && self.rs.proposal_complete()
                    && self.validate_proposal_block();

                if holds_block {
                    self.rs.valid_round = self.rs.round as i32;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                    self.publish(BusEvent::ValidBlock {
                        height: self.rs.height,
                        round: self.rs.round,
                        block_id: bid,
                    });

                    let previous = self.locked_block_id();
                    self.rs.locked_round = self.rs.round as i32;
                    self.rs.locked_block = self.rs.proposal_block.clone();
                    self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                    if previous.is_some() && previous != Some(bid) {
                        info!(
                            height = self.rs.height,
                            round = self.rs.round,
                            block = %bid.hash,
                            "relocking on new polka"
                        );
                        self.publish(BusEvent::Relock {
                            height: self.rs.height,
                            round: self.rs.round,
                            block_id: bid,
                        });
                    }
                    decision = Some(bid);
                } else if self.locked_block_id() == Some(bid) {
                    // Relock on the same block at a later round.
                    self.rs.locked_round = self.rs.round as i32;
                    decision = Some(bid);
                }
                // Polka for a block we do not hold: precommit nil, no lock.
            }
            Some(None) => {
                if self.rs.locked_round != NO_ROUND {
                    info!(
                        height = self.rs.height,
                        round = self.rs.round,
                        "unlocking on nil polka"
                    );
                    self.rs.locked_round = NO_ROUND;
                    self.rs.locked_block = None;
                    self.rs.locked_block_parts = None;
                    self.publish(BusEvent::Unlock {
                        height: self.rs.height,
                        round: self.rs.round,
                    });
                }
            }
            None => {} // timeout: nil, keep lock
        }

        self.rs.step = Step::Precommit;
        self.sign_vote(VoteType::Precommit, decision);
        self.check_precommit_quorum();
    }

    fn check_precommit_quorum(&mut self) {
        if self.rs.step != Step::Precommit && self.rs.step != Step::PrecommitWait {
            return;
        }
        let Some(set) = self.rs.votes.precommits(self.rs.round) else {
            return;
        };
        match set.two_thirds_majority() {
            Some(Some(bid)) => self.enter_commit(bid, self.rs.round),
            Some(None) => self.enter_new_round(self.rs.round + 1),
            None => {
                if set.has_two_thirds_any() && self.rs.step == Step::Precommit {
                    self.rs.step = Step::PrecommitWait;
                    self.schedule_timeout(Step::PrecommitWait);
                }
            }
        }
    }

    /// Scan every round with precommits; a certificate completed by late
    /// votes in a round we already left still commits the height.
    fn check_commit_any_round(&mut self) {
        for r in self.rs.votes.precommit_rounds() {
            let maj = self
                .rs
                .votes
                .precommits(r)
                .and_then(|set| set.two_thirds_majority());
            if let Some(Some(bid)) = maj {
                self.enter_commit(bid, r);
                return;
            }
        }
    }

    // -------------------------------------------------------
    // Commit
    // -------------------------------------------------------

    fn enter_commit(&mut self, block_id: BlockId, commit_round: u32) {
        if self.rs.step == Step::Commit {
            return;
        }
        info!(
            height = self.rs.height,
            commit_round,
            block = %block_id.hash,
            "+2/3 precommits; entering commit"
        );
        self.rs.commit_round = commit_round as i32;
        self.rs.step = Step::Commit;
        self.publish(BusEvent::ValidBlock {
            height: self.rs.height,
            round: commit_round,
            block_id,
        });

        let have_target = self
            .rs
            .proposal_block
            .as_ref()
            .map(|b| block_hash(b) == block_id.hash)
            .unwrap_or(false);

        if !have_target {
            if self
                .rs
                .locked_block
                .as_ref()
                .map(|b| block_hash(b) == block_id.hash)
                .unwrap_or(false)
            {
                self.rs.proposal_block = self.rs.locked_block.clone();
                self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
            } else {
                // We precommitted nil or missed the block entirely; fetch
                // the parts the certificate names.
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
                self.command(ConsensusCommand::RequestBlockParts {
                    height: self.rs.height,
                    block_id,
                });
            }
        }
        self.try_finalize();
    }

    fn commit_target(&self) -> Option<BlockId> {
        if self.rs.commit_round == NO_ROUND {
            return None;
        }
        self.rs
            .votes
            .precommits(self.rs.commit_round as u32)
            .and_then(|set| set.two_thirds_majority())
            .flatten()
    }

    fn try_finalize(&mut self) {
        if self.rs.step != Step::Commit || self.finalize_sent {
            return;
        }
        let Some(target) = self.commit_target() else {
            return;
        };
        let Some(block) = self.rs.proposal_block.as_ref() else {
            return;
        };
        if block_hash(block) != target.hash {
            return;
        }
        let Some(commit) = self
            .rs
            .votes
            .precommits(self.rs.commit_round as u32)
            .and_then(|set| set.make_commit())
        else {
            return;
        };

        self.finalize_sent = true;
        self.command(ConsensusCommand::FinalizeBlock {
            block: Box::new(block.clone()),
            commit,
        });
    }

    fn handle_block_finalized(
        &mut self,
        height: u64,
        app_hash: crate::types::Hash,
        validator_updates: Vec<crate::types::ValidatorUpdate>,
        param_updates: crate::types::ConsensusParamUpdates,
    ) {
        if self.rs.step != Step::Commit || height != self.rs.height || !self.finalize_sent {
            return;
        }
        let Some(commit) = self
            .rs
            .votes
            .precommits(self.rs.commit_round as u32)
            .and_then(|set| set.make_commit())
        else {
            return;
        };
        let Some(block) = self.rs.proposal_block.clone() else {
            return;
        };

        if !self.wal_end_height(height) {
            return;
        }

        if let Some(m) = &self.metrics {
            let elapsed_ms = now_ms().saturating_sub(self.rs.start_time_ms);
            m.consensus_block_commit_duration
                .observe(elapsed_ms as f64 / 1000.0);
        }

        info!(
            height,
            block = %commit.block_id.hash,
            app_hash = %app_hash,
            "block committed"
        );
        self.publish(BusEvent::NewBlock {
            height,
            block_id: commit.block_id,
        });
        self.publish(BusEvent::NewBlockHeader(block.header.clone()));

        self.last_validators = Some(self.chain.validators.clone());
        self.chain = self
            .chain
            .advance(commit, app_hash, &validator_updates, &param_updates);

        // Fresh round state; the committing precommits stay reachable for
        // one more height so late votes can still improve the certificate.
        let last_precommits = self
            .rs
            .votes
            .precommits(self.rs.commit_round as u32)
            .cloned();
        let mut rs = RoundState::new(self.chain.height, self.chain.validators.clone(), now_ms());
        rs.last_commit = last_precommits;
        self.rs = rs;
        self.finalize_sent = false;

        if self.cfg.skip_timeout_commit {
            self.enter_new_round(0);
        } else {
            self.rs.step = Step::NewHeight;
            self.schedule_timeout(Step::NewHeight);
        }
    }

    // -------------------------------------------------------
    // Own votes
    // -------------------------------------------------------

    fn sign_vote(&mut self, vote_type: VoteType, block_id: Option<BlockId>) {
        if self.replay {
            return;
        }
        let Some(signer) = self.signer.as_ref() else {
            return;
        };
        let my_id = signer.validator_id();
        let Some(index) = self.rs.validators.index_of(&my_id) else {
            return; // not in this height's validator set
        };

        let vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp_ms: now_ms(),
            validator: my_id,
            validator_index: index,
        };
        let signature = signer.sign(&canonical_vote_bytes(&self.chain.chain_id, &vote));
        let sv = SignedVote { vote, signature };

        if !self.wal_message(WalMessage::Vote(sv.clone())) {
            return;
        }

        debug!(
            height = self.rs.height,
            round = self.rs.round,
            vote_type = %vote_type,
            block = block_id.map(|b| b.hash.to_string()).unwrap_or_else(|| "<nil>".into()),
            "casting vote"
        );

        let _ = self.rs.votes.add_vote(sv.clone());
        self.publish(BusEvent::Vote(sv.clone()));
        self.command(ConsensusCommand::BroadcastVote(sv));
    }
}
