//! Bridges the synchronous consensus core to the async subsystems.
//!
//! The core emits [`ConsensusCommand`]s over a crossbeam channel; this task
//! interprets them: gossip out, timers, proposal shaping, and the finalize
//! path through the [`BlockExecutor`]. Run it on a dedicated thread (it
//! blocks on the command channel).

use crate::consensus::events::{ConsensusCommand, ConsensusEvent, PeerId, TimeoutInfo};
use crate::consensus::executor::BlockExecutor;
use crate::consensus::messages::PeerMessage;
use crate::metrics::Metrics;
use crate::types::DuplicateVoteEvidence;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Hands the router transactions to propose. The mempool proper is an
/// external collaborator; a node without one proposes empty blocks.
pub trait TxSource: Send {
    fn reap(&mut self, max_bytes: u64, max_txs: u32) -> Vec<Vec<u8>>;
}

/// Default source: no transactions.
pub struct EmptyTxSource;

impl TxSource for EmptyTxSource {
    fn reap(&mut self, _max_bytes: u64, _max_txs: u32) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

pub struct CommandRouter {
    rx_cmd: Receiver<ConsensusCommand>,
    to_consensus: Sender<ConsensusEvent>,
    to_timer: mpsc::Sender<TimeoutInfo>,
    /// Outbound gossip; `None` for a single-node setup.
    to_gossip: Option<mpsc::Sender<PeerMessage>>,
    /// Evidence sink of the (external) evidence pool.
    evidence_tx: Option<Sender<DuplicateVoteEvidence>>,
    /// Peer misbehavior reports for the (external) transport.
    peer_error_tx: Option<Sender<(PeerId, String)>>,

    tx_source: Box<dyn TxSource>,
    executor: BlockExecutor,
    metrics: Option<Arc<Metrics>>,

    /// Evidence observed since the last commit, fed into `begin_block`.
    pending_evidence: Vec<DuplicateVoteEvidence>,
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx_cmd: Receiver<ConsensusCommand>,
        to_consensus: Sender<ConsensusEvent>,
        to_timer: mpsc::Sender<TimeoutInfo>,
        to_gossip: Option<mpsc::Sender<PeerMessage>>,
        evidence_tx: Option<Sender<DuplicateVoteEvidence>>,
        peer_error_tx: Option<Sender<(PeerId, String)>>,
        tx_source: Box<dyn TxSource>,
        executor: BlockExecutor,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            rx_cmd,
            to_consensus,
            to_timer,
            to_gossip,
            evidence_tx,
            peer_error_tx,
            tx_source,
            executor,
            metrics,
            pending_evidence: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            let cmd = match self.rx_cmd.recv() {
                Ok(cmd) => cmd,
                Err(_) => break, // core gone; shut down
            };
            self.handle(cmd).await;
        }
        debug!("command router stopped");
    }

    async fn handle(&mut self, cmd: ConsensusCommand) {
        match cmd {
            ConsensusCommand::BroadcastProposal(sp) => {
                self.gossip(PeerMessage::Proposal(sp)).await;
            }
            ConsensusCommand::BroadcastBlockPart {
                height,
                round,
                part,
            } => {
                self.gossip(PeerMessage::BlockPart {
                    height,
                    round,
                    part,
                })
                .await;
            }
            ConsensusCommand::BroadcastVote(sv) => {
                self.gossip(PeerMessage::Vote(sv)).await;
            }

            ConsensusCommand::ScheduleTimeout(t) => {
                let _ = self.to_timer.send(t).await;
            }

            ConsensusCommand::RequestProposalTxs {
                height,
                round,
                max_bytes,
                max_txs,
            } => {
                let raw = self.tx_source.reap(max_bytes, max_txs);
                let txs = match self.executor.prepare_proposal(raw, max_bytes).await {
                    Ok(txs) => txs,
                    Err(e) => {
                        error!(error = %e, height, round, "prepare_proposal failed");
                        return;
                    }
                };
                let _ = self
                    .to_consensus
                    .send(ConsensusEvent::ProposalTxsReady { height, round, txs });
            }

            ConsensusCommand::RequestBlockParts { height, block_id } => {
                // Part fetching rides on normal gossip; the transport sees
                // our round step and re-sends what we miss.
                debug!(height, block = %block_id.hash, "waiting on peers for committed block parts");
            }

            ConsensusCommand::FinalizeBlock { block, commit } => {
                let evidence = std::mem::take(&mut self.pending_evidence);
                let started = Instant::now();
                match self.executor.finalize(&block, &commit, evidence).await {
                    Ok(result) => {
                        if let Some(m) = &self.metrics {
                            m.block_finalize_duration
                                .observe(started.elapsed().as_secs_f64());
                            m.block_txs_committed.inc_by(block.txs.len() as u64);
                            m.consensus_height.set(block.header.height as i64);
                            m.consensus_rounds_per_height
                                .observe((commit.round + 1) as f64);
                        }
                        let _ = self.to_consensus.send(ConsensusEvent::BlockFinalized {
                            height: block.header.height,
                            app_hash: result.app_hash,
                            validator_updates: result.validator_updates,
                            param_updates: result.param_updates,
                        });
                    }
                    Err(e) => {
                        // Fatal to the height: the core stays in Commit and
                        // the supervisor decides whether to restart.
                        error!(error = %e, height = block.header.height, "block finalize failed");
                    }
                }
            }

            ConsensusCommand::Evidence(evidence) => {
                if let Some(m) = &self.metrics {
                    m.consensus_equivocations.inc();
                }
                warn!(
                    validator = ?evidence.validator(),
                    height = evidence.height(),
                    "forwarding duplicate-vote evidence"
                );
                self.pending_evidence.push(*evidence.clone());
                if let Some(tx) = &self.evidence_tx {
                    let _ = tx.send(*evidence);
                }
            }

            ConsensusCommand::PeerError { peer, reason } => {
                debug!(peer = %peer, reason = %reason, "peer sent invalid message");
                if let Some(tx) = &self.peer_error_tx {
                    let _ = tx.send((peer, reason));
                }
            }
        }
    }

    async fn gossip(&mut self, msg: PeerMessage) {
        if let Some(tx) = &self.to_gossip {
            let _ = tx.send(msg).await;
        }
    }
}
