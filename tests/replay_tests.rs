//! WAL determinism: replaying the log against the same starting state must
//! land on the same committed blocks and the same final state as the
//! original run.

mod common;

use common::genesis;
use crossbeam_channel::{bounded, Receiver};
use lockstep::app::{AppConn, Application, KvApp};
use lockstep::consensus::events::{ConsensusCommand, ConsensusEvent};
use lockstep::consensus::executor::BlockExecutor;
use lockstep::consensus::replay::{replay_wal_tail, ReplayDriver};
use lockstep::consensus::round_state::ChainState;
use lockstep::consensus::state::{ConsensusConfig, ConsensusCore, ConsensusDeps};
use lockstep::crypto::ed25519::ConsensusSigner;
use lockstep::eventbus::EventBus;
use lockstep::storage::wal::Wal;
use lockstep::storage::{BlockStore, StateStore};
use lockstep::types::ValidatorId;
use std::path::Path;
use std::sync::{Arc, Mutex};

struct TestSigner {
    id: ValidatorId,
}

impl ConsensusSigner for TestSigner {
    fn sign(&self, _bytes: &[u8]) -> [u8; 64] {
        [0u8; 64]
    }
    fn validator_id(&self) -> ValidatorId {
        self.id
    }
}

fn make_executor(dir: &Path, chain: ChainState) -> BlockExecutor {
    let app: Arc<Mutex<dyn Application>> = Arc::new(Mutex::new(KvApp::new()));
    let block_store = Arc::new(BlockStore::open(&dir.join("blocks")).unwrap());
    let state_store = Arc::new(StateStore::open(&dir.join("state")).unwrap());
    BlockExecutor::new(chain, AppConn::InProcess(app), block_store, state_store)
}

fn make_core(
    chain: ChainState,
    signer: Option<ValidatorId>,
    wal: Option<Wal>,
) -> (
    ConsensusCore,
    Receiver<ConsensusCommand>,
    crossbeam_channel::Sender<ConsensusEvent>,
) {
    let (tx_ev, rx_ev) = bounded::<ConsensusEvent>(16);
    let (tx_cmd, rx_cmd) = bounded::<ConsensusCommand>(4096);
    let core = ConsensusCore::new(
        ConsensusConfig::default(),
        ConsensusDeps::permissive(),
        signer.map(|id| Box::new(TestSigner { id }) as Box<dyn ConsensusSigner>),
        chain,
        wal,
        Arc::new(EventBus::new()),
        None,
        rx_ev,
        tx_cmd,
    );
    (core, rx_cmd, tx_ev)
}

/// Drive a live single-validator core through `heights` commits, executing
/// finalize commands against the executor as a router would.
async fn drive_live(
    core: &mut ConsensusCore,
    rx_cmd: &Receiver<ConsensusCommand>,
    executor: &mut BlockExecutor,
    heights: u64,
) {
    core.start();
    let mut committed = 0u64;
    // Bounded scan: every iteration either answers a proposal request or
    // finalizes a block.
    for _ in 0..heights * 16 {
        if committed >= heights {
            break;
        }
        let mut progressed = false;
        while let Ok(cmd) = rx_cmd.try_recv() {
            match cmd {
                ConsensusCommand::RequestProposalTxs { height, round, .. } => {
                    let tx = format!("k{}=v{}", height, height).into_bytes();
                    core.process_event(ConsensusEvent::ProposalTxsReady {
                        height,
                        round,
                        txs: vec![tx],
                    });
                    progressed = true;
                }
                ConsensusCommand::FinalizeBlock { block, commit } => {
                    let result = executor.finalize(&block, &commit, vec![]).await.unwrap();
                    core.process_event(ConsensusEvent::BlockFinalized {
                        height: block.header.height,
                        app_hash: result.app_hash,
                        validator_updates: result.validator_updates,
                        param_updates: result.param_updates,
                    });
                    committed += 1;
                    progressed = true;
                }
                _ => {}
            }
        }
        if !progressed {
            break;
        }
    }
    assert_eq!(committed, heights, "live run should commit all heights");
}

#[tokio::test]
async fn wal_replay_reproduces_the_run() {
    let live_dir = tempfile::tempdir().unwrap();
    let (chain, ids) = genesis(1);
    let wal_path = live_dir.path().join("cs.wal");

    // Live run: three committed heights, WAL enabled.
    let mut executor = make_executor(live_dir.path(), chain.clone());
    let wal = Wal::open(&wal_path, u64::MAX).unwrap();
    let (mut core, rx_cmd, _tx_ev) = make_core(chain.clone(), Some(ids[0]), Some(wal));
    drive_live(&mut core, &rx_cmd, &mut executor, 3).await;

    let live_chain = core.chain_state().clone();
    assert_eq!(live_chain.height, 4);

    // Replay run: fresh app and stores, same genesis, no signer; only the
    // recorded messages drive the machine.
    let replay_dir = tempfile::tempdir().unwrap();
    let replay_executor = make_executor(replay_dir.path(), chain.clone());
    let (mut replay_core, replay_rx, _replay_tx) = make_core(chain.clone(), None, None);
    let mut driver = ReplayDriver::new(replay_executor, replay_rx);

    let applied = replay_wal_tail(&mut replay_core, &mut driver, &wal_path)
        .await
        .unwrap();
    assert!(applied > 0);

    let replay_chain = replay_core.chain_state().clone();
    assert_eq!(replay_chain.height, live_chain.height);
    assert_eq!(replay_chain.last_app_hash, live_chain.last_app_hash);
    assert_eq!(replay_chain.last_block_id, live_chain.last_block_id);
}

#[tokio::test]
async fn wal_tail_resumes_from_the_last_end_height() {
    let live_dir = tempfile::tempdir().unwrap();
    let (chain, ids) = genesis(1);
    let wal_path = live_dir.path().join("cs.wal");

    let mut executor = make_executor(live_dir.path(), chain.clone());
    let wal = Wal::open(&wal_path, u64::MAX).unwrap();
    let (mut core, rx_cmd, _tx_ev) = make_core(chain.clone(), Some(ids[0]), Some(wal));
    drive_live(&mut core, &rx_cmd, &mut executor, 2).await;

    // Recovery resumes from the state after height 2; the tail beyond the
    // last EndHeight(2) holds only height-3 messages (if any), so nothing
    // before it is re-applied.
    let recovered_chain = executor.chain().clone();
    assert_eq!(recovered_chain.height, 3);

    let replay_dir = tempfile::tempdir().unwrap();
    let replay_executor = make_executor(replay_dir.path(), recovered_chain.clone());
    let (mut replay_core, replay_rx, _replay_tx) = make_core(recovered_chain.clone(), None, None);
    let mut driver = ReplayDriver::new(replay_executor, replay_rx);

    let applied = replay_wal_tail(&mut replay_core, &mut driver, &wal_path)
        .await
        .unwrap();

    // The live run stopped right after committing height 2, so the tail
    // contains at most the first messages of height 3 and no commits.
    assert_eq!(replay_core.chain_state().height, 3);
    let _ = applied;
}
