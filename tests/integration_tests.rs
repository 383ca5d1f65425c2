//! End-to-end single-node run: real channels, the timeout scheduler, the
//! command router, an in-process application, and RocksDB-backed stores.

use crossbeam_channel::bounded;
use lockstep::app::{AppConn, Application, KvApp};
use lockstep::consensus::events::{ConsensusCommand, ConsensusEvent};
use lockstep::consensus::executor::BlockExecutor;
use lockstep::consensus::router::{CommandRouter, TxSource};
use lockstep::consensus::state::{ConsensusConfig, ConsensusCore, ConsensusDeps};
use lockstep::consensus::timer::TimeoutScheduler;
use lockstep::crypto::ed25519::{generate_keypair, LocalSigner};
use lockstep::crypto::merkle::merkle_root;
use lockstep::consensus::round_state::ChainState;
use lockstep::eventbus::{BusEvent, EventBus};
use lockstep::storage::wal::Wal;
use lockstep::storage::{BlockStore, StateStore};
use lockstep::types::{Validator, ValidatorId, ValidatorSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FixedTxs;

impl TxSource for FixedTxs {
    fn reap(&mut self, _max_bytes: u64, _max_txs: u32) -> Vec<Vec<u8>> {
        vec![b"k=v".to_vec()]
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_commits_blocks_end_to_end() {
    let dir = tempfile::tempdir().unwrap();

    // Identity and genesis.
    let (signing_key, verify_key) = generate_keypair();
    let my_id = ValidatorId(verify_key.to_bytes());
    let validators = ValidatorSet::new(vec![Validator {
        id: my_id,
        voting_power: 1,
        proposer_priority: 0,
    }])
    .unwrap();
    let chain = ChainState::genesis("e2e-chain", validators);

    // Application and stores.
    let app: Arc<Mutex<dyn Application>> = Arc::new(Mutex::new(KvApp::new()));
    let block_store = Arc::new(BlockStore::open(&dir.path().join("blocks")).unwrap());
    let state_store = Arc::new(StateStore::open(&dir.path().join("state")).unwrap());
    let executor = BlockExecutor::new(
        chain.clone(),
        AppConn::InProcess(app.clone()),
        block_store.clone(),
        state_store.clone(),
    );

    // Wiring.
    let (tx_ev, rx_ev) = bounded::<ConsensusEvent>(1024);
    let (tx_cmd, rx_cmd) = bounded::<ConsensusCommand>(1024);
    let bus = Arc::new(EventBus::new());
    let bus_rx = bus.subscribe("e2e", 1024);

    let (scheduler, timer_handle) = TimeoutScheduler::new(tx_ev.clone());
    tokio::spawn(scheduler.run());

    let router = CommandRouter::new(
        rx_cmd,
        tx_ev.clone(),
        timer_handle.tx.clone(),
        None,
        None,
        None,
        Box::new(FixedTxs),
        executor,
        None,
    );
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || runtime.block_on(router.run()));

    let mut deps = ConsensusDeps::ed25519("e2e-chain".to_string());
    let deps_app = app.clone();
    deps.process_proposal = Box::new(move |block| {
        let mut guard = deps_app.lock().unwrap_or_else(|p| p.into_inner());
        guard.process_proposal(block)
    });

    let wal = Wal::open(dir.path().join("cs.wal"), u64::MAX).unwrap();
    let core = ConsensusCore::new(
        ConsensusConfig::default(),
        deps,
        Some(Box::new(LocalSigner::new(signing_key))),
        chain,
        Some(wal),
        bus.clone(),
        None,
        rx_ev,
        tx_cmd,
    );
    std::thread::spawn(move || core.run());

    // Watch the bus until three blocks have committed.
    let collector = std::thread::spawn(move || {
        let mut committed = Vec::new();
        while committed.len() < 3 {
            match bus_rx.recv_timeout(Duration::from_secs(20)) {
                Ok(BusEvent::NewBlock { height, block_id }) => committed.push((height, block_id)),
                Ok(_) => {}
                Err(e) => panic!("timed out waiting for blocks: {e}"),
            }
        }
        committed
    });
    let committed = collector.join().unwrap();

    assert_eq!(
        committed.iter().map(|(h, _)| *h).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // Persistence agrees with what the bus announced.
    assert!(block_store.last_height().unwrap() >= 3);
    let stored = block_store.load_block(1).unwrap().expect("block 1 stored");
    assert_eq!(stored.header.height, 1);
    assert_eq!(stored.txs, vec![b"k=v".to_vec()]);
    assert_eq!(stored.header.tx_merkle_root, merkle_root(&stored.txs));

    let commit = block_store.load_commit(2).unwrap().expect("commit 2 stored");
    assert_eq!(commit.height, 2);
    assert_eq!(commit.block_id, committed[1].1);

    let state = state_store
        .load_latest_state()
        .unwrap()
        .expect("state persisted");
    assert!(state.height >= 4);

    // The application really executed the transactions: a non-zero app
    // hash only comes out of `commit` after delivered txs.
    assert_ne!(state.last_app_hash, lockstep::types::Hash::ZERO);
    let info = {
        let mut guard = app.lock().unwrap();
        guard.info()
    };
    assert!(info.last_height >= 3);

    // Drop the inbound queue so the core thread can wind down.
    drop(tx_ev);
}
