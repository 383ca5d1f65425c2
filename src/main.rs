use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use tracing::{error, info};

use lockstep::app::{AppConns, Application, KvApp};
use lockstep::config::NodeConfig;
use lockstep::consensus::{
    replay_wal_tail, run_replay_file, BlockExecutor, ChainState, CommandRouter, ConsensusCommand,
    ConsensusCore, ConsensusDeps, ConsensusEvent, EmptyTxSource, Handshaker, ReplayDriver,
    ReplaySetup, TimeoutScheduler,
};
use lockstep::crypto::ed25519::load_or_generate_keypair;
use lockstep::crypto::LocalSigner;
use lockstep::eventbus::EventBus;
use lockstep::metrics::{Metrics, MetricsServer};
use lockstep::service::Service;
use lockstep::storage::wal::Wal;
use lockstep::storage::{BlockStore, StateStore};
use lockstep::types::{Validator, ValidatorId, ValidatorSet};

#[derive(Parser)]
#[command(name = "lockstep", about = "Tendermint-style BFT state machine node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node.
    Node {
        /// Path to the TOML configuration file.
        #[arg(default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Replay a consensus WAL file through the state machine.
    Replay {
        /// WAL file to replay.
        wal_file: PathBuf,
        /// Drop into the interactive playback console.
        #[arg(long)]
        console: bool,
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config/node.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Node { config } => run_node(&config).await,
        Command::Replay {
            wal_file,
            console,
            config,
        } => run_replay(&config, &wal_file, console).await,
    }
}

/// Shared bootstrap: keys, stores, application connections, and the chain
/// state (persisted if present, otherwise a single-validator genesis).
struct Bootstrap {
    cfg: NodeConfig,
    signer: LocalSigner,
    my_id: ValidatorId,
    block_store: Arc<BlockStore>,
    state_store: Arc<StateStore>,
    conns: AppConns,
    app: Option<Arc<Mutex<dyn Application>>>,
    state: ChainState,
}

async fn bootstrap(config_path: &Path) -> anyhow::Result<Bootstrap> {
    let cfg = NodeConfig::load_or_default(config_path);
    init_logging(&cfg.logging);

    info!(
        config_path = %config_path.display(),
        chain_id = %cfg.node.chain_id,
        "loading configuration"
    );

    let key_path = Path::new(&cfg.node.data_dir).join("node_key");
    let (signing_key, verify_key) = load_or_generate_keypair(&key_path)?;
    let signer = LocalSigner::new(signing_key);
    let my_id = ValidatorId(verify_key.to_bytes());

    let data_dir = Path::new(&cfg.node.data_dir);
    let block_store = Arc::new(BlockStore::open(&data_dir.join("blocks"))?);
    let state_store = Arc::new(StateStore::open(&data_dir.join("state"))?);

    let (conns, app): (AppConns, Option<Arc<Mutex<dyn Application>>>) =
        if cfg.app.mode == "socket" {
            info!(addr = %cfg.app.addr, "connecting to external application");
            (AppConns::connect(&cfg.app.addr).await?, None)
        } else {
            let app: Arc<Mutex<dyn Application>> = Arc::new(Mutex::new(KvApp::new()));
            (AppConns::in_process(app.clone()), Some(app))
        };

    let state = match state_store.load_latest_state()? {
        Some(state) => {
            info!(height = state.height, "resuming from persisted state");
            state
        }
        None => {
            let validators = ValidatorSet::new(vec![Validator {
                id: my_id,
                voting_power: 1,
                proposer_priority: 0,
            }])?;
            info!("no persisted state; starting single-validator genesis");
            ChainState::genesis(cfg.node.chain_id.clone(), validators)
        }
    };

    Ok(Bootstrap {
        cfg,
        signer,
        my_id,
        block_store,
        state_store,
        conns,
        app,
        state,
    })
}

fn consensus_deps(chain_id: &str, app: Option<Arc<Mutex<dyn Application>>>) -> ConsensusDeps {
    let mut deps = ConsensusDeps::ed25519(chain_id.to_string());
    if let Some(app) = app {
        deps.process_proposal = Box::new(move |block| {
            let mut guard = app.lock().unwrap_or_else(|p| p.into_inner());
            guard.process_proposal(block)
        });
    }
    deps
}

async fn run_node(config_path: &Path) -> anyhow::Result<()> {
    let boot = bootstrap(config_path).await?;
    let cfg = boot.cfg.clone();

    // Metrics exporter.
    let metrics = Arc::new(Metrics::new());
    if cfg.observability.metrics_enabled {
        let server =
            MetricsServer::new(cfg.observability.metrics_listen_addr.clone(), metrics.clone());
        info!(addr = %cfg.observability.metrics_listen_addr, "starting metrics exporter");
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    // Handshake: reconcile app height with the stores before anything else.
    let mut executor = BlockExecutor::new(
        boot.state.clone(),
        boot.conns.consensus,
        boot.block_store.clone(),
        boot.state_store.clone(),
    );
    let chain = Handshaker::new(&boot.block_store)
        .handshake(&mut executor)
        .await?;
    info!(height = chain.height, "handshake complete");

    // Channels between the core and the async shell.
    let (tx_ev, rx_ev) = bounded::<ConsensusEvent>(1024);
    let (tx_cmd, rx_cmd) = bounded::<ConsensusCommand>(1024);
    let bus = Arc::new(EventBus::new().with_metrics(metrics.clone()));

    let wal =
        Wal::open(cfg.wal_path(), cfg.wal.max_file_size_bytes)?.with_metrics(metrics.clone());
    let deps = consensus_deps(&cfg.node.chain_id, boot.app.clone());

    let mut core = ConsensusCore::new(
        cfg.consensus_config(),
        deps,
        Some(Box::new(boot.signer)),
        chain,
        Some(wal),
        bus.clone(),
        Some(metrics.clone()),
        rx_ev,
        tx_cmd,
    );

    // Replay the WAL tail through the core before going live.
    let mut driver = ReplayDriver::new(executor, rx_cmd);
    let replayed = replay_wal_tail(&mut core, &mut driver, &cfg.wal_path()).await?;
    if replayed > 0 {
        info!(records = replayed, "WAL tail replayed");
    }
    let (executor, rx_cmd) = driver.into_parts();

    // Timeout scheduler.
    let (scheduler, timer_handle) = TimeoutScheduler::new(tx_ev.clone());
    tokio::spawn(scheduler.run());

    // Command router: blocks on the command channel, so it gets a blocking
    // thread of its own.
    let router = CommandRouter::new(
        rx_cmd,
        tx_ev.clone(),
        timer_handle.tx.clone(),
        None, // gossip transport is wired in by the p2p layer
        None,
        None,
        Box::new(EmptyTxSource),
        executor,
        Some(metrics),
    );
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || runtime.block_on(router.run()));

    // Consensus core on its own OS thread.
    let consensus_service = Arc::new(Service::new("consensus"));
    let _cancel = consensus_service
        .start()
        .map_err(|e| anyhow::anyhow!("consensus service: {e}"))?;
    let thread_service = consensus_service.clone();
    std::thread::spawn(move || {
        core.run();
        thread_service.finished();
    });

    info!(node_id = ?boot.my_id, "node started");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown initiated; draining queues and flushing the WAL");
    let _ = consensus_service.stop();
    drop(tx_ev);
    // The router and scheduler hold event senders of their own, so give the
    // core a bounded window to drain before the process exit reaps it.
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        consensus_service.wait(),
    )
    .await;
    info!("node stopped");
    Ok(())
}

async fn run_replay(config_path: &Path, wal_file: &Path, console: bool) -> anyhow::Result<()> {
    let boot = bootstrap(config_path).await?;

    let mut executor = BlockExecutor::new(
        boot.state.clone(),
        boot.conns.consensus,
        boot.block_store.clone(),
        boot.state_store.clone(),
    );
    let chain = Handshaker::new(&boot.block_store)
        .handshake(&mut executor)
        .await?;

    let chain_id = boot.cfg.node.chain_id.clone();
    let app = boot.app.clone();
    let setup = ReplaySetup {
        cfg: boot.cfg.consensus_config(),
        chain,
        deps_factory: Box::new(move || consensus_deps(&chain_id, app.clone())),
    };

    run_replay_file(setup, executor, wal_file, console).await?;
    Ok(())
}

fn init_logging(cfg: &lockstep::config::LoggingSection) {
    use tracing_subscriber::EnvFilter;

    let env_filter = if let Some(ref module_levels) = cfg.module_levels {
        EnvFilter::try_new(module_levels).unwrap_or_else(|_| EnvFilter::new(&cfg.level))
    } else {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new(&cfg.level))
    };

    if cfg.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
