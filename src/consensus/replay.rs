//! Re-driving the state machine from its write-ahead log.
//!
//! Two consumers share this path: crash recovery (the node replays the WAL
//! tail after the handshake, before accepting live input) and the replay
//! tool (`replay <wal-file>`, optionally with an interactive console).
//!
//! The machine is stepped synchronously: one recorded message in, then any
//! finalize work it triggered is executed before the next message. Replay
//! mode suppresses signing, timers, and gossip, so the recorded messages
//! alone determine every transition.

use crate::consensus::events::{ConsensusCommand, ConsensusEvent};
use crate::consensus::executor::{BlockExecutor, ExecutorError};
use crate::consensus::round_state::ChainState;
use crate::consensus::state::{ConsensusConfig, ConsensusCore, ConsensusDeps};
use crate::eventbus::EventBus;
use crate::storage::wal::{read_all, seek_after_end_height, WalMessage, WalPayload, WalRecord};
use crossbeam_channel::{bounded, Receiver};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("executor: {0}")]
    Executor(#[from] ExecutorError),
    #[error("wal: {0}")]
    Wal(#[from] crate::storage::wal::WalError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

fn event_for(msg: WalMessage) -> ConsensusEvent {
    match msg {
        WalMessage::Proposal(proposal) => ConsensusEvent::Proposal {
            proposal,
            peer: None,
        },
        WalMessage::BlockPart {
            height,
            round,
            part,
        } => ConsensusEvent::BlockPart {
            height,
            round,
            part,
            peer: None,
        },
        WalMessage::Vote(vote) => ConsensusEvent::Vote { vote, peer: None },
        WalMessage::Timeout(t) => ConsensusEvent::Timeout(t),
    }
}

/// Applies recorded messages to a core and services the finalize commands
/// they produce, synchronously.
pub struct ReplayDriver {
    executor: BlockExecutor,
    rx_cmd: Receiver<ConsensusCommand>,
}

impl ReplayDriver {
    pub fn new(executor: BlockExecutor, rx_cmd: Receiver<ConsensusCommand>) -> Self {
        Self { executor, rx_cmd }
    }

    pub fn into_executor(self) -> BlockExecutor {
        self.executor
    }

    /// Hand the executor and the command receiver back to the live router
    /// once the tail is consumed.
    pub fn into_parts(self) -> (BlockExecutor, Receiver<ConsensusCommand>) {
        (self.executor, self.rx_cmd)
    }

    pub async fn apply(
        &mut self,
        core: &mut ConsensusCore,
        record: &WalRecord,
    ) -> Result<(), ReplayError> {
        match &record.payload {
            WalPayload::EndHeight(_) => Ok(()),
            WalPayload::Message(msg) => {
                core.process_event(event_for(msg.clone()));
                self.drain(core).await
            }
        }
    }

    async fn drain(&mut self, core: &mut ConsensusCore) -> Result<(), ReplayError> {
        while let Ok(cmd) = self.rx_cmd.try_recv() {
            if let ConsensusCommand::FinalizeBlock { block, commit } = cmd {
                let result = self.executor.finalize(&block, &commit, Vec::new()).await?;
                core.process_event(ConsensusEvent::BlockFinalized {
                    height: block.header.height,
                    app_hash: result.app_hash,
                    validator_updates: result.validator_updates,
                    param_updates: result.param_updates,
                });
            }
            // Everything else a live router would handle is suppressed in
            // replay mode; ignore stragglers.
        }
        Ok(())
    }
}

/// Crash recovery: feed the WAL tail (everything after the last
/// `EndHeight` for the height preceding `chain.height`) into the core.
/// Returns how many records were applied.
pub async fn replay_wal_tail(
    core: &mut ConsensusCore,
    driver: &mut ReplayDriver,
    wal_path: &Path,
) -> Result<usize, ReplayError> {
    let records = read_all(wal_path)?;
    let committed = core.chain_state().height - 1;
    let start = seek_after_end_height(&records, committed);
    let tail = &records[start..];

    info!(
        records = records.len(),
        tail = tail.len(),
        committed,
        "replaying WAL tail"
    );

    core.start_for_replay();
    for record in tail {
        driver.apply(core, record).await?;
    }
    core.set_replay(false);
    Ok(tail.len())
}

/// Everything the replay tool needs to rebuild the machine from its
/// starting point (the `back` command requires rebuilding, because the
/// state machine cannot step backwards).
pub struct ReplaySetup {
    pub cfg: ConsensusConfig,
    pub chain: ChainState,
    pub deps_factory: Box<dyn Fn() -> ConsensusDeps>,
}

struct Playback {
    core: ConsensusCore,
    driver: ReplayDriver,
    records: Vec<WalRecord>,
    /// Next record to apply.
    pos: usize,
    /// Messages applied since the start of the session.
    count: usize,
    setup: ReplaySetup,
    bus: Arc<EventBus>,
}

impl Playback {
    fn new(setup: ReplaySetup, executor: BlockExecutor, records: Vec<WalRecord>) -> Playback {
        let bus = Arc::new(EventBus::new());
        let (core, driver) = Playback::build_core(&setup, executor, bus.clone());
        Playback {
            core,
            driver,
            records,
            pos: 0,
            count: 0,
            setup,
            bus,
        }
    }

    fn build_core(
        setup: &ReplaySetup,
        executor: BlockExecutor,
        bus: Arc<EventBus>,
    ) -> (ConsensusCore, ReplayDriver) {
        let (_tx_ev, rx_ev) = bounded::<ConsensusEvent>(1);
        let (tx_cmd, rx_cmd) = bounded::<ConsensusCommand>(4096);
        let mut core = ConsensusCore::new(
            setup.cfg.clone(),
            (setup.deps_factory)(),
            None,
            setup.chain.clone(),
            None,
            bus,
            None,
            rx_ev,
            tx_cmd,
        );
        core.start_for_replay();
        (core, ReplayDriver::new(executor, rx_cmd))
    }

    async fn apply_next(&mut self) -> Result<bool, ReplayError> {
        let Some(record) = self.records.get(self.pos) else {
            return Ok(false); // clean EOF
        };
        let record = record.clone();
        self.driver.apply(&mut self.core, &record).await?;
        self.pos += 1;
        if matches!(record.payload, WalPayload::Message(_)) {
            self.count += 1;
        }
        Ok(true)
    }
}

/// `back N`: rebuild the machine from the session's starting state and
/// re-apply `count - N` messages. The deterministic application converges
/// to the same state when re-driven from scratch. `back` requires the live
/// node to be stopped; the console owns the stores while it runs.
async fn reset_playback(pb: Playback, back_count: usize) -> Result<Playback, ReplayError> {
    let target = pb.count.saturating_sub(back_count);
    println!("Resetting from {} to {}", pb.count, target);

    let Playback {
        driver,
        records,
        setup,
        bus,
        ..
    } = pb;
    let executor = driver.into_executor().reset_chain(setup.chain.clone());
    let (core, driver) = Playback::build_core(&setup, executor, bus.clone());
    let mut pb = Playback {
        core,
        driver,
        records,
        pos: 0,
        count: 0,
        setup,
        bus,
    };
    for _ in 0..target {
        if !pb.apply_next().await? {
            break;
        }
    }
    Ok(pb)
}

/// Run through a WAL file, optionally under the interactive console.
/// Returns when the file is exhausted (exit code 0 at the caller) or an
/// error surfaces.
pub async fn run_replay_file(
    setup: ReplaySetup,
    executor: BlockExecutor,
    wal_path: &Path,
    console: bool,
) -> Result<(), ReplayError> {
    let records = read_all(wal_path)?;
    info!(records = records.len(), path = %wal_path.display(), "replaying WAL file");

    let mut pb = Playback::new(setup, executor, records);

    if !console {
        while pb.apply_next().await? {}
        return Ok(());
    }

    let stdin = std::io::stdin();
    let mut next_n = 0usize;
    loop {
        if next_n == 0 {
            match console_prompt(&pb, &stdin)? {
                ConsoleAction::Apply(n) => next_n = n,
                ConsoleAction::Back(n) => {
                    pb = reset_playback(pb, n).await?;
                    continue;
                }
                ConsoleAction::Quit => return Ok(()),
            }
        }
        if !pb.apply_next().await? {
            println!("done: reached end of WAL");
            return Ok(());
        }
        next_n = next_n.saturating_sub(1);
    }
}

enum ConsoleAction {
    /// Apply this many messages before prompting again (1 for plain `next`).
    Apply(usize),
    Back(usize),
    Quit,
}

fn console_prompt(pb: &Playback, stdin: &std::io::Stdin) -> Result<ConsoleAction, ReplayError> {
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(ConsoleAction::Quit); // stdin closed
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => continue,
            ["next"] => return Ok(ConsoleAction::Apply(1)),
            ["next", n] => match n.parse::<usize>() {
                Ok(n) => return Ok(ConsoleAction::Apply(n)),
                Err(_) => println!("next takes an integer argument"),
            },
            ["back"] => return Ok(ConsoleAction::Back(1)),
            ["back", n] => match n.parse::<usize>() {
                Ok(n) if n > pb.count => println!(
                    "argument to back must not be larger than the current count ({})",
                    pb.count
                ),
                Ok(n) => return Ok(ConsoleAction::Back(n)),
                Err(_) => println!("back takes an integer argument"),
            },
            ["rs"] => println!("{}", pb.core.round_state().summary()),
            ["rs", field] => print_round_state_field(pb, field),
            ["n"] => println!("{}", pb.count),
            ["quit"] | ["q"] => return Ok(ConsoleAction::Quit),
            [cmd, ..] => println!("unknown command {:?}", cmd),
        }
    }
}

fn print_round_state_field(pb: &Playback, field: &str) {
    let summary = pb.core.round_state().summary();
    match field {
        "short" => println!("{}/{}/{}", summary.height, summary.round, summary.step),
        "validators" => {
            for (id, power) in &summary.validators {
                println!("{:?} power={}", id, power);
            }
        }
        "proposal" => match &summary.proposal {
            Some(p) => println!("{} pol_round={}", p.block_id, p.pol_round),
            None => println!("<none>"),
        },
        "proposal_block" => match (summary.proposal_block_hash, summary.proposal_parts) {
            (Some(hash), Some((have, total))) => {
                println!("{} parts {}/{}", hash, have, total)
            }
            (Some(hash), None) => println!("{}", hash),
            _ => println!("<none>"),
        },
        "locked_round" => println!("{}", summary.locked_round),
        "locked_block" => match summary.locked_block_hash {
            Some(hash) => println!("{}", hash),
            None => println!("<nil>"),
        },
        "votes" => {
            for line in &summary.vote_lines {
                println!("{}", line);
            }
        }
        other => println!("unknown option {:?}", other),
    }
}
