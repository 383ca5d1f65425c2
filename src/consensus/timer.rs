use crate::consensus::events::{ConsensusEvent, TimeoutInfo};
use crossbeam_channel::Sender;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

/// Single timeout-scheduler task. At most one timer is armed at a time: a
/// new request supersedes the pending one, which is correct because steps
/// only move forward and the core ignores fires for states it has left.
pub struct TimeoutScheduler {
    rx: mpsc::Receiver<TimeoutInfo>,
    to_consensus: Sender<ConsensusEvent>,
}

pub struct TimeoutSchedulerHandle {
    pub tx: mpsc::Sender<TimeoutInfo>,
}

impl TimeoutScheduler {
    pub fn new(to_consensus: Sender<ConsensusEvent>) -> (Self, TimeoutSchedulerHandle) {
        let (tx, rx) = mpsc::channel(256);
        (Self { rx, to_consensus }, TimeoutSchedulerHandle { tx })
    }

    /// Runs until the handle side is dropped (cancellation cascades through
    /// channel closure).
    pub async fn run(mut self) {
        let mut pending: Option<(TimeoutInfo, Instant)> = None;

        loop {
            match pending {
                Some((info, deadline)) => {
                    tokio::select! {
                        req = self.rx.recv() => match req {
                            Some(next) => {
                                debug!(height = next.height, round = next.round, step = %next.step,
                                    "superseding pending timeout");
                                pending = Some((next, Instant::now() + Duration::from_millis(next.duration_ms)));
                            }
                            None => return,
                        },
                        _ = sleep_until(deadline) => {
                            pending = None;
                            if self.to_consensus.send(ConsensusEvent::Timeout(info)).is_err() {
                                return;
                            }
                        }
                    }
                }
                None => match self.rx.recv().await {
                    Some(next) => {
                        pending =
                            Some((next, Instant::now() + Duration::from_millis(next.duration_ms)));
                    }
                    None => return,
                },
            }
        }
    }
}
