//! Typed pub/sub between the consensus core and its observers (tests, RPC).
//!
//! Publishing never blocks: each subscriber gets a bounded mailbox, and a
//! subscriber that lets its mailbox fill is dropped rather than allowed to
//! stall the state machine.

use crate::consensus::round_state::Step;
use crate::metrics::Metrics;
use crate::types::{BlockHeader, BlockId, SignedVote};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Clone, Debug)]
pub enum BusEvent {
    NewRound {
        height: u64,
        round: u32,
    },
    CompleteProposal {
        height: u64,
        round: u32,
        block_id: BlockId,
    },
    Vote(SignedVote),
    ValidBlock {
        height: u64,
        round: u32,
        block_id: BlockId,
    },
    Unlock {
        height: u64,
        round: u32,
    },
    Relock {
        height: u64,
        round: u32,
        block_id: BlockId,
    },
    TimeoutPropose {
        height: u64,
        round: u32,
    },
    TimeoutWait {
        height: u64,
        round: u32,
        step: Step,
    },
    NewBlock {
        height: u64,
        block_id: BlockId,
    },
    NewBlockHeader(BlockHeader),
}

struct Subscriber {
    name: String,
    tx: Sender<BusEvent>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    metrics: Option<Arc<Metrics>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self, name: impl Into<String>, capacity: usize) -> Receiver<BusEvent> {
        let (tx, rx) = bounded(capacity);
        self.subscribers.lock().unwrap().push(Subscriber {
            name: name.into(),
            tx,
        });
        rx
    }

    pub fn unsubscribe(&self, name: &str) {
        self.subscribers.lock().unwrap().retain(|s| s.name != name);
    }

    pub fn publish(&self, event: &BusEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %s.name, "dropping slow event subscriber");
                if let Some(m) = &self.metrics {
                    m.eventbus_subscribers_dropped.inc();
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let rx = bus.subscribe("test", 4);
        bus.publish(&BusEvent::NewRound {
            height: 1,
            round: 0,
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::NewRound {
                height: 1,
                round: 0
            }
        ));
    }

    #[test]
    fn slow_subscriber_is_dropped_not_blocked() {
        let bus = EventBus::new();
        let _rx = bus.subscribe("slow", 1);
        bus.publish(&BusEvent::NewRound {
            height: 1,
            round: 0,
        });
        // Mailbox now full; the next publish evicts instead of blocking.
        bus.publish(&BusEvent::NewRound {
            height: 1,
            round: 1,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn disconnected_subscriber_is_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe("gone", 4));
        bus.publish(&BusEvent::NewRound {
            height: 1,
            round: 0,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
