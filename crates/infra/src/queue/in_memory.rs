//! In-memory task queue with lease tracking, for tests and single-process
//! development.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use finsight_core::DispatchMessage;

use super::{Delivery, QueueError, TaskQueue};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    message: DispatchMessage,
    redeliveries: u32,
}

#[derive(Debug)]
struct Leased {
    entry: Entry,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    next_receipt: u64,
    ready: VecDeque<Entry>,
    leased: HashMap<u64, Leased>,
}

/// Lease-aware in-memory queue.
///
/// Delivery semantics mirror the durable implementation: a dequeued entry is
/// leased to its consumer; if the lease lapses without an ack the entry is
/// requeued with its redelivery count incremented.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    lease: Duration,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            lease,
        }
    }

    /// Pop the next ready entry, requeueing expired leases first. Returns the
    /// delivery (if any) and the earliest upcoming lease expiry, which the
    /// caller uses to bound its wait.
    fn try_pop(&self) -> (Option<Delivery>, Option<Instant>) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let expired: Vec<u64> = state
            .leased
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            let mut lapsed = state.leased.remove(&receipt).unwrap();
            lapsed.entry.redeliveries += 1;
            state.ready.push_front(lapsed.entry);
        }

        if let Some(entry) = state.ready.pop_front() {
            let receipt = state.next_receipt;
            state.next_receipt += 1;

            let delivery = Delivery {
                message: entry.message.clone(),
                receipt: receipt.to_string(),
                redeliveries: entry.redeliveries,
            };
            state.leased.insert(
                receipt,
                Leased {
                    entry,
                    expires_at: now + self.lease,
                },
            );
            return (Some(delivery), None);
        }

        let next_expiry = state.leased.values().map(|l| l.expires_at).min();
        (None, next_expiry)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, message: &DispatchMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.ready.push_back(Entry {
            message: message.clone(),
            redeliveries: 0,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let (delivery, next_expiry) = self.try_pop();
            if delivery.is_some() {
                return Ok(delivery);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Sleep until an enqueue, the nearest lease expiry, or the
            // caller's deadline, whichever comes first.
            let mut sleep_for = deadline - now;
            if let Some(expiry) = next_expiry {
                sleep_for = sleep_for.min(expiry.saturating_duration_since(now));
            }
            let _ = tokio::time::timeout(sleep_for, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let receipt: u64 = delivery
            .receipt
            .parse()
            .map_err(|e| QueueError::Codec(format!("bad receipt {}: {e}", delivery.receipt)))?;
        self.state.lock().unwrap().leased.remove(&receipt);
        Ok(())
    }
}
