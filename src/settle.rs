//! One-time settlement of in-flight loads.
//!
//! Every load attempt gets a fresh attempt number. Only the holder of the
//! current attempt can settle a slot, so an event from a superseded attempt
//! (a response arriving after its timeout, say) is recognized as stale and
//! dropped instead of settling the slot twice or settling a retry.

use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::LoadError;
use crate::types::LoadState;

pub(crate) type Settlement = oneshot::Receiver<Result<(), LoadError>>;

/// An in-flight load: its attempt number, waiters in registration order,
/// and the timer that will fail it.
pub(crate) struct Pending {
    attempt: u64,
    waiters: Vec<oneshot::Sender<Result<(), LoadError>>>,
    timer: Option<AbortHandle>,
}

impl Pending {
    /// Notify every waiter, in the order they joined. Returns how many were waiting.
    pub(crate) fn settle(self, result: Result<(), LoadError>) -> usize {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let count = self.waiters.len();
        for waiter in self.waiters {
            // A waiter that stopped listening is not an error.
            let _ = waiter.send(result.clone());
        }
        count
    }
}

enum Slot {
    Loading(Pending),
    Loaded,
}

pub(crate) enum Join {
    /// Already loaded; nothing to wait for.
    Ready,
    /// Joined a load that is already in flight.
    Wait(Settlement),
    /// No load was in flight; the caller must start attempt `attempt`.
    Start { attempt: u64, settlement: Settlement },
}

pub(crate) struct SlotTable<K> {
    slots: HashMap<K, Slot>,
    next_attempt: u64,
}

impl<K: Eq + Hash + Clone> SlotTable<K> {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_attempt: 1,
        }
    }

    pub(crate) fn state(&self, key: &K) -> LoadState {
        match self.slots.get(key) {
            None => LoadState::NotRequested,
            Some(Slot::Loading(_)) => LoadState::Loading,
            Some(Slot::Loaded) => LoadState::Loaded,
        }
    }

    pub(crate) fn is_current(&self, key: &K, attempt: u64) -> bool {
        matches!(self.slots.get(key), Some(Slot::Loading(p)) if p.attempt == attempt)
    }

    pub(crate) fn join(&mut self, key: K) -> Join {
        let (sender, settlement) = oneshot::channel();
        match self.slots.get_mut(&key) {
            Some(Slot::Loaded) => Join::Ready,
            Some(Slot::Loading(pending)) => {
                pending.waiters.push(sender);
                Join::Wait(settlement)
            }
            None => {
                let attempt = self.next_attempt;
                self.next_attempt += 1;
                self.slots.insert(
                    key,
                    Slot::Loading(Pending {
                        attempt,
                        waiters: vec![sender],
                        timer: None,
                    }),
                );
                Join::Start {
                    attempt,
                    settlement,
                }
            }
        }
    }

    /// Attach the timeout timer to a current attempt. Returns `false` when
    /// the attempt already settled, in which case the caller cancels the timer.
    pub(crate) fn arm(&mut self, key: &K, attempt: u64, timer: AbortHandle) -> bool {
        match self.slots.get_mut(key) {
            Some(Slot::Loading(pending)) if pending.attempt == attempt => {
                pending.timer = Some(timer);
                true
            }
            _ => false,
        }
    }

    /// Commit attempt `attempt` to finishing: its timer is cancelled so no
    /// timeout can supersede it. `false` if the attempt is already stale.
    pub(crate) fn commit(&mut self, key: &K, attempt: u64) -> bool {
        match self.slots.get_mut(key) {
            Some(Slot::Loading(pending)) if pending.attempt == attempt => {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Settle attempt `attempt` successfully. `None` if it is stale.
    pub(crate) fn complete(&mut self, key: &K, attempt: u64) -> Option<Pending> {
        if !self.is_current(key, attempt) {
            return None;
        }
        match self.slots.insert(key.clone(), Slot::Loaded) {
            Some(Slot::Loading(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Settle attempt `attempt` as failed, clearing the slot so a later
    /// request starts over. `None` if it is stale.
    pub(crate) fn fail(&mut self, key: &K, attempt: u64) -> Option<Pending> {
        if !self.is_current(key, attempt) {
            return None;
        }
        match self.slots.remove(key) {
            Some(Slot::Loading(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Mark a slot loaded regardless of attempt, as a registration does.
    /// Returns the pending load it completed, if any.
    pub(crate) fn mark_loaded(&mut self, key: K) -> Option<Pending> {
        match self.slots.insert(key, Slot::Loaded) {
            Some(Slot::Loading(pending)) => Some(pending),
            _ => None,
        }
    }
}
