//! Per-channel receive buffering
//!
//! One mailbox per endpoint holds a bounded queue for every `(source, tag)`
//! pair, guarded by a mutex and a pair of condition variables. This is the
//! only mutable shared state inside a rank: delivery serializes per tag,
//! out-of-order arrivals across distinct channels buffer independently, and
//! FIFO order holds within each channel.
//!
//! Failure state lives here too: a peer can be marked failed with a
//! root-cause rank, and the whole run can be marked aborted. Either wakes
//! every blocked sender and receiver so nobody waits on a dead peer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::errors::{LatticeError, Result};
use crate::topology::Rank;
use crate::transport::Tag;

pub(crate) struct Mailbox {
    owner: Rank,
    capacity: usize,
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

struct State {
    queues: HashMap<(Rank, Tag), VecDeque<Vec<u8>>>,
    /// Failed peers, each mapped to the root-cause rank of its failure.
    failed: HashMap<Rank, Rank>,
    /// Set once the run as a whole is aborted; holds the origin rank.
    aborted: Option<Rank>,
}

impl Mailbox {
    pub fn new(owner: Rank, capacity: usize) -> Self {
        Self {
            owner,
            capacity,
            state: Mutex::new(State {
                queues: HashMap::new(),
                failed: HashMap::new(),
                aborted: None,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another thread panicked while holding
        // it; the queue contents are still structurally sound.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a payload into the `(source, tag)` queue, blocking while the
    /// queue is at capacity.
    pub fn push(&self, source: Rank, tag: Tag, payload: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        loop {
            if let Some(origin) = state.aborted {
                return Err(run_aborted(origin));
            }
            if let Some(&root) = state.failed.get(&self.owner) {
                return Err(peer_failed(self.owner, root));
            }
            if let Some(&root) = state.failed.get(&source) {
                return Err(peer_failed(source, root));
            }

            let queue = state.queues.entry((source, tag)).or_default();
            if queue.len() < self.capacity {
                queue.push_back(payload);
                self.readable.notify_all();
                return Ok(());
            }

            state = self
                .writable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Take the next payload from the `(source, tag)` queue, blocking until
    /// one arrives. Buffered messages are drained before failure state is
    /// reported, so anything accepted before a failure is still delivered.
    pub fn pop(&self, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        let mut state = self.lock();
        loop {
            if let Some(queue) = state.queues.get_mut(&(source, tag)) {
                if let Some(payload) = queue.pop_front() {
                    self.writable.notify_all();
                    return Ok(payload);
                }
            }
            if let Some(origin) = state.aborted {
                return Err(run_aborted(origin));
            }
            if let Some(&root) = state.failed.get(&source) {
                return Err(peer_failed(source, root));
            }

            state = self
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Record a peer failure with its root cause and wake all waiters.
    /// The first recorded cause for a peer wins.
    pub fn fail(&self, peer: Rank, root: Rank) {
        let mut state = self.lock();
        state.failed.entry(peer).or_insert(root);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Mark the whole run aborted with an origin rank and wake all waiters.
    /// The first origin wins; later aborts are no-ops.
    pub fn abort_run(&self, origin: Rank) {
        let mut state = self.lock();
        if state.aborted.is_none() {
            state.aborted = Some(origin);
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

fn peer_failed(peer: Rank, root: Rank) -> LatticeError {
    LatticeError::Transport {
        peer: root,
        reason: if peer == root {
            "peer unreachable".to_string()
        } else {
            format!("peer {} lost to upstream failure", peer)
        },
    }
}

fn run_aborted(origin: Rank) -> LatticeError {
    LatticeError::Transport {
        peer: origin,
        reason: "run aborted".to_string(),
    }
}
