//! Collective communication over a group
//!
//! Four primitives composed from point-to-point messaging, each a
//! synchronous barrier over one [`Group`]: no member completes until every
//! member has received its result.
//!
//! - [`Communicator::global_sum`] — element-wise sum on every member
//!   (ring or tree schedule, chosen by payload size)
//! - [`Communicator::gather_all`] — concatenation of all inputs, by rank
//! - [`Communicator::scatter_sum`] — the reduce-scatter half in isolation
//! - [`Communicator::peer_exchange`] — balanced all-to-all
//!
//! Every member must issue collective calls against the same group in the
//! same relative order; that obligation sits with the caller, and the run
//! deadlocks if it is violated, like in any message-passing system. Channel
//! tags are derived from the group identity and a per-communicator sequence
//! number, so identical issue order implies identical tags with no
//! negotiation.
//!
//! Completion is all-or-nothing. On any transport failure the collective
//! aborts the run, discards partially accumulated buffers, and every member
//! that can still be reached fails with the same originating peer. Calls
//! are at-most-once: re-issuing a partially completed reduction could
//! double-count, so nothing above the transport layer retries.

pub mod ring;
pub mod strategy;
pub mod tree;

pub use strategy::{ReduceStrategy, DEFAULT_RING_THRESHOLD};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::{LatticeError, Result};
use crate::topology::{Group, GroupKind};
use crate::transport::{wire, Tag, Transport};

/// The collective operations a group supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveOp {
    /// Reduce-then-broadcast: every member receives the element-wise sum.
    GlobalSum,
    /// Every member receives the rank-ordered concatenation of all inputs.
    GatherAll,
    /// Member `i` receives the element-wise sum of segment `i`.
    ScatterSum,
    /// Every ordered pair of members exchanges a buffer.
    PeerExchange,
    /// Zero-payload synchronization point.
    Barrier,
}

impl std::fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CollectiveOp::GlobalSum => "global_sum",
            CollectiveOp::GatherAll => "gather_all",
            CollectiveOp::ScatterSum => "scatter_sum",
            CollectiveOp::PeerExchange => "peer_exchange",
            CollectiveOp::Barrier => "barrier",
        };
        write!(f, "{}", name)
    }
}

/// Binds a [`Group`] to a shared [`Transport`] and runs collectives on it.
///
/// A rank holds one communicator per group it belongs to (one data-parallel,
/// one tensor-parallel), both over the same transport endpoint.
pub struct Communicator {
    group: Group,
    transport: Arc<dyn Transport>,
    sequence: AtomicU64,
    ring_threshold: usize,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("group", &self.group)
            .field("sequence", &self.sequence)
            .field("ring_threshold", &self.ring_threshold)
            .finish_non_exhaustive()
    }
}

impl Communicator {
    /// Create a communicator for this rank's position in `group`.
    pub fn new(group: Group, transport: Arc<dyn Transport>) -> Result<Self> {
        if group.is_empty() {
            return Err(LatticeError::Config(
                "cannot build a communicator over an empty group".into(),
            ));
        }
        if group.rank() != transport.rank() {
            return Err(LatticeError::Config(format!(
                "group position {} belongs to rank {}, but the transport endpoint is rank {}",
                group.position(),
                group.rank(),
                transport.rank()
            )));
        }
        Ok(Self {
            group,
            transport,
            sequence: AtomicU64::new(0),
            ring_threshold: DEFAULT_RING_THRESHOLD,
        })
    }

    /// Override the payload size at which `global_sum` switches from the
    /// tree to the ring schedule.
    pub fn with_ring_threshold(mut self, elements: usize) -> Self {
        self.ring_threshold = elements;
        self
    }

    /// The group this communicator operates over.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Element-wise sum of every member's buffer, delivered to all members.
    ///
    /// Buffers must have identical length on every member. The schedule is
    /// picked by payload size; both schedules accumulate in a fixed order,
    /// so repeated runs reproduce identical rounding.
    pub fn global_sum(&self, input: &[f32]) -> Result<Vec<f32>> {
        if self.group.len() == 1 {
            return Ok(input.to_vec());
        }
        let schedule = strategy::select(input.len(), self.ring_threshold);
        tracing::debug!(
            op = "global_sum",
            schedule = schedule.name(),
            elements = input.len(),
            "selecting reduce schedule"
        );
        self.run(CollectiveOp::GlobalSum, |sequence| {
            schedule.reduce(self, sequence, input)
        })
    }

    /// `global_sum` with an explicit schedule, bypassing size selection.
    /// Both schedules must produce the same sums; tests cross-check them.
    pub fn global_sum_with(&self, input: &[f32], schedule: &dyn ReduceStrategy) -> Result<Vec<f32>> {
        if self.group.len() == 1 {
            return Ok(input.to_vec());
        }
        self.run(CollectiveOp::GlobalSum, |sequence| {
            schedule.reduce(self, sequence, input)
        })
    }

    /// Rank-ordered concatenation of every member's buffer, on all members.
    pub fn gather_all(&self, input: &[f32]) -> Result<Vec<f32>> {
        if self.group.len() == 1 {
            return Ok(input.to_vec());
        }
        self.run(CollectiveOp::GatherAll, |sequence| {
            ring::ring_gather(self, sequence, input)
        })
    }

    /// Reduce-scatter: the buffer is split into one equal segment per
    /// member; member `i` receives the element-wise sum of segment `i`
    /// across all members.
    pub fn scatter_sum(&self, input: &[f32]) -> Result<Vec<f32>> {
        let n = self.group.len();
        if input.len() % n != 0 {
            return Err(LatticeError::Shape {
                context: "scatter_sum buffer (length must divide by group size)",
                expected: input.len().next_multiple_of(n),
                actual: input.len(),
            });
        }
        if n == 1 {
            return Ok(input.to_vec());
        }
        self.run(CollectiveOp::ScatterSum, |sequence| {
            let ranges = crate::sharding::uniform_ranges(input.len(), n);
            let mut buf = input.to_vec();
            ring::reduce_scatter(self, sequence, &mut buf, &ranges, 0)?;
            let (start, end) = ranges[self.group.position()];
            Ok(buf[start..end].to_vec())
        })
    }

    /// Balanced all-to-all: `outgoing[j]` goes to the member at position
    /// `j`, and the result holds one buffer per source position. In round
    /// `k` member `i` sends to `(i+k) mod N` and receives from
    /// `(i-k) mod N`, so every ordered pair communicates exactly once and
    /// no member is idle in any round.
    pub fn peer_exchange(&self, outgoing: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let n = self.group.len();
        if outgoing.len() != n {
            return Err(LatticeError::Shape {
                context: "peer_exchange buffer count",
                expected: n,
                actual: outgoing.len(),
            });
        }
        let block = outgoing[0].len();
        for buffer in outgoing {
            if buffer.len() != block {
                return Err(LatticeError::Shape {
                    context: "peer_exchange buffer lengths",
                    expected: block,
                    actual: buffer.len(),
                });
            }
        }
        if n == 1 {
            return Ok(vec![outgoing[0].clone()]);
        }

        self.run(CollectiveOp::PeerExchange, |sequence| {
            let pos = self.group.position();
            let mut result: Vec<Vec<f32>> = vec![Vec::new(); n];
            result[pos] = outgoing[pos].clone();

            for round in 1..n {
                let send_pos = (pos + round) % n;
                let recv_pos = (pos + n - round) % n;
                self.send_to(send_pos, sequence, round - 1, &outgoing[send_pos])?;
                result[recv_pos] = self.recv_from(recv_pos, sequence, round - 1, block)?;
            }
            Ok(result)
        })
    }

    /// Block until every member of the group has reached this call.
    pub fn barrier(&self) -> Result<()> {
        if self.group.len() == 1 {
            return Ok(());
        }
        self.run(CollectiveOp::Barrier, |sequence| {
            tree::TreeReduce.reduce(self, sequence, &[])?;
            Ok(())
        })
    }

    /// Run one collective under the abort protocol: a transport failure
    /// aborts the run for everyone and surfaces here as a `Collective`
    /// error naming the originating peer. Partial local state never leaks;
    /// the closure's buffers die with it.
    fn run<T>(&self, op: CollectiveOp, body: impl FnOnce(u64) -> Result<T>) -> Result<T> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            op = %op,
            kind = %self.group.kind,
            group = self.group.id,
            sequence,
            "collective start"
        );

        match body(sequence) {
            Ok(value) => Ok(value),
            Err(LatticeError::Transport { peer, reason }) => {
                tracing::warn!(op = %op, peer, %reason, "collective aborted");
                self.transport.abort(peer);
                Err(LatticeError::Collective { op, peer })
            }
            Err(other) => Err(other),
        }
    }

    /// Tag layout: `{kind:1 | group_id:15 | sequence:32 | round:16}`.
    /// Deterministic on every member, unique per call and round, and
    /// disjoint between a rank's data-parallel and tensor-parallel
    /// communicators.
    fn tag_for(&self, sequence: u64, round: usize) -> Tag {
        let kind_bit = match self.group.kind {
            GroupKind::DataParallel => 0u64,
            GroupKind::TensorParallel => 1u64,
        };
        (kind_bit << 63)
            | ((self.group.id as u64 & 0x7FFF) << 48)
            | ((sequence & 0xFFFF_FFFF) << 16)
            | (round as u64 & 0xFFFF)
    }

    /// Send a buffer to the member at a schedule position.
    pub(crate) fn send_to(
        &self,
        position: usize,
        sequence: u64,
        round: usize,
        data: &[f32],
    ) -> Result<()> {
        self.transport.send(
            self.group.rank_at(position),
            wire::encode_f32s(data),
            self.tag_for(sequence, round),
        )
    }

    /// Receive a buffer from the member at a schedule position, enforcing
    /// the expected element count. A length mismatch means the group's
    /// members disagree about buffer shapes; the run is aborted (naming the
    /// sender) so nobody blocks on a collective that can no longer finish.
    pub(crate) fn recv_from(
        &self,
        position: usize,
        sequence: u64,
        round: usize,
        expected_len: usize,
    ) -> Result<Vec<f32>> {
        let source = self.group.rank_at(position);
        let payload = self
            .transport
            .recv(source, self.tag_for(sequence, round))?;
        let values = wire::decode_f32s(&payload)?;
        if values.len() != expected_len {
            self.transport.abort(source);
            return Err(LatticeError::Shape {
                context: "collective buffer",
                expected: expected_len,
                actual: values.len(),
            });
        }
        Ok(values)
    }
}
