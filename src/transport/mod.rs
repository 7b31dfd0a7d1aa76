//! Point-to-point transport between ranks
//!
//! The substrate everything above is built on: blocking `send`/`recv`
//! between two ranks, addressed by `(source, tag)` logical channels.
//! Same-tag messages between the same ordered pair of ranks arrive in send
//! order; messages on other channels are buffered per-tag and never corrupt
//! each other's state. There is no ordering guarantee across different tags
//! or different source ranks.
//!
//! Two implementations share one mailbox primitive:
//! - [`memory::LocalCluster`] wires N ranks together in one process, used by
//!   the multi-rank tests and the fault-injection harness;
//! - [`tcp::TcpTransport`] runs one rank per OS process over a static full
//!   mesh of sockets, with a reader thread per peer connection.

pub(crate) mod mailbox;
pub mod memory;
pub mod tcp;
pub mod wire;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::errors::Result;
use crate::topology::Rank;

/// Logical channel identifier. Collectives derive tags deterministically;
/// point-to-point users may pick any value below the reserved range.
pub type Tag = u64;

/// Reserved tag carrying run-abort control frames.
pub const ABORT_TAG: Tag = u64::MAX;

/// One in-flight message between two ranks.
///
/// Transient: exists only between a `send` and its matching `recv`. The
/// payload is an opaque byte buffer; element layout is agreed out-of-band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sending rank
    pub source: Rank,
    /// Receiving rank
    pub dest: Rank,
    /// Logical channel
    pub tag: Tag,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

/// Blocking point-to-point messaging between ranks.
///
/// All calls block from the caller's perspective: `send` returns once the
/// receiver side has accepted the message into its `(source, tag)` queue,
/// `recv` returns once a matching message is available. Both fail with a
/// `Transport` error when the peer (or the run) is gone; exhausting the
/// dial retry budget is fatal.
pub trait Transport: Send + Sync {
    /// This endpoint's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the run.
    fn world_size(&self) -> usize;

    /// Deliver `payload` to `dest` on channel `tag`.
    fn send(&self, dest: Rank, payload: Vec<u8>, tag: Tag) -> Result<()>;

    /// Block until a message from `source` on channel `tag` arrives.
    fn recv(&self, source: Rank, tag: Tag) -> Result<Vec<u8>>;

    /// Mark the run failed with a root-cause rank and wake every blocked
    /// peer that can still be reached. Called by a collective that observed
    /// a transport failure; after this, every pending and future call on
    /// any reachable endpoint fails with the same origin.
    fn abort(&self, origin: Rank);
}

/// Exponential backoff schedule for dial retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before the peer is declared unreachable.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Build the policy from transport configuration.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_attempts: config.max_dial_retries,
            base_delay: Duration::from_millis(config.dial_backoff_ms),
            max_delay: Duration::from_millis(config.dial_backoff_max_ms),
        }
    }

    /// Delay to sleep after a failed attempt (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(20));
        exp.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}
