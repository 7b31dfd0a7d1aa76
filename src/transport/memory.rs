//! In-process transport for multi-rank simulation
//!
//! Wires `world_size` mailboxes together behind one hub so a full world can
//! run as threads inside a single process. This is the transport the
//! multi-rank tests use, and it doubles as the fault-injection harness:
//! [`LocalCluster::fail`] makes a rank unreachable exactly as a crashed
//! process would look to its peers.

use std::sync::Arc;

use crate::config::TransportConfig;
use crate::errors::{LatticeError, Result};
use crate::topology::Rank;
use crate::transport::mailbox::Mailbox;
use crate::transport::{Tag, Transport};

struct ClusterShared {
    mailboxes: Vec<Mailbox>,
}

/// A full world of in-process endpoints sharing one delivery hub.
#[derive(Clone)]
pub struct LocalCluster {
    shared: Arc<ClusterShared>,
}

impl LocalCluster {
    /// Create a cluster with default transport tuning.
    pub fn new(world_size: usize) -> Self {
        Self::with_config(world_size, &TransportConfig::default())
    }

    /// Create a cluster with explicit queue capacity.
    pub fn with_config(world_size: usize, config: &TransportConfig) -> Self {
        let mailboxes = (0..world_size)
            .map(|rank| Mailbox::new(rank, config.queue_capacity))
            .collect();
        Self {
            shared: Arc::new(ClusterShared { mailboxes }),
        }
    }

    /// Number of ranks in the cluster.
    pub fn world_size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    /// The endpoint for one rank. Each rank's thread takes exactly one.
    pub fn transport(&self, rank: Rank) -> Result<MemoryTransport> {
        if rank >= self.world_size() {
            return Err(LatticeError::Config(format!(
                "rank {} out of range for cluster of {}",
                rank,
                self.world_size()
            )));
        }
        Ok(MemoryTransport {
            rank,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Fault injection: make `rank` unreachable, as if its process crashed.
    /// Every blocked and future call involving it fails with that rank as
    /// the root cause.
    pub fn fail(&self, rank: Rank) {
        tracing::warn!(rank, "injecting rank failure");
        for mailbox in &self.shared.mailboxes {
            mailbox.fail(rank, rank);
        }
    }
}

/// One rank's endpoint into a [`LocalCluster`].
pub struct MemoryTransport {
    rank: Rank,
    shared: Arc<ClusterShared>,
}

impl Transport for MemoryTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn send(&self, dest: Rank, payload: Vec<u8>, tag: Tag) -> Result<()> {
        let mailbox = self.shared.mailboxes.get(dest).ok_or_else(|| {
            LatticeError::Config(format!(
                "destination rank {} out of range for world of {}",
                dest,
                self.shared.mailboxes.len()
            ))
        })?;
        mailbox.push(self.rank, tag, payload)
    }

    fn recv(&self, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        if source >= self.shared.mailboxes.len() {
            return Err(LatticeError::Config(format!(
                "source rank {} out of range for world of {}",
                source,
                self.shared.mailboxes.len()
            )));
        }
        self.shared.mailboxes[self.rank].pop(source, tag)
    }

    fn abort(&self, origin: Rank) {
        tracing::warn!(rank = self.rank, origin, "aborting run");
        for mailbox in &self.shared.mailboxes {
            mailbox.abort_run(origin);
        }
    }
}
