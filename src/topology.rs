//! Rank and process-group topology
//!
//! Group membership is a pure arithmetic function of a rank and the world
//! configuration. Every process derives the same groups independently, with
//! no runtime negotiation or registration, and the sorted member order fixes
//! each member's position in every collective schedule (ring neighbor, tree
//! parent) for the lifetime of the run.
//!
//! Layout is model-major: consecutive ranks form a tensor-parallel group,
//! and ranks spaced `tensor_parallel_size` apart form a data-parallel group.
//!
//! ```text
//! world_size = 4, tensor_parallel_size = 2
//!
//!   tp group 0: [0, 1]      dp group 0: [0, 2]
//!   tp group 1: [2, 3]      dp group 1: [1, 3]
//! ```

use serde::{Deserialize, Serialize};

use crate::config::WorldConfig;
use crate::errors::{LatticeError, Result};

/// Identifies one participant in the run; an integer in `[0, world_size)`.
pub type Rank = usize;

/// Which parallelism axis a group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    /// Replicas holding the same weights, training on different data.
    DataParallel,
    /// Ranks holding different shards of the same weights.
    TensorParallel,
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupKind::DataParallel => write!(f, "data_parallel"),
            GroupKind::TensorParallel => write!(f, "tensor_parallel"),
        }
    }
}

/// A fixed, ordered set of ranks participating in collectives together.
///
/// `members` is sorted ascending by rank; a member's index in it is its
/// schedule position. Membership never changes after derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group index within its kind.
    pub id: usize,
    /// Parallelism axis this group covers.
    pub kind: GroupKind,
    /// Member ranks, ascending.
    pub members: Vec<Rank>,
    /// This process's position within `members`.
    pub local_rank: usize,
}

impl Group {
    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// This process's rank.
    pub fn rank(&self) -> Rank {
        self.members[self.local_rank]
    }

    /// This process's schedule position (alias for `local_rank`).
    pub fn position(&self) -> usize {
        self.local_rank
    }

    /// Rank of the member at a schedule position.
    pub fn rank_at(&self, position: usize) -> Rank {
        self.members[position]
    }

    /// Rank at a signed offset from this member's position, wrapping around.
    pub fn neighbor(&self, offset: isize) -> Rank {
        let n = self.members.len() as isize;
        let pos = (self.local_rank as isize + offset).rem_euclid(n) as usize;
        self.members[pos]
    }

    /// Next member around the ring (position + 1).
    pub fn right(&self) -> Rank {
        self.neighbor(1)
    }

    /// Previous member around the ring (position - 1).
    pub fn left(&self) -> Rank {
        self.neighbor(-1)
    }
}

/// Derive this rank's data-parallel and tensor-parallel groups.
///
/// Pure and side-effect-free: callable redundantly by every rank without
/// coordination, always producing identical `Group` values for identical
/// inputs. Returns `(data_parallel, tensor_parallel)`.
pub fn derive_groups(rank: Rank, config: &WorldConfig) -> Result<(Group, Group)> {
    config.validate()?;
    if rank >= config.world_size {
        return Err(LatticeError::Config(format!(
            "rank {} out of range for world_size {}",
            rank, config.world_size
        )));
    }

    let tp = config.tensor_parallel_size;
    let dp = config.data_parallel_size();

    // Consecutive ranks share a tensor-parallel group.
    let tp_id = rank / tp;
    let tp_members: Vec<Rank> = (tp_id * tp..(tp_id + 1) * tp).collect();
    let tensor_parallel = Group {
        id: tp_id,
        kind: GroupKind::TensorParallel,
        local_rank: rank - tp_id * tp,
        members: tp_members,
    };

    // Ranks spaced tp apart share a data-parallel group.
    let dp_id = rank % tp;
    let dp_members: Vec<Rank> = (0..dp).map(|i| dp_id + i * tp).collect();
    let data_parallel = Group {
        id: dp_id,
        kind: GroupKind::DataParallel,
        local_rank: rank / tp,
        members: dp_members,
    };

    Ok((data_parallel, tensor_parallel))
}
