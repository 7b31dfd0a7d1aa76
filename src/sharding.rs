//! Shard assignment across group members
//!
//! Splits are as-uniform-as-possible: with `N` members and `size` elements,
//! `base = size / N` and the first `size % N` members (by schedule position)
//! receive one extra element. Every consumer that reassembles sharded data
//! (the forward/backward choreography, the ring reduce-scatter chunking)
//! uses this same table, so shard boundaries always reconcile with no gaps
//! or overlaps.
//!
//! The minimum shard size is zero: `size = 0` is legal and yields all-empty
//! shards rather than an error.

use serde::{Deserialize, Serialize};

use crate::errors::{LatticeError, Result};
use crate::topology::{Group, Rank};

/// A contiguous sub-range of one tensor dimension, owned by a single rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Rank owning this range exclusively.
    pub owner: Rank,
    /// Start index (inclusive).
    pub start: usize,
    /// End index (exclusive).
    pub end: usize,
}

impl Shard {
    /// Number of elements in the shard.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the shard covers no elements.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The owned range, for direct slicing.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Partition `size` elements into `parts` contiguous `(start, end)` ranges,
/// front-loading the remainder.
pub fn uniform_ranges(size: usize, parts: usize) -> Vec<(usize, usize)> {
    let base = size / parts;
    let remainder = size % parts;

    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = if i < remainder { base + 1 } else { base };
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

/// Every member's shard of `size` elements, in schedule-position order.
pub fn shard_table(size: usize, group: &Group) -> Result<Vec<Shard>> {
    if group.is_empty() {
        return Err(LatticeError::Config(
            "cannot shard over an empty group".into(),
        ));
    }
    Ok(uniform_ranges(size, group.len())
        .into_iter()
        .enumerate()
        .map(|(position, (start, end))| Shard {
            owner: group.rank_at(position),
            start,
            end,
        })
        .collect())
}

/// This member's batch-row shard for a data-parallel group.
pub fn shard_batch(global_batch_size: usize, group: &Group) -> Result<Shard> {
    Ok(shard_table(global_batch_size, group)?[group.position()])
}

/// This member's output-channel shard for a tensor-parallel group.
pub fn shard_output_channels(total_channels: usize, group: &Group) -> Result<Shard> {
    Ok(shard_table(total_channels, group)?[group.position()])
}
