//! Tree schedule for latency-bound payloads
//!
//! A binary reduce-then-broadcast over schedule positions: children send up,
//! the root accumulates, then the total flows back down. 2 * ceil(log2 N)
//! communication steps, so it beats the ring whenever the per-message fixed
//! cost outweighs the bytes moved.
//!
//! Accumulation order at every node is own buffer, then left subtree, then
//! right subtree, which makes the rounding pattern a fixed function of the
//! group size.

use crate::collectives::strategy::ReduceStrategy;
use crate::collectives::Communicator;
use crate::errors::Result;

const REDUCE_ROUND: usize = 0;
const BROADCAST_ROUND: usize = 1;

/// Binary-tree reduce-then-broadcast.
pub struct TreeReduce;

impl ReduceStrategy for TreeReduce {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn reduce(&self, comm: &Communicator, sequence: u64, input: &[f32]) -> Result<Vec<f32>> {
        let n = comm.group().len();
        let pos = comm.group().position();
        let len = input.len();

        // Reduce phase: fold both subtrees into the local buffer, then hand
        // the partial sum to the parent.
        let mut acc = input.to_vec();
        for child in children(pos, n) {
            let incoming = comm.recv_from(child, sequence, REDUCE_ROUND, len)?;
            for (slot, value) in acc.iter_mut().zip(&incoming) {
                *slot += value;
            }
        }
        if let Some(parent) = parent(pos) {
            comm.send_to(parent, sequence, REDUCE_ROUND, &acc)?;
        }

        // Broadcast phase: the total flows back down the same tree.
        if let Some(parent) = parent(pos) {
            acc = comm.recv_from(parent, sequence, BROADCAST_ROUND, len)?;
        }
        for child in children(pos, n) {
            comm.send_to(child, sequence, BROADCAST_ROUND, &acc)?;
        }

        Ok(acc)
    }
}

/// Parent position in the binary tree; `None` for the root.
fn parent(pos: usize) -> Option<usize> {
    if pos == 0 {
        None
    } else {
        Some((pos - 1) / 2)
    }
}

/// Child positions that exist for a group of `n` members, left then right.
fn children(pos: usize, n: usize) -> impl Iterator<Item = usize> {
    [2 * pos + 1, 2 * pos + 2]
        .into_iter()
        .filter(move |&c| c < n)
}
