//! Sharded output projection choreography
//!
//! The output projection's weight rows (output channels) are sharded across
//! a tensor-parallel group; the compute kernel that turns a weight shard and
//! an input into a partial activation is an external collaborator behind
//! [`ComputeKernel`]. This module owns only the message choreography around
//! it, per training step:
//!
//! - **forward**: local partial activation from the weight shard, then
//!   `gather_all` over the tensor-parallel group assembles the full
//!   activation on every member;
//! - **backward**: local partial input-gradient contribution, then
//!   `scatter_sum` reduces contributions and leaves each member holding its
//!   owned gradient segment, while the weight gradient (purely local) is
//!   accumulated against this rank's shard;
//! - **gradient sync**: a separate `global_sum` over the data-parallel
//!   group on the accumulated weight gradient. The API keeps the ordering
//!   structural: `backward` stores a locally complete gradient, and only
//!   `sync_gradients` starts data-parallel traffic.

use std::sync::Arc;

use crate::collectives::Communicator;
use crate::errors::{LatticeError, Result};
use crate::sharding::{shard_output_channels, Shard};
use crate::tensor::Matrix;
use crate::topology::GroupKind;
use crate::transport::Transport;

/// The external compute collaborator: synchronous, side-effect-free calls
/// over in-memory buffers of agreed shape. Its internals (tiling, register
/// blocking, pipelining) are none of this runtime's business.
pub trait ComputeKernel: Send + Sync {
    /// Partial activation for this rank's weight shard:
    /// `weight_shard [s, in] @ input [in] -> [s]`.
    fn forward(&self, weight_shard: &Matrix, input: &[f32]) -> Result<Vec<f32>>;

    /// Partial input-gradient contribution from this rank's slice of the
    /// upstream gradient: `weight_shard^T [in, s] @ upstream [s] -> [in]`.
    fn backward(&self, weight_shard: &Matrix, upstream: &[f32]) -> Result<Vec<f32>>;
}

/// Reference kernel: naive row-major matrix-vector products. Stands in for
/// the fused accelerator kernel in tests and single-machine runs.
pub struct MatVecKernel;

impl ComputeKernel for MatVecKernel {
    fn forward(&self, weight_shard: &Matrix, input: &[f32]) -> Result<Vec<f32>> {
        weight_shard.matvec(input)
    }

    fn backward(&self, weight_shard: &Matrix, upstream: &[f32]) -> Result<Vec<f32>> {
        weight_shard.matvec_t(upstream)
    }
}

/// One rank's share of the output projection, plus the communicators that
/// stitch the shares together.
pub struct ShardedProjection<K: ComputeKernel> {
    weight: Matrix,
    grad: Matrix,
    shard: Shard,
    in_features: usize,
    out_features: usize,
    kernel: K,
    tensor_parallel: Communicator,
    data_parallel: Communicator,
    last_input: Option<Vec<f32>>,
}

impl<K: ComputeKernel> std::fmt::Debug for ShardedProjection<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedProjection")
            .field("weight", &self.weight)
            .field("grad", &self.grad)
            .field("shard", &self.shard)
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("tensor_parallel", &self.tensor_parallel)
            .field("data_parallel", &self.data_parallel)
            .field("last_input", &self.last_input)
            .finish_non_exhaustive()
    }
}

impl<K: ComputeKernel> ShardedProjection<K> {
    /// Build this rank's projection from the full `[out_features,
    /// in_features]` weight matrix, keeping only the owned row shard.
    ///
    /// Both dimensions must divide evenly by the tensor-parallel group
    /// size: the forward gather assembles equal-length partial activations,
    /// and the backward reduce-scatter partitions the input gradient into
    /// equal segments.
    pub fn from_full_weight(
        full_weight: &Matrix,
        kernel: K,
        transport: Arc<dyn Transport>,
        tensor_parallel: crate::topology::Group,
        data_parallel: crate::topology::Group,
    ) -> Result<Self> {
        if tensor_parallel.kind != GroupKind::TensorParallel
            || data_parallel.kind != GroupKind::DataParallel
        {
            return Err(LatticeError::Config(
                "projection needs one tensor-parallel and one data-parallel group".into(),
            ));
        }
        let tp_size = tensor_parallel.len();
        if full_weight.rows % tp_size != 0 {
            return Err(LatticeError::Config(format!(
                "output channels ({}) must divide evenly across the tensor-parallel group ({})",
                full_weight.rows, tp_size
            )));
        }
        if full_weight.cols % tp_size != 0 {
            return Err(LatticeError::Config(format!(
                "input features ({}) must divide evenly across the tensor-parallel group ({})",
                full_weight.cols, tp_size
            )));
        }

        let shard = shard_output_channels(full_weight.rows, &tensor_parallel)?;
        let weight = full_weight.row_slice(shard.start, shard.end)?;

        Self::new(
            weight,
            shard,
            full_weight.rows,
            full_weight.cols,
            kernel,
            transport,
            tensor_parallel,
            data_parallel,
        )
    }

    /// Build from an already-sharded local weight.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        weight: Matrix,
        shard: Shard,
        out_features: usize,
        in_features: usize,
        kernel: K,
        transport: Arc<dyn Transport>,
        tensor_parallel: crate::topology::Group,
        data_parallel: crate::topology::Group,
    ) -> Result<Self> {
        if weight.rows != shard.len() || weight.cols != in_features {
            return Err(LatticeError::Shape {
                context: "projection weight shard",
                expected: shard.len() * in_features,
                actual: weight.data.len(),
            });
        }

        let grad = Matrix::zeros(weight.rows, weight.cols);
        Ok(Self {
            weight,
            grad,
            shard,
            in_features,
            out_features,
            kernel,
            tensor_parallel: Communicator::new(tensor_parallel, Arc::clone(&transport))?,
            data_parallel: Communicator::new(data_parallel, transport)?,
            last_input: None,
        })
    }

    /// The output-channel range this rank owns.
    pub fn shard(&self) -> Shard {
        self.shard
    }

    /// This rank's weight shard.
    pub fn weight(&self) -> &Matrix {
        &self.weight
    }

    /// The accumulated gradient for this rank's weight shard.
    pub fn grad(&self) -> &Matrix {
        &self.grad
    }

    /// Forward pass: compute the local partial activation, then assemble
    /// the full activation on every member. Callers select the portion the
    /// next stage needs.
    pub fn forward(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if input.len() != self.in_features {
            return Err(LatticeError::Shape {
                context: "projection input",
                expected: self.in_features,
                actual: input.len(),
            });
        }

        let local = self.kernel.forward(&self.weight, input)?;
        if local.len() != self.shard.len() {
            return Err(LatticeError::Shape {
                context: "kernel forward output",
                expected: self.shard.len(),
                actual: local.len(),
            });
        }

        self.last_input = Some(input.to_vec());
        self.tensor_parallel.gather_all(&local)
    }

    /// Backward pass: compute the local input-gradient contribution, reduce
    /// it across the tensor-parallel group, and accumulate this rank's
    /// weight gradient. Returns the owned segment of the input gradient.
    pub fn backward(&mut self, upstream: &[f32]) -> Result<Vec<f32>> {
        if upstream.len() != self.out_features {
            return Err(LatticeError::Shape {
                context: "projection upstream gradient",
                expected: self.out_features,
                actual: upstream.len(),
            });
        }
        let input = self.last_input.take().ok_or_else(|| {
            LatticeError::Config("projection backward called before forward".into())
        })?;

        let upstream_local = &upstream[self.shard.range()];
        let contribution = self.kernel.backward(&self.weight, upstream_local)?;
        if contribution.len() != self.in_features {
            return Err(LatticeError::Shape {
                context: "kernel backward output",
                expected: self.in_features,
                actual: contribution.len(),
            });
        }

        // The weight gradient never crosses rank boundaries: this rank's
        // rows depend only on its own upstream slice and the cached input.
        self.grad
            .add_assign(&Matrix::outer(upstream_local, &input))?;

        self.tensor_parallel.scatter_sum(&contribution)
    }

    /// Data-parallel gradient synchronization: `global_sum` the accumulated
    /// weight gradient across replicas. Tensor-parallel reduction already
    /// finished inside `backward`, so the gradient entering here is locally
    /// complete.
    pub fn sync_gradients(&mut self) -> Result<()> {
        tracing::debug!(
            rows = self.grad.rows,
            cols = self.grad.cols,
            "synchronizing weight gradient across data-parallel replicas"
        );
        let summed = self.data_parallel.global_sum(&self.grad.data)?;
        self.grad.data = summed;
        Ok(())
    }

    /// Apply the accumulated gradient to the owned weight shard and reset
    /// it for the next step.
    pub fn apply_gradients(&mut self, learning_rate: f32) -> Result<()> {
        self.weight.sub_scaled(&self.grad, learning_rate)?;
        self.grad.zero();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::topology::derive_groups;
    use crate::transport::memory::LocalCluster;

    fn single_rank_projection(weight: Matrix) -> ShardedProjection<MatVecKernel> {
        let config = WorldConfig::new(1, 1).unwrap();
        let (dp, tp) = derive_groups(0, &config).unwrap();
        let cluster = LocalCluster::new(1);
        let transport: Arc<dyn Transport> = Arc::new(cluster.transport(0).unwrap());
        ShardedProjection::from_full_weight(&weight, MatVecKernel, transport, tp, dp).unwrap()
    }

    #[test]
    fn test_single_rank_forward_matches_matvec() {
        let weight = Matrix::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        let mut projection = single_rank_projection(weight.clone());

        let input = [1.0, 0.5, -1.0];
        let output = projection.forward(&input).unwrap();
        assert_eq!(output, weight.matvec(&input).unwrap());
    }

    #[test]
    fn test_single_rank_backward_accumulates_weight_grad() {
        let weight = Matrix::new(vec![1.0, 0.0, 0.0, 1.0], 2, 2).unwrap();
        let mut projection = single_rank_projection(weight);

        let input = [2.0, 3.0];
        projection.forward(&input).unwrap();
        let input_grad = projection.backward(&[1.0, -1.0]).unwrap();

        // dL/dx = W^T g
        assert_eq!(input_grad, vec![1.0, -1.0]);
        // dL/dW = g ⊗ x
        assert_eq!(projection.grad().data, vec![2.0, 3.0, -2.0, -3.0]);
    }

    #[test]
    fn test_backward_before_forward_rejected() {
        let weight = Matrix::new(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let mut projection = single_rank_projection(weight);

        assert!(projection.backward(&[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_input_shape_enforced() {
        let weight = Matrix::zeros(2, 4);
        let mut projection = single_rank_projection(weight);

        let err = projection.forward(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, LatticeError::Shape { .. }));
    }

    #[test]
    fn test_apply_gradients_steps_weight() {
        let weight = Matrix::new(vec![1.0, 1.0, 1.0, 1.0], 2, 2).unwrap();
        let mut projection = single_rank_projection(weight);

        projection.forward(&[1.0, 1.0]).unwrap();
        projection.backward(&[1.0, 1.0]).unwrap();
        projection.apply_gradients(0.5).unwrap();

        // grad = ones ⊗ ones; weight -= 0.5 * grad
        assert_eq!(projection.weight().data, vec![0.5, 0.5, 0.5, 0.5]);
        assert_eq!(projection.grad().data, vec![0.0; 4]);
    }

    #[test]
    fn test_indivisible_channels_rejected() {
        let config = WorldConfig::new(2, 2).unwrap();
        let (dp, tp) = derive_groups(0, &config).unwrap();
        let cluster = LocalCluster::new(2);
        let transport: Arc<dyn Transport> = Arc::new(cluster.transport(0).unwrap());

        // 3 output channels over a tensor-parallel group of 2.
        let weight = Matrix::zeros(3, 4);
        let err =
            ShardedProjection::from_full_weight(&weight, MatVecKernel, transport, tp, dp)
                .unwrap_err();
        assert!(matches!(err, LatticeError::Config(_)));
    }

    #[test]
    fn test_group_kinds_checked() {
        let config = WorldConfig::new(1, 1).unwrap();
        let (dp, tp) = derive_groups(0, &config).unwrap();
        let cluster = LocalCluster::new(1);
        let transport: Arc<dyn Transport> = Arc::new(cluster.transport(0).unwrap());

        let weight = Matrix::zeros(2, 2);
        // Groups swapped.
        let err =
            ShardedProjection::from_full_weight(&weight, MatVecKernel, transport, dp, tp)
                .unwrap_err();
        assert!(matches!(err, LatticeError::Config(_)));
    }
}
