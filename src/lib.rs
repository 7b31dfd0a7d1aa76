//! # lattice
//!
//! A minimal message-passing runtime for data-parallel and tensor-parallel
//! distributed training: deterministic process-group derivation from a flat
//! rank space, a blocking point-to-point transport with per-channel
//! buffering, and collective primitives (global-sum, gather-all,
//! scatter-sum, peer-exchange) built from that transport rather than a
//! vendor library.
//!
//! The world is fixed for the lifetime of a run: every process is launched
//! with its rank and the shared [`WorldConfig`], derives its group
//! membership arithmetically, and communicates over a static mesh. A rank
//! failure is fatal to the run, never recovered.

pub mod collectives;
pub mod config;
pub mod errors;
pub mod projection;
pub mod sharding;
pub mod tensor;
pub mod topology;
pub mod transport;

pub use collectives::{CollectiveOp, Communicator, ReduceStrategy};
pub use config::{TransportConfig, WorldConfig};
pub use errors::{LatticeError, Result};
pub use projection::{ComputeKernel, MatVecKernel, ShardedProjection};
pub use sharding::{shard_batch, shard_output_channels, shard_table, Shard};
pub use tensor::Matrix;
pub use topology::{derive_groups, Group, GroupKind, Rank};
pub use transport::{memory::LocalCluster, tcp::TcpTransport, Transport};
