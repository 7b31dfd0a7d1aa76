//! World and transport configuration
//!
//! A process is given its own rank and the shared [`WorldConfig`] at launch.
//! The config can arrive as a TOML file, environment variables, or be built
//! directly; it is validated once and immutable for the lifetime of the run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{LatticeError, Result};
use crate::topology::Rank;

/// Environment variable carrying this process's rank.
pub const ENV_RANK: &str = "LATTICE_RANK";
/// Environment variable carrying the total number of ranks.
pub const ENV_WORLD_SIZE: &str = "LATTICE_WORLD_SIZE";
/// Environment variable carrying the tensor-parallel group size.
pub const ENV_TENSOR_PARALLEL_SIZE: &str = "LATTICE_TENSOR_PARALLEL_SIZE";

/// Shape of the flat rank space for one run.
///
/// `tensor_parallel_size` must divide `world_size` evenly; the quotient is
/// the number of data-parallel replicas. Immutable once a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Total number of ranks in the run.
    pub world_size: usize,
    /// Number of ranks in each tensor-parallel group.
    pub tensor_parallel_size: usize,
}

impl WorldConfig {
    /// Create and validate a world configuration.
    pub fn new(world_size: usize, tensor_parallel_size: usize) -> Result<Self> {
        let config = Self {
            world_size,
            tensor_parallel_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Number of data-parallel replicas (`world_size / tensor_parallel_size`).
    pub fn data_parallel_size(&self) -> usize {
        self.world_size / self.tensor_parallel_size
    }

    /// Validate the topology constraints.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(LatticeError::Config("world_size must be at least 1".into()));
        }
        if self.tensor_parallel_size == 0 {
            return Err(LatticeError::Config(
                "tensor_parallel_size must be at least 1".into(),
            ));
        }
        if self.world_size % self.tensor_parallel_size != 0 {
            return Err(LatticeError::Config(format!(
                "tensor_parallel_size ({}) must divide world_size ({}) evenly",
                self.tensor_parallel_size, self.world_size
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading world configuration");

        let content = std::fs::read_to_string(path)?;
        let config: WorldConfig = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Read the configuration from `LATTICE_WORLD_SIZE` and
    /// `LATTICE_TENSOR_PARALLEL_SIZE`.
    pub fn from_env() -> Result<Self> {
        let world_size = read_env_usize(ENV_WORLD_SIZE)?;
        let tensor_parallel_size = read_env_usize(ENV_TENSOR_PARALLEL_SIZE)?;
        Self::new(world_size, tensor_parallel_size)
    }
}

/// Read this process's rank from `LATTICE_RANK`.
pub fn rank_from_env() -> Result<Rank> {
    read_env_usize(ENV_RANK)
}

fn read_env_usize(name: &str) -> Result<usize> {
    let raw = std::env::var(name)
        .map_err(|_| LatticeError::Config(format!("environment variable {} is not set", name)))?;
    raw.parse::<usize>()
        .map_err(|_| LatticeError::Config(format!("{} must be a non-negative integer, got {:?}", name, raw)))
}

/// Tuning knobs for the transport layer.
///
/// Timeouts exist only here, at the dial/retry layer; there is no step-level
/// timeout anywhere above the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum number of dial attempts before a peer is declared unreachable.
    pub max_dial_retries: u32,
    /// Base delay between dial attempts, doubled on each retry.
    pub dial_backoff_ms: u64,
    /// Upper bound on the backoff delay.
    pub dial_backoff_max_ms: u64,
    /// Bounded depth of each per-(peer, tag) receive queue.
    pub queue_capacity: usize,
    /// Hard limit on a single wire message, in bytes.
    pub message_size_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_dial_retries: 5,
            dial_backoff_ms: 100,
            dial_backoff_max_ms: 3_200,
            queue_capacity: 64,
            message_size_limit: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl TransportConfig {
    /// Validate the transport tuning values.
    pub fn validate(&self) -> Result<()> {
        if self.max_dial_retries == 0 {
            return Err(LatticeError::Config(
                "max_dial_retries must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(LatticeError::Config(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.message_size_limit == 0 {
            return Err(LatticeError::Config(
                "message_size_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = WorldConfig::new(8, 2).unwrap();
        assert_eq!(config.world_size, 8);
        assert_eq!(config.tensor_parallel_size, 2);
        assert_eq!(config.data_parallel_size(), 4);
    }

    #[test]
    fn test_non_divisible_topology_rejected() {
        let err = WorldConfig::new(6, 4).unwrap_err();
        assert!(matches!(err, LatticeError::Config(_)));
        assert!(err.to_string().contains("divide"));
    }

    #[test]
    fn test_zero_world_size_rejected() {
        assert!(WorldConfig::new(0, 1).is_err());
        assert!(WorldConfig::new(4, 0).is_err());
    }

    #[test]
    fn test_single_rank_world() {
        let config = WorldConfig::new(1, 1).unwrap();
        assert_eq!(config.data_parallel_size(), 1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("world.toml");

        let original = WorldConfig::new(4, 2).unwrap();
        std::fs::write(&path, toml::to_string_pretty(&original).unwrap()).unwrap();

        let loaded = WorldConfig::load(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_rejects_invalid_topology() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("world.toml");
        std::fs::write(&path, "world_size = 6\ntensor_parallel_size = 4\n").unwrap();

        assert!(WorldConfig::load(&path).is_err());
    }

    #[test]
    fn test_transport_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_dial_retries, 5);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.message_size_limit, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_config_rejects_zero_capacity() {
        let config = TransportConfig {
            queue_capacity: 0,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
