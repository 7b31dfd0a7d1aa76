use thiserror::Error;

use crate::collectives::CollectiveOp;
use crate::topology::Rank;

/// Errors that can occur in the runtime.
///
/// None of these are recoverable within the runtime: they surface to the
/// training loop, which is responsible for run-level teardown. Collectives
/// in particular are at-most-once; a failed call is never re-issued.
#[derive(Error, Debug)]
pub enum LatticeError {
    /// Invalid world configuration, topology, or shard sizing. Detected at
    /// setup and always fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// A peer became unreachable, a connection reset, or the retry budget
    /// ran out. Fatal to the run; never retried above the transport layer.
    #[error("transport failure: peer {peer}: {reason}")]
    Transport { peer: Rank, reason: String },

    /// Buffer-size mismatch between collective participants. Indicates a
    /// caller bug, not a runtime condition.
    #[error("shape mismatch in {context}: expected {expected} elements, got {actual}")]
    Shape {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A collective aborted mid-flight. Carries the identity of the peer
    /// whose failure originated the abort.
    #[error("collective {op} aborted: peer {peer} unreachable")]
    Collective { op: CollectiveOp, peer: Rank },

    /// IO error (socket setup, config files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, LatticeError>;

impl From<toml::de::Error> for LatticeError {
    fn from(e: toml::de::Error) -> Self {
        LatticeError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for LatticeError {
    fn from(e: toml::ser::Error) -> Self {
        LatticeError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LatticeError::Config("tensor_parallel_size must divide world_size".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: tensor_parallel_size must divide world_size"
        );
    }

    #[test]
    fn test_transport_error_carries_peer() {
        let err = LatticeError::Transport {
            peer: 3,
            reason: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("peer 3"));
    }

    #[test]
    fn test_collective_error_carries_op_and_peer() {
        let err = LatticeError::Collective {
            op: CollectiveOp::GlobalSum,
            peer: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("global_sum"));
        assert!(msg.contains("peer 1"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: LatticeError = io_err.into();
        assert!(err.to_string().contains("io error"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<usize> {
            Ok(7)
        }

        assert_eq!(returns_result().unwrap(), 7);
    }
}
