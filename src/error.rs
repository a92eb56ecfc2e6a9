//! Error types for Repartir
//!
//! One crate-wide error enum; every fallible path funnels into it.

use thiserror::Error;

/// Result type alias for Repartir operations
pub type Result<T> = std::result::Result<T, RepartirError>;

/// Error type for all Repartir operations
#[derive(Error, Debug)]
pub enum RepartirError {
    /// Bad CLI arguments, ratios string, or plan inconsistency
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model file magic/version/header problems
    #[error("Model format error: {0}")]
    ModelFormat(String),

    /// Socket-level failure (connect, accept, read, write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer closed the connection mid-transfer
    #[error("Socket closed by peer")]
    SocketClosed,

    /// Bootstrap handshake mismatch (wrong magic/version/ack)
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Unsupported operator/quantization combination
    #[error("Unsupported op '{op}' for quant {quant}")]
    UnsupportedOp {
        /// Operator name
        op: String,
        /// Input/weight/output quant tuple
        quant: String,
    },

    /// Weight bytes do not fit the op's allocated weight buffer
    #[error(
        "Weight overflow in '{op}': offset {offset} + {n_bytes} bytes exceeds allocated {allocated}"
    )]
    WeightOverflow {
        /// Operator name
        op: String,
        /// Destination offset
        offset: usize,
        /// Incoming byte count
        n_bytes: usize,
        /// Allocated weight buffer size
        allocated: usize,
    },

    /// Per-layer byte accounting failed during local weight loading
    #[error("Layer {layer} size mismatch: expected {expected} bytes, walked {actual}")]
    LayerSizeMismatch {
        /// Layer index
        layer: u32,
        /// Precomputed per-layer byte total
        expected: usize,
        /// Bytes actually advanced
        actual: usize,
    },

    /// Slice start/length not aligned to the quantization block
    #[error("Misaligned slice for {what}: {value} is not a multiple of {block_size}")]
    MisalignedSlice {
        /// What was being sliced
        what: &'static str,
        /// Offending value
        value: u32,
        /// Required block size
        block_size: u32,
    },

    /// Tokenizer file or encode/decode failure
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepartirError {
    /// True when the error came from the transport layer and the worker
    /// should fall back to listening instead of aborting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RepartirError::Transport(_) | RepartirError::SocketClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RepartirError::LayerSizeMismatch {
            layer: 3,
            expected: 1024,
            actual: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("Layer 3"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("1000"));
    }

    #[test]
    fn test_transport_classification() {
        assert!(RepartirError::SocketClosed.is_transport());
        assert!(RepartirError::Transport("reset".to_string()).is_transport());
        assert!(!RepartirError::Config("bad".to_string()).is_transport());
    }
}
