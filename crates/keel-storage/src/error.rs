use std::fmt::Display;

use super::config::SegmentId;

/// A specialized error type for log storage operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A segment file failed an integrity check.
    #[error("corrupt segment: {0}")]
    CorruptSegment(String),
    /// Segment has no room for the append; the caller should roll over.
    #[error("segment full: {0}")]
    SegmentFull(SegmentId),
    /// Segment is not present in the manager's index.
    #[error("segment not found: {0}")]
    SegmentNotFound(SegmentId),
    /// A rewrite target cannot hold the live entries it must receive.
    #[error("insufficient space: needed {needed} bytes, segment holds {available}")]
    InsufficientSpace { needed: u64, available: u64 },
}

impl StorageError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create a corrupt segment error from a displayable value.
    pub fn corrupt<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::CorruptSegment(msg.to_string())
    }

    /// Transient failures leave their segments in the eligible set; the
    /// compaction planner simply re-selects them on a later pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::InsufficientSpace { .. }
        )
    }
}

/// A Result type alias for log storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = StorageError::invalid_config("bad path");
        assert!(matches!(err, StorageError::InvalidConfig(msg) if msg == "bad path"));
    }

    #[test]
    fn transient_classification() {
        let io = StorageError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(io.is_transient());
        let space = StorageError::InsufficientSpace {
            needed: 128,
            available: 64,
        };
        assert!(space.is_transient());
        let corrupt = StorageError::corrupt("bad footer");
        assert!(!corrupt.is_transient());
    }
}
