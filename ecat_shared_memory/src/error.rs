//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during bridge operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment, region or semaphore not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Object name
        name: String,
    },

    /// Segment exists but its snapshot was never constructed
    #[error("Segment not constructed: {name}")]
    NotConstructed {
        /// Segment name
        name: String,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes (need at least {required})")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
        /// Minimum size in bytes
        required: usize,
    },

    /// Invalid shared object name
    #[error("Invalid shared object name: {name:?}")]
    InvalidName {
        /// Offending name
        name: String,
    },

    /// Segment was built by an incompatible binary
    #[error("Layout mismatch in {name}: expected {expected:#010x}, found {found:#010x}")]
    LayoutMismatch {
        /// Segment name
        name: String,
        /// Layout hash of this build
        expected: u32,
        /// Layout hash stored in the segment
        found: u32,
    },

    /// Every semaphore slot is taken by another consumer
    #[error("Consumer pool exhausted ({capacity} slots)")]
    PoolExhausted {
        /// Pool capacity
        capacity: usize,
    },

    /// Zero is reserved for free registry slots
    #[error("Consumer identity 0 is reserved")]
    InvalidIdentity,

    /// Semaphore system call failed
    #[error("Semaphore {name}: {source}")]
    Semaphore {
        /// Semaphore name
        name: String,
        /// OS error
        source: std::io::Error,
    },

    /// Slave directory not published yet
    #[error("Slave directory not published")]
    DirectoryNotPublished,

    /// Slave directory kept changing while it was read
    #[error("Slave directory is being rewritten")]
    DirectoryBusy,

    /// Slave index out of range
    #[error("Slave index {index} out of range")]
    SlaveNotFound {
        /// Requested index
        index: usize,
    },

    /// Variable unknown to the slave
    #[error("Variable not found: {name}")]
    VariableNotFound {
        /// Variable name
        name: String,
    },

    /// Variable configured but missing from the live bus layout
    #[error("Variable absent from process image: {name}")]
    VariableAbsent {
        /// Variable name
        name: String,
    },

    /// Requested type does not match the variable's byte size
    #[error("Variable {name}: size {actual} bytes, accessor expects {expected}")]
    VariableSizeMismatch {
        /// Variable name
        name: String,
        /// Size of the accessor type
        expected: usize,
        /// Size of the variable
        actual: usize,
    },

    /// Write attempted on an input variable
    #[error("Variable {name} is an input and cannot be written")]
    ReadOnlyVariable {
        /// Variable name
        name: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
