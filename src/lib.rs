// memwarden - Resource lifecycle and memory-pressure management
// Keeps resident memory under budget for large in-process objects

#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod config;
pub mod context;
pub mod defrag;
pub mod leak;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod resource;
pub mod snapshot;
pub mod state;
pub mod task;

// Re-exports for convenience
pub use alloc::{BlockId, BlockState, CompressedAllocator, CompressionStats};
pub use config::EngineConfig;
pub use context::MemoryContext;
pub use defrag::{CompactionReport, Defragmenter};
pub use leak::{LeakDetector, LeakRecord};
pub use lock::{LockManager, LockOwner};
pub use monitor::{MemoryMonitor, MemoryStatus, OverflowInfo, PressureWatcher};
pub use orchestrator::{ReleaseEvent, ReleaseOrchestrator, ReleaseReport};
pub use resource::{
    Backup, ByteBuffer, ManagedResource, Ownership, ResourceId, ResourceMetadata,
    ResourceRegistry, ValueResource,
};
pub use snapshot::SnapshotStore;
pub use state::{compare_snapshots, MemoryStateSnapshot, SnapshotComparison};

/// memwarden error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Resource not found: {0}")]
        ResourceNotFound(String),

        #[error("Lock timeout: {0}")]
        LockTimeout(String),

        #[error("Compression failed: {0}")]
        Compression(String),

        #[error("Decompression failed: {0}")]
        Decompression(String),

        #[error("Snapshot unavailable: {0}")]
        SnapshotUnavailable(String),

        #[error("Platform compaction failed: {0}")]
        PlatformCompaction(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Whether this error implies corrupted data with no recovery path
        pub fn is_fatal(&self) -> bool {
            matches!(self, Error::Decompression(_))
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
