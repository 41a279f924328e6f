//! Compressed block allocator
//!
//! # Architecture
//!
//! ```text
//! CompressedAllocator
//!   ├─→ blocks: Mutex<HashMap<BlockId, Arc<BlockEntry>>>   (structural lock)
//!   │      └─→ BlockEntry
//!   │            ├─→ header atomics (state, sizes, last access)
//!   │            └─→ payload: Arc<Mutex<BlockPayload>>     (per-block lock)
//!   └─→ idle scan (rayon) → try_lock each candidate → zstd
//! ```

pub mod allocator;
pub mod block;
pub mod compression;

pub use allocator::{BlockView, CompressedAllocator, CompressionStats};
pub use block::{BlockId, BlockState};
pub use compression::{compress, compression_ratio, decompress, CompressionAlgorithm};
