//! Arena allocator with transparent block compression
//!
//! Blocks live in an arena keyed by [`BlockId`]. A block's payload is either
//! raw or compressed, never both:
//!
//! ```text
//! Free ─malloc─→ Uncompressed ─idle scan─→ Compressed
//!                     ↑                        │
//!                     └────────access──────────┘
//! any ─free─→ Free
//! ```
//!
//! Compression happens synchronously in `malloc` for large blocks and in the
//! background idle scan; `access` decompresses on demand.

use super::block::{BlockEntry, BlockId, BlockPayload, BlockState};
use super::compression::{compress, compression_ratio, decompress, CompressionAlgorithm};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type PayloadGuard = lock_api::ArcMutexGuard<parking_lot::RawMutex, BlockPayload>;

/// Mutable view of a block's raw bytes
///
/// Holds the block's payload lock while alive; the idle scan skips the block
/// until the view is dropped.
pub struct BlockView {
    entry: Arc<BlockEntry>,
    guard: PayloadGuard,
    epoch: Instant,
}

impl BlockView {
    pub fn id(&self) -> BlockId {
        self.entry.id
    }
}

impl Deref for BlockView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &*self.guard {
            BlockPayload::Raw(data) => data.as_slice(),
            _ => &[],
        }
    }
}

impl DerefMut for BlockView {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut *self.guard {
            BlockPayload::Raw(data) => data.as_mut_slice(),
            _ => &mut [],
        }
    }
}

impl Drop for BlockView {
    fn drop(&mut self) {
        // Idle time counts from the end of the access
        self.entry.touch(elapsed_ms(self.epoch));
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub active_blocks: usize,
    pub compressed_blocks: usize,
    pub uncompressed_blocks: usize,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub memory_saved: u64,
    pub overall_compression_ratio: f64,
    pub memory_saving_percent: f64,
    pub total_allocations: u64,
    pub compression_operations: u64,
    pub decompression_operations: u64,
    pub compression_failures: u64,
    pub avg_allocation_time_ms: f64,
    pub avg_access_time_ms: f64,
}

#[derive(Debug, Default)]
struct Counters {
    total_allocations: AtomicU64,
    compression_operations: AtomicU64,
    decompression_operations: AtomicU64,
    compression_failures: AtomicU64,
    allocation_nanos: AtomicU64,
    decompression_nanos: AtomicU64,
}

fn elapsed_ms(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// Block allocator that compresses idle blocks in the background
pub struct CompressedAllocator {
    blocks: Mutex<HashMap<BlockId, Arc<BlockEntry>>>,
    next_id: AtomicU64,
    config: AllocatorConfig,
    epoch: Instant,
    counters: Counters,
}

impl CompressedAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        info!(
            level = config.compression_level,
            threshold = config.compression_threshold,
            ratio_threshold = config.compression_ratio_threshold,
            "Compressed allocator initialized"
        );
        Self {
            blocks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            epoch: Instant::now(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocate a zeroed block
    pub fn malloc(&self, size: usize) -> Result<BlockId> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate a zero-sized block".to_string(),
            ));
        }
        self.malloc_from(vec![0; size])
    }

    /// Allocate a block seeded with `data`
    pub fn malloc_from(&self, data: Vec<u8>) -> Result<BlockId> {
        if data.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot allocate a zero-sized block".to_string(),
            ));
        }
        let start = Instant::now();
        let id = BlockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let size = data.len();
        let entry = Arc::new(BlockEntry::new(id, data, elapsed_ms(self.epoch)));

        if size >= self.config.compression_threshold {
            let mut payload = entry.payload.lock();
            self.compress_locked(&entry, &mut payload);
        }

        self.blocks.lock().insert(id, entry);
        self.counters.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .allocation_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        debug!(block = %id, size, "Block allocated");
        Ok(id)
    }

    /// Raw view of a block, decompressing it first if needed
    ///
    /// A view holds the block exclusively. Waiting for another view is
    /// bounded by `access_timeout`, after which [`Error::LockTimeout`] is
    /// returned; this includes a second `access` to the same block from a
    /// thread that still holds a view of it.
    ///
    /// A decompression failure means the block's data is corrupt; it is
    /// returned as the fatal [`Error::Decompression`].
    pub fn access(&self, id: BlockId) -> Result<BlockView> {
        let entry = self.entry(id)?;
        let timeout = self.config.access_timeout();
        let Some(mut guard) = entry.payload.try_lock_arc_for(timeout) else {
            warn!(block = %id, timeout_ms = timeout.as_millis() as u64, "Block still held by another view");
            return Err(Error::LockTimeout(format!(
                "block {} held for more than {:?}",
                id, timeout
            )));
        };

        if let BlockPayload::Compressed(packed) = &*guard {
            let start = Instant::now();
            entry.set_state(BlockState::Locked);
            match decompress(packed, CompressionAlgorithm::Zstd) {
                Ok(raw) => {
                    *guard = BlockPayload::Raw(raw);
                    entry.set_compressed_size(0);
                    entry.set_state(BlockState::Uncompressed);
                    self.counters
                        .decompression_operations
                        .fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .decompression_nanos
                        .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                    metrics::COMPRESSION_OPS
                        .with_label_values(&["decompress", "ok"])
                        .inc();
                }
                Err(e) => {
                    entry.set_state(BlockState::Compressed);
                    metrics::COMPRESSION_OPS
                        .with_label_values(&["decompress", "error"])
                        .inc();
                    error!(block = %id, error = %e, "Block decompression failed");
                    return Err(e);
                }
            }
        }

        if matches!(&*guard, BlockPayload::Free) {
            return Err(Error::ResourceNotFound(id.to_string()));
        }

        entry.touch(elapsed_ms(self.epoch));
        Ok(BlockView {
            entry,
            guard,
            epoch: self.epoch,
        })
    }

    /// Copy of a block's bytes
    pub fn read(&self, id: BlockId) -> Result<Vec<u8>> {
        Ok(self.access(id)?.to_vec())
    }

    /// Free a block; false for unknown or already freed ids
    pub fn free(&self, id: BlockId) -> bool {
        let entry = match self.blocks.lock().remove(&id) {
            Some(entry) => entry,
            None => {
                warn!(block = %id, "Attempted to free an unknown block");
                return false;
            }
        };
        *entry.payload.lock() = BlockPayload::Free;
        entry.set_compressed_size(0);
        entry.set_state(BlockState::Free);
        debug!(block = %id, "Block freed");
        true
    }

    /// Compress blocks idle for at least `idle` (default `auto_compress_after`)
    ///
    /// Busy blocks are skipped rather than waited for.
    pub fn compress_idle_blocks(&self, idle: Option<Duration>) -> usize {
        let idle_ms = idle
            .unwrap_or_else(|| self.config.auto_compress_after())
            .as_millis() as u64;
        let now_ms = elapsed_ms(self.epoch);

        let candidates: Vec<Arc<BlockEntry>> = self
            .blocks
            .lock()
            .values()
            .filter(|entry| {
                entry.state() == BlockState::Uncompressed
                    && entry.original_size() >= self.config.compression_threshold
                    && entry.is_idle(now_ms, idle_ms)
            })
            .cloned()
            .collect();

        if candidates.is_empty() {
            return 0;
        }

        let compressed = candidates
            .par_iter()
            .filter(|entry| {
                let mut payload = match entry.payload.try_lock() {
                    Some(payload) => payload,
                    None => return false,
                };
                // Re-check under the block lock
                if entry.state() != BlockState::Uncompressed || !entry.is_idle(now_ms, idle_ms) {
                    return false;
                }
                self.compress_locked(entry, &mut payload)
            })
            .count();

        if compressed > 0 {
            debug!(compressed, scanned = candidates.len(), "Compressed idle blocks");
        }
        compressed
    }

    /// Try to compress a raw payload; keeps the result only below the ratio threshold
    fn compress_locked(&self, entry: &BlockEntry, payload: &mut BlockPayload) -> bool {
        let raw = match payload {
            BlockPayload::Raw(raw) => raw,
            _ => return false,
        };
        let original = raw.len();

        entry.set_state(BlockState::Locked);
        let packed = match compress(raw.as_slice(), CompressionAlgorithm::Zstd, self.config.compression_level) {
            Ok(packed) => packed,
            Err(e) => {
                entry.set_state(BlockState::Uncompressed);
                self.counters
                    .compression_failures
                    .fetch_add(1, Ordering::Relaxed);
                metrics::COMPRESSION_OPS
                    .with_label_values(&["compress", "error"])
                    .inc();
                warn!(block = %entry.id, error = %e, "Block compression failed");
                return false;
            }
        };

        let ratio = compression_ratio(original, packed.len());
        if ratio > self.config.compression_ratio_threshold {
            entry.set_state(BlockState::Uncompressed);
            debug!(block = %entry.id, ratio, "Compression ratio too poor, block kept raw");
            return false;
        }

        entry.set_compressed_size(packed.len());
        *payload = BlockPayload::Compressed(packed);
        entry.set_state(BlockState::Compressed);
        self.counters
            .compression_operations
            .fetch_add(1, Ordering::Relaxed);
        metrics::COMPRESSION_OPS
            .with_label_values(&["compress", "ok"])
            .inc();
        true
    }

    pub fn block_state(&self, id: BlockId) -> Option<BlockState> {
        self.blocks.lock().get(&id).map(|entry| entry.state())
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    pub fn get_compression_stats(&self) -> CompressionStats {
        let mut stats = CompressionStats::default();
        {
            let blocks = self.blocks.lock();
            stats.active_blocks = blocks.len();
            for entry in blocks.values() {
                let original = entry.original_size() as u64;
                let compressed = entry.compressed_size() as u64;
                stats.total_original_bytes += original;
                if compressed > 0 {
                    stats.compressed_blocks += 1;
                    stats.total_compressed_bytes += compressed;
                    stats.memory_saved += original.saturating_sub(compressed);
                }
            }
        }
        stats.uncompressed_blocks = stats.active_blocks - stats.compressed_blocks;

        // Ratio over the whole arena, counting raw blocks at full size
        let resident = stats.total_original_bytes - stats.memory_saved;
        stats.overall_compression_ratio =
            compression_ratio(stats.total_original_bytes as usize, resident as usize);
        stats.memory_saving_percent = (1.0 - stats.overall_compression_ratio) * 100.0;

        let counters = &self.counters;
        stats.total_allocations = counters.total_allocations.load(Ordering::Relaxed);
        stats.compression_operations = counters.compression_operations.load(Ordering::Relaxed);
        stats.decompression_operations = counters.decompression_operations.load(Ordering::Relaxed);
        stats.compression_failures = counters.compression_failures.load(Ordering::Relaxed);
        if stats.total_allocations > 0 {
            stats.avg_allocation_time_ms = counters.allocation_nanos.load(Ordering::Relaxed) as f64
                / stats.total_allocations as f64
                / 1e6;
        }
        if stats.decompression_operations > 0 {
            stats.avg_access_time_ms = counters.decompression_nanos.load(Ordering::Relaxed) as f64
                / stats.decompression_operations as f64
                / 1e6;
        }

        metrics::COMPRESSED_BLOCKS.set(stats.compressed_blocks as i64);
        stats
    }

    /// Free every block; returns the number freed
    pub fn release_all(&self) -> usize {
        let drained: Vec<Arc<BlockEntry>> = self.blocks.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            *entry.payload.lock() = BlockPayload::Free;
            entry.set_compressed_size(0);
            entry.set_state(BlockState::Free);
        }
        info!(count = drained.len(), "Released all allocator blocks");
        drained.len()
    }

    fn entry(&self, id: BlockId) -> Result<Arc<BlockEntry>> {
        self.blocks
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound(id.to_string()))
    }
}

impl Default for CompressedAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_threshold() -> AllocatorConfig {
        AllocatorConfig {
            compression_threshold: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_second_view_on_same_thread_times_out() -> Result<()> {
        let allocator = CompressedAllocator::new(AllocatorConfig {
            access_timeout_ms: 50,
            ..small_threshold()
        });
        let id = allocator.malloc_from(vec![5; 256])?;

        let view = allocator.access(id)?;
        assert!(matches!(allocator.access(id), Err(Error::LockTimeout(_))));
        assert!(matches!(allocator.read(id), Err(Error::LockTimeout(_))));
        drop(view);

        assert_eq!(allocator.read(id)?, vec![5; 256]);
        Ok(())
    }

    #[test]
    fn test_small_block_stays_raw() -> Result<()> {
        let allocator = CompressedAllocator::new(small_threshold());
        let id = allocator.malloc(100)?;
        assert_eq!(allocator.block_state(id), Some(BlockState::Uncompressed));
        assert_eq!(allocator.read(id)?, vec![0; 100]);
        Ok(())
    }

    #[test]
    fn test_large_repetitive_block_compressed_on_malloc() -> Result<()> {
        let allocator = CompressedAllocator::new(small_threshold());
        let id = allocator.malloc(64 * 1024)?;
        assert_eq!(allocator.block_state(id), Some(BlockState::Compressed));

        let stats = allocator.get_compression_stats();
        assert_eq!(stats.compressed_blocks, 1);
        assert!(stats.total_compressed_bytes < 64 * 1024);
        assert_eq!(stats.compression_operations, 1);
        Ok(())
    }

    #[test]
    fn test_incompressible_block_kept_raw() -> Result<()> {
        let allocator = CompressedAllocator::new(small_threshold());
        // xorshift noise does not compress below the ratio threshold
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        let noise: Vec<u8> = (0..8192)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();

        let id = allocator.malloc_from(noise.clone())?;
        assert_eq!(allocator.block_state(id), Some(BlockState::Uncompressed));
        assert_eq!(allocator.read(id)?, noise);
        Ok(())
    }

    #[test]
    fn test_access_decompresses_and_writes_stick() -> Result<()> {
        let allocator = CompressedAllocator::new(small_threshold());
        let id = allocator.malloc(4096)?;
        assert_eq!(allocator.block_state(id), Some(BlockState::Compressed));

        {
            let mut view = allocator.access(id)?;
            assert_eq!(view.len(), 4096);
            view[0] = 0xAB;
        }
        assert_eq!(allocator.block_state(id), Some(BlockState::Uncompressed));
        assert_eq!(allocator.read(id)?[0], 0xAB);
        assert_eq!(allocator.get_compression_stats().decompression_operations, 1);
        Ok(())
    }

    #[test]
    fn test_idle_scan_recompresses() -> Result<()> {
        let allocator = CompressedAllocator::new(small_threshold());
        let data = b"0123456789abcdef".repeat(512);
        let id = allocator.malloc_from(data.clone())?;
        drop(allocator.access(id)?);

        // Not idle long enough under the default window
        assert_eq!(allocator.compress_idle_blocks(Some(Duration::from_secs(3600))), 0);
        assert_eq!(allocator.compress_idle_blocks(Some(Duration::ZERO)), 1);
        assert_eq!(allocator.block_state(id), Some(BlockState::Compressed));
        assert_eq!(allocator.read(id)?, data);
        Ok(())
    }

    #[test]
    fn test_idle_scan_skips_busy_blocks() -> Result<()> {
        let allocator = CompressedAllocator::new(small_threshold());
        let id = allocator.malloc(4096)?;
        let view = allocator.access(id)?;

        assert_eq!(allocator.compress_idle_blocks(Some(Duration::ZERO)), 0);
        drop(view);
        assert_eq!(allocator.compress_idle_blocks(Some(Duration::ZERO)), 1);
        Ok(())
    }

    #[test]
    fn test_free_and_release_all() -> Result<()> {
        let allocator = CompressedAllocator::new(small_threshold());
        let a = allocator.malloc(10)?;
        let _b = allocator.malloc(4096)?;

        assert!(allocator.free(a));
        assert!(!allocator.free(a));
        assert!(matches!(allocator.access(a), Err(Error::ResourceNotFound(_))));

        assert_eq!(allocator.release_all(), 1);
        assert!(allocator.is_empty());
        assert_eq!(allocator.get_compression_stats().active_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_zero_size_rejected() {
        let allocator = CompressedAllocator::default();
        assert!(matches!(allocator.malloc(0), Err(Error::InvalidArgument(_))));
    }
}
