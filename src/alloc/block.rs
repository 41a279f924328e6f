//! Block handles and headers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Stable handle to an allocator block; never reused within one allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub(crate) u64);

impl BlockId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Lifecycle state of a block
///
/// `Locked` is transient and brackets every compress/decompress transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    Uncompressed = 1,
    Compressed = 2,
    Locked = 3,
}

impl BlockState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BlockState::Uncompressed,
            2 => BlockState::Compressed,
            3 => BlockState::Locked,
            _ => BlockState::Free,
        }
    }
}

/// The one live backing buffer of a block
#[derive(Debug)]
pub(crate) enum BlockPayload {
    Free,
    Raw(Vec<u8>),
    Compressed(Vec<u8>),
}

/// Block header plus payload
///
/// Header fields are atomics so stats and idle scans can read them without
/// taking the payload lock. They are only written while the payload lock is
/// held.
#[derive(Debug)]
pub(crate) struct BlockEntry {
    pub(crate) id: BlockId,
    state: AtomicU8,
    original_size: AtomicUsize,
    /// Zero unless the resting form is compressed
    compressed_size: AtomicUsize,
    last_access_ms: AtomicU64,
    pub(crate) payload: Arc<lock_api::Mutex<parking_lot::RawMutex, BlockPayload>>,
}

impl BlockEntry {
    pub(crate) fn new(id: BlockId, data: Vec<u8>, now_ms: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(BlockState::Uncompressed as u8),
            original_size: AtomicUsize::new(data.len()),
            compressed_size: AtomicUsize::new(0),
            last_access_ms: AtomicU64::new(now_ms),
            payload: Arc::new(lock_api::Mutex::new(BlockPayload::Raw(data))),
        }
    }

    pub(crate) fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BlockState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn original_size(&self) -> usize {
        self.original_size.load(Ordering::Relaxed)
    }

    pub(crate) fn compressed_size(&self) -> usize {
        self.compressed_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_compressed_size(&self, size: usize) {
        self.compressed_size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
    }

    pub(crate) fn is_idle(&self, now_ms: u64, idle_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_access_ms()) >= idle_ms
    }
}
