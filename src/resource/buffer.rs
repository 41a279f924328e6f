//! Built-in managed resources
//!
//! `ByteBuffer` carries its compressed/plain state as an explicit enum so a
//! pressure pass can shrink it without the owner noticing anything beyond a
//! decompression on next read.

use super::{Backup, ManagedResource};
use crate::alloc::compression::{compress, decompress, CompressionAlgorithm};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::any::Any;
use tracing::debug;

/// Contents of a [`ByteBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferState {
    Plain(Vec<u8>),
    Compressed { data: Vec<u8>, original_len: usize },
}

/// Byte payload that can be compressed in place
#[derive(Debug)]
pub struct ByteBuffer {
    state: RwLock<BufferState>,
}

impl ByteBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            state: RwLock::new(BufferState::Plain(data)),
        }
    }

    /// Logical (uncompressed) length
    pub fn len(&self) -> usize {
        match &*self.state.read() {
            BufferState::Plain(data) => data.len(),
            BufferState::Compressed { original_len, .. } => *original_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held in memory
    pub fn resident_len(&self) -> usize {
        match &*self.state.read() {
            BufferState::Plain(data) => data.len(),
            BufferState::Compressed { data, .. } => data.len(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(&*self.state.read(), BufferState::Compressed { .. })
    }

    /// Copy of the logical contents
    pub fn read(&self) -> Result<Vec<u8>> {
        match &*self.state.read() {
            BufferState::Plain(data) => Ok(data.clone()),
            BufferState::Compressed { data, .. } => decompress(data, CompressionAlgorithm::Zstd),
        }
    }

    /// Mutate the contents, decompressing first if needed
    pub fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<u8>) -> T,
    {
        let mut state = self.state.write();
        if let BufferState::Compressed { data, .. } = &*state {
            let plain = decompress(data, CompressionAlgorithm::Zstd)?;
            *state = BufferState::Plain(plain);
        }
        match &mut *state {
            BufferState::Plain(data) => Ok(f(data)),
            BufferState::Compressed { .. } => {
                Err(Error::Internal("buffer still compressed after inflate".into()))
            }
        }
    }
}

impl ManagedResource for ByteBuffer {
    fn size_bytes(&self) -> Option<u64> {
        Some(self.resident_len() as u64)
    }

    fn backup(&self) -> Option<Backup> {
        self.read().ok().map(Backup::Bytes)
    }

    fn restore(&self, backup: &Backup) -> Result<()> {
        match backup {
            Backup::Bytes(bytes) => {
                *self.state.write() = BufferState::Plain(bytes.clone());
                Ok(())
            }
            other => Err(Error::SnapshotUnavailable(format!(
                "cannot restore a byte buffer from a {} backup",
                other.kind()
            ))),
        }
    }

    fn compress(&self, level: i32) -> Result<Option<u64>> {
        let mut state = self.state.write();
        let plain = match &*state {
            BufferState::Plain(data) if !data.is_empty() => data,
            _ => return Ok(None),
        };

        let packed = compress(plain, CompressionAlgorithm::Zstd, level)?;
        if packed.len() >= plain.len() {
            debug!(len = plain.len(), "Buffer did not shrink, keeping plain form");
            return Ok(None);
        }

        let original_len = plain.len();
        let saved = (original_len - packed.len()) as u64;
        *state = BufferState::Compressed {
            data: packed,
            original_len,
        };
        Ok(Some(saved))
    }

    fn on_release(&self) {
        *self.state.write() = BufferState::Plain(Vec::new());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Structured value resource (configs, parsed documents, lookup tables)
#[derive(Debug)]
pub struct ValueResource {
    value: RwLock<serde_json::Value>,
}

impl ValueResource {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    pub fn get(&self) -> serde_json::Value {
        self.value.read().clone()
    }

    pub fn set(&self, value: serde_json::Value) {
        *self.value.write() = value;
    }

    pub fn update<F: FnOnce(&mut serde_json::Value)>(&self, f: F) {
        f(&mut self.value.write());
    }
}

impl ManagedResource for ValueResource {
    fn size_bytes(&self) -> Option<u64> {
        serde_json::to_vec(&*self.value.read())
            .ok()
            .map(|v| v.len() as u64)
    }

    fn backup(&self) -> Option<Backup> {
        Some(Backup::Value(self.get()))
    }

    fn restore(&self, backup: &Backup) -> Result<()> {
        match backup {
            Backup::Value(value) => {
                self.set(value.clone());
                Ok(())
            }
            other => Err(Error::SnapshotUnavailable(format!(
                "cannot restore a value resource from a {} backup",
                other.kind()
            ))),
        }
    }

    fn on_release(&self) {
        self.set(serde_json::Value::Null);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
