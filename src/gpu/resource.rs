//! Buffer handles and lifetime categories.
//!
//! Buffers are single-owner: the handle owns the allocation and drops
//! it with the handle. Scratch memory for acceleration-structure
//! builds is a distinct type so "discardable after the build has
//! completed" is visible in signatures rather than a comment on a
//! generic buffer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Memory heap a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Device-only memory. Not CPU-mappable.
    DeviceLocal,
    /// CPU-writable upload memory (instance descriptors, dispatch
    /// tables, per-frame constants, light samples).
    Upload,
    /// CPU-readable memory for downloads (frame capture).
    Readback,
}

/// GPU virtual address of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuAddress(pub(crate) u64);

impl GpuAddress {
    /// Raw address value, e.g. for a root-parameter word.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Address `offset` bytes into the resource.
    pub fn offset(&self, offset: u64) -> GpuAddress {
        GpuAddress(self.0 + offset)
    }
}

pub(crate) struct BufferStorage {
    pub(crate) label: String,
    pub(crate) heap: HeapKind,
    pub(crate) data: RwLock<Vec<u8>>,
}

/// Registry of live allocations, keyed by start address. The device
/// executor resolves command-recorded addresses through this.
pub(crate) type BufferRegistry = Mutex<HashMap<u64, Arc<BufferStorage>>>;

/// Owned GPU buffer. Dropping the handle releases the allocation.
pub struct Buffer {
    address: GpuAddress,
    size: u64,
    storage: Arc<BufferStorage>,
    registry: Weak<BufferRegistry>,
}

impl Buffer {
    pub(crate) fn new(
        address: GpuAddress,
        size: u64,
        storage: Arc<BufferStorage>,
        registry: Weak<BufferRegistry>,
    ) -> Self {
        Self {
            address,
            size,
            storage,
            registry,
        }
    }

    pub fn address(&self) -> GpuAddress {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn heap(&self) -> HeapKind {
        self.storage.heap
    }

    pub fn label(&self) -> &str {
        &self.storage.label
    }

    /// Write bytes through the CPU mapping. Upload heap only.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.heap() != HeapKind::Upload {
            return Err(Error::NotCpuVisible(self.label().to_string()));
        }
        self.check_range(offset, bytes.len() as u64)?;
        let mut data = self.storage.data.write();
        data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read bytes through the CPU mapping. Upload and readback heaps only.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if self.heap() == HeapKind::DeviceLocal {
            return Err(Error::NotCpuVisible(self.label().to_string()));
        }
        self.check_range(offset, len)?;
        let data = self.storage.data.read();
        Ok(data[offset as usize..(offset + len) as usize].to_vec())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        if offset + len > self.size {
            return Err(Error::OutOfBounds {
                label: self.label().to_string(),
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.address.0);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label())
            .field("address", &self.address)
            .field("size", &self.size)
            .field("heap", &self.heap())
            .finish()
    }
}

/// Scratch memory for an acceleration-structure build. Discardable
/// once the build submission is known to have completed; kept distinct
/// from [`Buffer`] so the transient lifetime is explicit.
#[derive(Debug)]
pub struct ScratchBuffer(pub(crate) Buffer);

impl ScratchBuffer {
    pub fn address(&self) -> GpuAddress {
        self.0.address()
    }

    pub fn size(&self) -> u64 {
        self.0.size()
    }
}
