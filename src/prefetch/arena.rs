//! Ref-counted shared-memory buffer pool
//!
//! The arena is a single shared mapping split into `nslots` equal slots.
//! The parent pops a free slot index before submitting a job, the worker
//! fills the slot, and the consumer ends up holding a [`SlotHandle`] that
//! keeps the slot out of the free set until the last reference drops.
//! Release is deterministic (handle drop), so there is no sweep pass: an
//! empty free set means the consumer genuinely holds too many items.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ Result, SlipstreamError };
use crate::prefetch::shm::ShmRegion;

/// Fixed-size shared-memory buffer pool
pub(crate) struct SharedArena {
    region: Arc<ShmRegion>,
    free: Arc<Mutex<Vec<u32>>>,
    slot_size: usize,
}

impl SharedArena {
    /// Allocate `size` shared bytes split into `nslots` equal slots.
    pub fn new(size: usize, nslots: usize) -> Result<Self> {
        let slot_size = size / nslots;
        if slot_size == 0 {
            return Err(
                SlipstreamError::config(format!(
                    "shm_size of {size} bytes leaves no room for {nslots} buffer slots"
                ))
            );
        }
        let region = Arc::new(ShmRegion::new(slot_size * nslots)?);
        let free: Vec<u32> = (0..nslots as u32).rev().collect();
        Ok(Self {
            region,
            free: Arc::new(Mutex::new(free)),
            slot_size,
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Pop a free slot, if any.
    pub fn fetch(&self) -> Option<u32> {
        self.free.lock().pop()
    }

    /// Return a slot to the free set without going through a handle, used
    /// when a job assigned a slot but its result came back serialized.
    pub fn release(&self, index: u32) {
        self.free.lock().push(index);
    }

    /// Wrap a fetched slot into a ref-counted handle; the slot rejoins the
    /// free set when the last clone drops.
    pub fn handle(&self, index: u32) -> Arc<SlotHandle> {
        Arc::new(SlotHandle {
            region: self.region.clone(),
            free: self.free.clone(),
            slot_size: self.slot_size,
            index,
        })
    }

    /// Borrow a slot for writing.
    ///
    /// # Safety
    ///
    /// Only the worker the slot was assigned to may call this, and only
    /// before reporting the job complete.
    pub unsafe fn slot_mut(&self, index: u32) -> &mut [u8] {
        self.region.slice_mut(index as usize * self.slot_size, self.slot_size)
    }
}

/// Ref-counted reference to one arena slot.
///
/// Values reconstructed from the slot borrow their buffer bytes from it,
/// so the slot stays allocated for as long as any of them is alive. The
/// mapping itself outlives the arena while handles remain.
pub struct SlotHandle {
    region: Arc<ShmRegion>,
    free: Arc<Mutex<Vec<u32>>>,
    slot_size: usize,
    index: u32,
}

impl SlotHandle {
    /// The slot's bytes; stable for the lifetime of the handle.
    pub(crate) fn bytes(&self) -> &[u8] {
        unsafe { self.region.slice(self.index as usize * self.slot_size, self.slot_size) }
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.free.lock().push(self.index);
    }
}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("index", &self.index)
            .field("slot_size", &self.slot_size)
            .finish()
    }
}

/// Shared view of an arena slot handed to value reconstruction.
pub struct SlotView {
    handle: Arc<SlotHandle>,
}

impl SlotView {
    pub(crate) fn new(handle: Arc<SlotHandle>) -> Self {
        Self { handle }
    }

    /// The slot's bytes.
    pub fn bytes(&self) -> &[u8] {
        self.handle.bytes()
    }

    /// A zero-copy byte container over `[offset, offset + len)` of the
    /// slot, keeping the slot allocated while it lives.
    pub fn shared_bytes(&self, offset: usize, len: usize) -> Result<crate::value::Bytes> {
        if offset + len > self.handle.bytes().len() {
            return Err(
                SlipstreamError::serialization(format!(
                    "packed range {offset}..{} escapes a slot of {} bytes",
                    offset + len,
                    self.handle.bytes().len()
                ))
            );
        }
        Ok(crate::value::Bytes::shared(self.handle.clone(), offset, len))
    }
}
