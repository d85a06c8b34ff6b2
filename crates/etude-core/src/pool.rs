//! Memory pool for inference-time tensor allocations
//!
//! Region-style allocator with a fixed alignment (at least 32 bytes so
//! every vector backend can load full registers). Buffers released back to
//! the pool land in per-size free lists and satisfy later allocations
//! without touching the system allocator; `reset` drops the free lists and
//! accounting between inference runs.
//!
//! The pool is single-owner and deliberately `!Sync` (interior `Cell` /
//! `RefCell` state): one inference per pool at a time.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;

use log::trace;

use crate::error::{Error, Result};
use crate::tensor::{DType, Storage, Tensor};

/// Minimum (and default) buffer alignment in bytes.
pub const POOL_ALIGNMENT: usize = 32;

/// A heap buffer with guaranteed alignment.
///
/// `len` is the logical byte length; capacity is `len` rounded up to the
/// alignment. The buffer is zeroed on allocation and on reuse.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer is uniquely owned; the raw pointer never aliases.
unsafe impl Send for AlignedBuf {}
// Shared access is read-only through `&AlignedBuf`; no interior mutability.
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocates a zeroed buffer of `len` bytes aligned to `align`.
    pub fn allocate(len: usize, align: usize) -> Result<Self> {
        if !align.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "alignment {align} is not a power of two"
            )));
        }
        let size = len.max(1).next_multiple_of(align);
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::invalid_argument(format!("bad layout: {e}")))?;
        // Safety: layout has non-zero size by construction.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::out_of_memory(format!("{size} byte buffer")))?;
        Ok(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rounded-up capacity in bytes; also the free-list size class.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn as_bytes(&self) -> &[u8] {
        // Safety: ptr is valid for len bytes and uniquely owned.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and we hold &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Views the buffer as `f32` values. Caller guarantees `len % 4 == 0`;
    /// the tensor layer enforces this through the dtype.
    pub fn as_f32(&self) -> &[f32] {
        debug_assert_eq!(self.len % 4, 0);
        // Safety: alignment >= 32 exceeds f32 alignment; len checked above.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const f32, self.len / 4) }
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        debug_assert_eq!(self.len % 4, 0);
        // Safety: as above, with unique access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut f32, self.len / 4) }
    }

    /// Views the buffer as `u16` values (BF16 storage).
    pub fn as_u16(&self) -> &[u16] {
        debug_assert_eq!(self.len % 2, 0);
        // Safety: alignment and length checked as for f32.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u16, self.len / 2) }
    }

    pub fn as_u16_mut(&mut self) -> &mut [u16] {
        debug_assert_eq!(self.len % 2, 0);
        // Safety: as above, with unique access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u16, self.len / 2) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // Safety: ptr/layout came from alloc_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Region allocator feeding tensor allocations during inference.
pub struct MemoryPool {
    alignment: usize,
    capacity: usize,
    in_use: Cell<usize>,
    resident: Cell<usize>,
    peak: Cell<usize>,
    free: RefCell<HashMap<usize, Vec<AlignedBuf>>>,
}

impl MemoryPool {
    /// Pool with the default 32-byte alignment and `capacity` bytes total.
    pub fn new(capacity: usize) -> Self {
        Self {
            alignment: POOL_ALIGNMENT,
            capacity,
            in_use: Cell::new(0),
            resident: Cell::new(0),
            peak: Cell::new(0),
            free: RefCell::new(HashMap::new()),
        }
    }

    /// Pool with a custom alignment (power of two, at least 32).
    pub fn with_alignment(capacity: usize, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() || alignment < POOL_ALIGNMENT {
            return Err(Error::invalid_argument(format!(
                "pool alignment must be a power of two >= {POOL_ALIGNMENT}, got {alignment}"
            )));
        }
        Ok(Self {
            alignment,
            ..Self::new(capacity)
        })
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out (not yet recycled).
    pub fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// Bytes owned by the pool, handed out or parked in free lists.
    pub fn resident(&self) -> usize {
        self.resident.get()
    }

    /// High-water mark of `in_use`.
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Allocates a zeroed tensor of `dtype`/`shape` from the pool.
    pub fn alloc(&self, dtype: DType, shape: &[usize]) -> Result<Tensor> {
        let count: usize = shape.iter().product();
        let buf = self.alloc_raw(dtype.byte_len(count))?;
        Tensor::from_buf(dtype, shape.to_vec(), buf)
    }

    /// Allocates a raw zeroed buffer of `len` bytes, reusing a parked
    /// buffer of the same size class when one exists.
    pub fn alloc_raw(&self, len: usize) -> Result<AlignedBuf> {
        let class = len.max(1).next_multiple_of(self.alignment);

        if let Some(mut buf) = self
            .free
            .borrow_mut()
            .get_mut(&class)
            .and_then(|list| list.pop())
        {
            buf.set_len(len);
            buf.as_bytes_mut().fill(0);
            self.in_use.set(self.in_use.get() + class);
            self.peak.set(self.peak.get().max(self.in_use.get()));
            trace!("pool reuse: {class} bytes");
            return Ok(buf);
        }

        if self.resident.get() + class > self.capacity {
            return Err(Error::out_of_memory(format!(
                "pool capacity {} exceeded by {class} byte request ({} resident)",
                self.capacity,
                self.resident.get()
            )));
        }
        let buf = AlignedBuf::allocate(len, self.alignment)?;
        self.resident.set(self.resident.get() + class);
        self.in_use.set(self.in_use.get() + class);
        self.peak.set(self.peak.get().max(self.in_use.get()));
        Ok(buf)
    }

    /// Returns a tensor's storage to the pool. Shared (externally owned)
    /// storage is simply dropped; the pool never frees external data.
    pub fn recycle(&self, tensor: Tensor) {
        match tensor.into_storage() {
            Storage::Owned(buf) => self.recycle_raw(buf),
            Storage::Shared(_) => {}
        }
    }

    /// Parks a buffer in its size-class free list for reuse.
    pub fn recycle_raw(&self, buf: AlignedBuf) {
        let class = buf.capacity();
        self.in_use.set(self.in_use.get().saturating_sub(class));
        self.free.borrow_mut().entry(class).or_default().push(buf);
    }

    /// Drops all parked buffers and zeroes the accounting. Tensors still
    /// alive keep their storage but are no longer counted against this
    /// pool; by contract the caller drops them before resetting.
    pub fn reset(&self) {
        self.free.borrow_mut().clear();
        self.in_use.set(0);
        self.resident.set(0);
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("alignment", &self.alignment)
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use.get())
            .field("resident", &self.resident.get())
            .field("peak", &self.peak.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buf_alignment() {
        let buf = AlignedBuf::allocate(100, POOL_ALIGNMENT).unwrap();
        assert_eq!(buf.as_bytes().as_ptr() as usize % POOL_ALIGNMENT, 0);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 128);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_alloc_and_recycle_reuses_storage() {
        let pool = MemoryPool::new(1 << 20);
        let t = pool.alloc(DType::F32, &[64]).unwrap();
        let used = pool.in_use();
        assert_eq!(used, 256);

        pool.recycle(t);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.resident(), 256);

        // Same size class comes from the free list, not the allocator.
        let _t2 = pool.alloc(DType::F32, &[64]).unwrap();
        assert_eq!(pool.resident(), 256);
        assert_eq!(pool.in_use(), 256);
    }

    #[test]
    fn test_capacity_overflow_is_oom() {
        let pool = MemoryPool::new(128);
        let err = pool.alloc(DType::F32, &[1024]).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
    }

    #[test]
    fn test_reset_clears_accounting() {
        let pool = MemoryPool::new(1 << 20);
        let t = pool.alloc(DType::F32, &[16]).unwrap();
        pool.recycle(t);
        pool.reset();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.resident(), 0);
        assert!(pool.peak() > 0);
    }

    #[test]
    fn test_recycled_buffer_is_zeroed() {
        let pool = MemoryPool::new(1 << 20);
        let mut t = pool.alloc(DType::F32, &[8]).unwrap();
        t.as_f32_mut().unwrap().fill(3.5);
        pool.recycle(t);
        let t2 = pool.alloc(DType::F32, &[8]).unwrap();
        assert!(t2.as_f32().unwrap().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_bad_alignment_rejected() {
        assert!(MemoryPool::with_alignment(1024, 24).is_err());
        assert!(MemoryPool::with_alignment(1024, 16).is_err());
        assert!(MemoryPool::with_alignment(1024, 64).is_ok());
    }
}
