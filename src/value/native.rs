//! Native (unmanaged) memory used for out-of-line data such as strings and
//! nested layout classes.
//!
//! Every block handed out is tracked so that pointer fields read back from a
//! native buffer can be validated before they are dereferenced.
use crate::error::NativeError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    alloc::{self, Layout},
    collections::{BTreeMap, HashMap},
    fmt,
    sync::OnceLock,
};
use tracing::trace;

const BLOCK_ALIGN: usize = 16;
pub const POINTER_SIZE: usize = size_of::<usize>();

/// An address in native memory, stored in native buffers as a
/// pointer-sized little-endian word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NativePtr(pub usize);

impl NativePtr {
    pub const NULL: NativePtr = NativePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, by: usize) -> NativePtr {
        NativePtr(self.0 + by)
    }

    pub fn read_from(bytes: &[u8]) -> NativePtr {
        let mut word = [0u8; POINTER_SIZE];
        word.copy_from_slice(&bytes[..POINTER_SIZE]);
        NativePtr(usize::from_le_bytes(word))
    }

    pub fn write_to(self, bytes: &mut [u8]) {
        bytes[..POINTER_SIZE].copy_from_slice(&self.0.to_le_bytes());
    }
}

impl fmt::Debug for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePtr({:#x})", self.0)
    }
}

/// Who releases a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOwner {
    /// Freed explicitly by whoever allocated it.
    Caller,
    /// Freed when the native buffer pointing at it is destroyed.
    Buffer,
    /// Freed by a cleanup list entry; destroying the buffer leaves it alone.
    CleanupList,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    layout: Layout,
    owner: BlockOwner,
}

pub struct NativeHeap {
    blocks: Mutex<BTreeMap<usize, Block>>,
    /// Released cleanup-list blocks by layout. They are only handed out again
    /// to cleanup lists, so a pointer left in a buffer after its list ran can
    /// never land on a block the buffer side owns.
    list_pool: Mutex<HashMap<Layout, Vec<usize>>>,
}

static NATIVE_HEAP: OnceLock<NativeHeap> = OnceLock::new();

/// The process-wide native allocator (the `CoTaskMemAlloc` of this crate).
pub fn native_heap() -> &'static NativeHeap {
    NATIVE_HEAP.get_or_init(NativeHeap::new)
}

impl NativeHeap {
    fn new() -> Self {
        Self {
            blocks: Mutex::new(BTreeMap::new()),
            list_pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn alloc_zeroed(&self, size: usize) -> Result<NativePtr, NativeError> {
        self.alloc_owned(size, BlockOwner::Caller)
    }

    pub fn alloc_owned(&self, size: usize, owner: BlockOwner) -> Result<NativePtr, NativeError> {
        let layout = Layout::from_size_align(size.max(1), BLOCK_ALIGN)
            .map_err(|_| NativeError::OutOfMemory(size))?;
        let pooled = match owner {
            BlockOwner::CleanupList => self.list_pool.lock().get_mut(&layout).and_then(Vec::pop),
            _ => None,
        };
        let addr = match pooled {
            Some(addr) => {
                // SAFETY: pooled blocks stay allocated with exactly this layout.
                unsafe { std::ptr::write_bytes(addr as *mut u8, 0, layout.size()) };
                addr
            }
            None => {
                // SAFETY: layout has non-zero size.
                let ptr = unsafe { alloc::alloc_zeroed(layout) };
                if ptr.is_null() {
                    return Err(NativeError::OutOfMemory(size));
                }
                ptr as usize
            }
        };
        self.blocks.lock().insert(addr, Block { layout, owner });
        trace!("native alloc {:#x} ({} bytes, {:?})", addr, size, owner);
        Ok(NativePtr(addr))
    }

    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<NativePtr, NativeError> {
        self.alloc_bytes_owned(bytes, BlockOwner::Caller)
    }

    pub fn alloc_bytes_owned(&self, bytes: &[u8], owner: BlockOwner) -> Result<NativePtr, NativeError> {
        let ptr = self.alloc_owned(bytes.len(), owner)?;
        self.write(ptr, bytes)?;
        Ok(ptr)
    }

    /// Releases the block starting at `ptr`, whoever owns it.
    pub fn free(&self, ptr: NativePtr) -> Result<(), NativeError> {
        let block = self
            .blocks
            .lock()
            .remove(&ptr.0)
            .ok_or(NativeError::UnknownAllocation(ptr.0))?;
        self.release(ptr, block);
        Ok(())
    }

    /// Releases the block starting at `ptr` only if `owner` owns it.
    /// Returns whether it was released.
    pub fn free_owned(&self, ptr: NativePtr, owner: BlockOwner) -> Result<bool, NativeError> {
        let block = {
            let mut blocks = self.blocks.lock();
            let block = *blocks
                .get(&ptr.0)
                .ok_or(NativeError::UnknownAllocation(ptr.0))?;
            if block.owner != owner {
                return Ok(false);
            }
            blocks.remove(&ptr.0);
            block
        };
        self.release(ptr, block);
        Ok(true)
    }

    fn release(&self, ptr: NativePtr, block: Block) {
        trace!("native free {:#x} ({:?})", ptr.0, block.owner);
        if block.owner == BlockOwner::CleanupList {
            self.list_pool.lock().entry(block.layout).or_default().push(ptr.0);
            return;
        }
        // SAFETY: the block was produced by alloc_owned with this layout and
        // has just been unregistered, so it cannot be freed twice.
        unsafe { alloc::dealloc(ptr.0 as *mut u8, block.layout) };
    }

    pub fn owner(&self, ptr: NativePtr) -> Option<BlockOwner> {
        self.blocks.lock().get(&ptr.0).map(|b| b.owner)
    }

    pub fn is_live(&self, ptr: NativePtr) -> bool {
        self.blocks.lock().contains_key(&ptr.0)
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Bytes available from `ptr` to the end of the block containing it.
    fn remaining(&self, ptr: NativePtr) -> Result<usize, NativeError> {
        let blocks = self.blocks.lock();
        let (start, block) = blocks
            .range(..=ptr.0)
            .next_back()
            .ok_or(NativeError::UnknownAllocation(ptr.0))?;
        let end = start + block.layout.size();
        if ptr.0 >= end {
            return Err(NativeError::UnknownAllocation(ptr.0));
        }
        Ok(end - ptr.0)
    }

    pub fn read(&self, ptr: NativePtr, len: usize) -> Result<Vec<u8>, NativeError> {
        if len == 0 {
            return Ok(vec![]);
        }
        if self.remaining(ptr)? < len {
            return Err(NativeError::UnknownAllocation(ptr.0 + len - 1));
        }
        // SAFETY: [ptr, ptr + len) lies inside a live tracked block.
        Ok(unsafe { std::slice::from_raw_parts(ptr.0 as *const u8, len) }.to_vec())
    }

    pub fn write(&self, ptr: NativePtr, bytes: &[u8]) -> Result<(), NativeError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.remaining(ptr)? < bytes.len() {
            return Err(NativeError::UnknownAllocation(ptr.0 + bytes.len() - 1));
        }
        // SAFETY: the destination lies inside a live tracked block which this
        // crate never hands out as a Rust reference.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.0 as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// Reads `unit`-byte code units up to (not including) the first all-zero
    /// unit, or to the end of the block.
    pub fn read_terminated(&self, ptr: NativePtr, unit: usize) -> Result<Vec<u8>, NativeError> {
        let available = self.remaining(ptr)?;
        let bytes = self.read(ptr, available - available % unit)?;
        let end = bytes
            .chunks_exact(unit)
            .position(|c| c.iter().all(|b| *b == 0))
            .map(|i| i * unit)
            .unwrap_or(bytes.len());
        Ok(bytes[..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_read_write_free() {
        let heap = native_heap();
        let p = heap.alloc_zeroed(8).unwrap();
        assert!(heap.is_live(p));
        assert_eq!(heap.read(p, 8).unwrap(), vec![0; 8]);
        heap.write(p.offset(2), &[1, 2, 3]).unwrap();
        assert_eq!(heap.read(p, 6).unwrap(), vec![0, 0, 1, 2, 3, 0]);
        heap.free(p).unwrap();
    }

    #[test]
    fn out_of_bounds_access_rejected() {
        let heap = native_heap();
        let p = heap.alloc_zeroed(4).unwrap();
        assert!(heap.read(p, 32).is_err());
        assert!(heap.write(p.offset(3), &[1, 2]).is_err());
        heap.free(p).unwrap();
        assert_eq!(
            heap.free(NativePtr(8)),
            Err(NativeError::UnknownAllocation(8))
        );
    }

    #[test]
    fn owned_frees_respect_the_owner() {
        let heap = native_heap();
        let p = heap.alloc_owned(8, BlockOwner::CleanupList).unwrap();
        assert_eq!(heap.owner(p), Some(BlockOwner::CleanupList));
        assert_eq!(heap.free_owned(p, BlockOwner::Buffer), Ok(false));
        assert!(heap.is_live(p));
        heap.free(p).unwrap();
        assert_eq!(heap.owner(p), None);

        let q = heap.alloc_bytes_owned(&[1, 2], BlockOwner::Buffer).unwrap();
        assert_eq!(heap.free_owned(q, BlockOwner::Buffer), Ok(true));
        assert!(heap.free_owned(q, BlockOwner::Buffer).is_err());
    }

    #[test]
    fn released_list_blocks_only_return_to_lists() {
        let heap = native_heap();
        let listed = heap.alloc_bytes_owned(&[7; 24], BlockOwner::CleanupList).unwrap();
        heap.free(listed).unwrap();
        assert!(!heap.is_live(listed));

        let buffers: Vec<_> = (0..16)
            .map(|_| heap.alloc_owned(24, BlockOwner::Buffer).unwrap())
            .collect();
        assert!(!buffers.contains(&listed));

        let again = heap.alloc_owned(24, BlockOwner::CleanupList).unwrap();
        assert_eq!(heap.read(again, 24).unwrap(), vec![0; 24]);
        for p in buffers.into_iter().chain([again]) {
            heap.free(p).unwrap();
        }
    }

    #[test]
    fn terminated_reads() {
        let heap = native_heap();
        let p = heap.alloc_bytes(&[b'h', 0, b'i', 0, 0, 0, 7, 7]).unwrap();
        assert_eq!(heap.read_terminated(p, 2).unwrap(), vec![b'h', 0, b'i', 0]);
        assert_eq!(heap.read_terminated(p, 1).unwrap(), vec![b'h']);
        heap.free(p).unwrap();
    }

    #[test]
    fn pointer_words() {
        let mut buf = [0u8; 16];
        NativePtr(0x1234).write_to(&mut buf[4..]);
        assert_eq!(NativePtr::read_from(&buf[4..]), NativePtr(0x1234));
        assert!(NativePtr::read_from(&[0u8; POINTER_SIZE]).is_null());
    }
}
