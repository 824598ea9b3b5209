use crate::value::{native_heap, BlockOwner, ManagedHeap, NativePtr, ObjectHandle};
use tracing::{trace, warn};

/// Something a managed-to-native conversion left for the caller to release
/// once the native call is over.
#[derive(Debug, Clone)]
pub enum CleanupEntry {
    /// A native block (string, nested layout class, BSTR) to free.
    FreeNative(NativePtr),
    /// A SafeHandle whose reference count was raised for the call.
    ReleaseHandle(ObjectHandle),
    /// A managed object that native code may call back into, such as a
    /// delegate; held only so it cannot be collected mid-call.
    KeepAlive(ObjectHandle),
}

impl CleanupEntry {
    pub fn is_allocation(&self) -> bool {
        matches!(self, CleanupEntry::FreeNative(_))
    }

    /// Processes this entry. Failures are logged, never raised.
    pub fn release(self, heap: &mut ManagedHeap) {
        match self {
            CleanupEntry::FreeNative(ptr) => {
                if let Err(e) = native_heap().free(ptr) {
                    warn!("cleanup: {}", e);
                }
            }
            CleanupEntry::ReleaseHandle(h) => {
                if let Err(e) = heap.safe_handle_release(&h) {
                    warn!("cleanup: {}", e);
                }
            }
            CleanupEntry::KeepAlive(_) => {}
        }
    }
}

/// The owner of blocks allocated during a conversion: the cleanup list when
/// one was supplied, otherwise the native buffer itself.
pub(crate) fn block_owner(cleanup: Option<&CleanupList>) -> BlockOwner {
    match cleanup {
        Some(_) => BlockOwner::CleanupList,
        None => BlockOwner::Buffer,
    }
}

/// Append-only list of deferred releases, owned by the caller of one
/// managed-to-native conversion.
#[derive(Debug, Default)]
pub struct CleanupList {
    entries: Vec<CleanupEntry>,
}

impl CleanupList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: CleanupEntry) {
        trace!("cleanup list += {:?}", entry);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CleanupEntry] {
        &self.entries
    }

    /// Processes every entry exactly once and returns how many there were.
    pub fn run(self, heap: &mut ManagedHeap) -> usize {
        let mut count = 0;
        for entry in self {
            entry.release(heap);
            count += 1;
        }
        count
    }
}

impl IntoIterator for CleanupList {
    type Item = CleanupEntry;
    type IntoIter = std::vec::IntoIter<CleanupEntry>;

    fn into_iter(mut self) -> Self::IntoIter {
        std::mem::take(&mut self.entries).into_iter()
    }
}

impl Drop for CleanupList {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                "cleanup list dropped with {} unprocessed entries",
                self.entries.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_processes_each_entry_once() {
        let mut heap = ManagedHeap::new();
        let handle = heap.alloc_safe_handle(7);
        heap.safe_handle_add_ref(&handle).unwrap();

        let block = native_heap().alloc_zeroed(16).unwrap();
        let mut list = CleanupList::new();
        list.push(CleanupEntry::FreeNative(block));
        list.push(CleanupEntry::ReleaseHandle(handle.clone()));
        list.push(CleanupEntry::KeepAlive(handle.clone()));
        assert_eq!(list.len(), 3);
        assert_eq!(list.entries().iter().filter(|e| e.is_allocation()).count(), 1);

        assert_eq!(list.run(&mut heap), 3);
        assert_eq!(heap.safe_handle_state(&handle).unwrap(), (7, 1, false));
    }

    #[test]
    fn entries_can_be_consumed_in_any_order() {
        let mut heap = ManagedHeap::new();
        let a = native_heap().alloc_zeroed(4).unwrap();
        let b = native_heap().alloc_zeroed(4).unwrap();
        let mut list = CleanupList::new();
        list.push(CleanupEntry::FreeNative(a));
        list.push(CleanupEntry::FreeNative(b));
        let mut entries: Vec<_> = list.into_iter().collect();
        entries.reverse();
        for e in entries {
            e.release(&mut heap);
        }
    }
}
