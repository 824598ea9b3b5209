pub mod heap;
pub mod native;

pub use heap::{BoxedValue, HeapObject, ManagedHeap, ObjectHandle};
pub use native::{native_heap, BlockOwner, NativeHeap, NativePtr, POINTER_SIZE};
