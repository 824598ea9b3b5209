//! The managed side of a conversion: a small collected heap built on
//! `gc-arena`.
//!
//! Objects are only ever reached through an [`ObjectHandle`], a rooted
//! indirection that is re-resolved on every access. Nothing outside this
//! module sees a `Gc` pointer, so no raw managed address can survive an
//! allocation or a collection.
use crate::{error::HeapError, types::TypeId};
use gc_arena::{
    lock::RefLock, unsafe_empty_collect, Arena, Collect, DynamicRoot, DynamicRootSet, Gc,
    Rootable,
};
use std::collections::BTreeMap;
use tracing::trace;

unsafe_empty_collect!(TypeId);

type ObjectRef<'gc> = Gc<'gc, RefLock<HeapObject<'gc>>>;
type ObjectSlot = Rootable![Gc<'_, RefLock<HeapObject<'_>>>];

/// A primitive stored in a box, as produced by `object` fields holding
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxedValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
}
unsafe_empty_collect!(BoxedValue);

#[derive(Collect)]
#[collect(no_drop)]
pub enum HeapObject<'gc> {
    Instance {
        type_id: TypeId,
        /// Managed field storage. Reference-typed fields keep a zeroed
        /// pointer-sized hole here and live in `refs` keyed by the same
        /// offset.
        data: Vec<u8>,
        refs: BTreeMap<usize, ObjectRef<'gc>>,
    },
    Str(Vec<u16>),
    Array {
        element_size: usize,
        data: Vec<u8>,
    },
    Delegate {
        target: usize,
    },
    SafeHandle {
        handle: usize,
        ref_count: u32,
        closed: bool,
    },
    ComObject {
        iunknown: usize,
    },
    Boxed(BoxedValue),
}

impl HeapObject<'_> {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Instance { .. } => "instance",
            HeapObject::Str(_) => "string",
            HeapObject::Array { .. } => "array",
            HeapObject::Delegate { .. } => "delegate",
            HeapObject::SafeHandle { .. } => "SafeHandle",
            HeapObject::ComObject { .. } => "COM object",
            HeapObject::Boxed(_) => "boxed value",
        }
    }
}

fn wrong_kind(expected: &'static str, actual: &HeapObject<'_>) -> HeapError {
    HeapError::WrongKind {
        expected,
        actual: actual.kind_name(),
    }
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<(), HeapError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(HeapError::OutOfBounds { offset, len, size }),
    }
}

/// Everything that can be allocated, minus the `'gc` brand.
enum NewObject {
    Instance { type_id: TypeId, size: usize },
    Str(Vec<u16>),
    Array { element_size: usize, data: Vec<u8> },
    Delegate(usize),
    SafeHandle(usize),
    ComObject(usize),
    Boxed(BoxedValue),
}

impl NewObject {
    fn into_object<'gc>(self) -> HeapObject<'gc> {
        match self {
            NewObject::Instance { type_id, size } => HeapObject::Instance {
                type_id,
                data: vec![0; size],
                refs: BTreeMap::new(),
            },
            NewObject::Str(chars) => HeapObject::Str(chars),
            NewObject::Array { element_size, data } => HeapObject::Array { element_size, data },
            NewObject::Delegate(target) => HeapObject::Delegate { target },
            NewObject::SafeHandle(handle) => HeapObject::SafeHandle {
                handle,
                ref_count: 1,
                closed: false,
            },
            NewObject::ComObject(iunknown) => HeapObject::ComObject { iunknown },
            NewObject::Boxed(v) => HeapObject::Boxed(v),
        }
    }
}

/// A rooted, non-relocating reference to a managed object. Cloning yields
/// another root for the same object; the object stays alive as long as any
/// handle to it does.
#[derive(Clone)]
pub struct ObjectHandle(DynamicRoot<ObjectSlot>);

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ObjectHandle(..)")
    }
}

#[derive(Collect)]
#[collect(no_drop)]
struct HeapRoots<'gc> {
    roots: DynamicRootSet<'gc>,
}

type HeapArena = Arena<Rootable![HeapRoots<'_>]>;

pub struct ManagedHeap {
    arena: HeapArena,
    gc_stress: bool,
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedHeap {
    pub fn new() -> Self {
        Self {
            arena: HeapArena::new(|mc| HeapRoots {
                roots: DynamicRootSet::new(mc),
            }),
            gc_stress: false,
        }
    }

    /// Runs a full collection after every allocation.
    pub fn with_gc_stress(mut self, enabled: bool) -> Self {
        self.gc_stress = enabled;
        self
    }

    fn alloc(&mut self, new: NewObject) -> ObjectHandle {
        let handle = self.arena.mutate(|mc, root| {
            ObjectHandle(root.roots.stash(mc, Gc::new(mc, RefLock::new(new.into_object()))))
        });
        if self.gc_stress {
            self.collect();
        } else {
            self.arena.collect_debt();
        }
        handle
    }

    pub fn collect(&mut self) {
        trace!("collecting managed heap");
        self.arena.collect_all();
    }

    pub fn alloc_instance(&mut self, type_id: TypeId, size: usize) -> ObjectHandle {
        self.alloc(NewObject::Instance { type_id, size })
    }

    pub fn alloc_string(&mut self, s: &str) -> ObjectHandle {
        self.alloc_utf16(s.encode_utf16().collect())
    }

    pub fn alloc_utf16(&mut self, chars: Vec<u16>) -> ObjectHandle {
        self.alloc(NewObject::Str(chars))
    }

    pub fn alloc_array(&mut self, element_size: usize, len: usize) -> ObjectHandle {
        self.alloc_array_from(element_size, vec![0; element_size * len])
    }

    pub fn alloc_array_from(&mut self, element_size: usize, data: Vec<u8>) -> ObjectHandle {
        self.alloc(NewObject::Array { element_size, data })
    }

    pub fn alloc_delegate(&mut self, target: usize) -> ObjectHandle {
        self.alloc(NewObject::Delegate(target))
    }

    pub fn alloc_safe_handle(&mut self, handle: usize) -> ObjectHandle {
        self.alloc(NewObject::SafeHandle(handle))
    }

    pub fn alloc_com_object(&mut self, iunknown: usize) -> ObjectHandle {
        self.alloc(NewObject::ComObject(iunknown))
    }

    pub fn alloc_boxed(&mut self, value: BoxedValue) -> ObjectHandle {
        self.alloc(NewObject::Boxed(value))
    }

    pub fn with_object<T>(&self, h: &ObjectHandle, f: impl FnOnce(&HeapObject<'_>) -> T) -> T {
        self.arena
            .mutate(|_, root| f(&root.roots.fetch(&h.0).borrow()))
    }

    fn with_object_mut<T>(
        &mut self,
        h: &ObjectHandle,
        f: impl FnOnce(&mut HeapObject<'_>) -> T,
    ) -> T {
        self.arena
            .mutate(|mc, root| f(&mut root.roots.fetch(&h.0).borrow_mut(mc)))
    }

    pub fn kind(&self, h: &ObjectHandle) -> &'static str {
        self.with_object(h, |o| o.kind_name())
    }

    pub fn same_object(&self, a: &ObjectHandle, b: &ObjectHandle) -> bool {
        self.arena
            .mutate(|_, root| Gc::ptr_eq(*root.roots.fetch(&a.0), *root.roots.fetch(&b.0)))
    }

    pub fn instance_type(&self, h: &ObjectHandle) -> Result<TypeId, HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::Instance { type_id, .. } => Ok(*type_id),
            other => Err(wrong_kind("instance", other)),
        })
    }

    /// Reads `len` bytes of unwrapped instance storage.
    pub fn read_bytes(
        &self,
        h: &ObjectHandle,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::Instance { data, .. } => {
                check_range(offset, len, data.len())?;
                Ok(data[offset..offset + len].to_vec())
            }
            other => Err(wrong_kind("instance", other)),
        })
    }

    pub fn write_bytes(
        &mut self,
        h: &ObjectHandle,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), HeapError> {
        self.with_object_mut(h, |o| match o {
            HeapObject::Instance { data, .. } => {
                check_range(offset, bytes.len(), data.len())?;
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            other => Err(wrong_kind("instance", other)),
        })
    }

    /// Loads the object reference stored at `offset` of an instance.
    pub fn read_ref(
        &self,
        h: &ObjectHandle,
        offset: usize,
    ) -> Result<Option<ObjectHandle>, HeapError> {
        self.arena.mutate(|mc, root| {
            let obj = root.roots.fetch(&h.0).borrow();
            match &*obj {
                HeapObject::Instance { refs, .. } => Ok(refs
                    .get(&offset)
                    .map(|r| ObjectHandle(root.roots.stash(mc, *r)))),
                other => Err(wrong_kind("instance", other)),
            }
        })
    }

    pub fn write_ref(
        &mut self,
        h: &ObjectHandle,
        offset: usize,
        value: Option<&ObjectHandle>,
    ) -> Result<(), HeapError> {
        self.arena.mutate(|mc, root| {
            let target = value.map(|v| *root.roots.fetch(&v.0));
            let mut obj = root.roots.fetch(&h.0).borrow_mut(mc);
            match &mut *obj {
                HeapObject::Instance { refs, .. } => {
                    match target {
                        Some(t) => refs.insert(offset, t),
                        None => refs.remove(&offset),
                    };
                    Ok(())
                }
                other => Err(wrong_kind("instance", other)),
            }
        })
    }

    pub fn string_chars(&self, h: &ObjectHandle) -> Result<Vec<u16>, HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::Str(chars) => Ok(chars.clone()),
            other => Err(wrong_kind("string", other)),
        })
    }

    pub fn string_value(&self, h: &ObjectHandle) -> Result<String, HeapError> {
        Ok(String::from_utf16_lossy(&self.string_chars(h)?))
    }

    /// Element count and raw element bytes of an array.
    pub fn array_data(&self, h: &ObjectHandle) -> Result<(usize, Vec<u8>), HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::Array { element_size, data } => {
                Ok((data.len() / (*element_size).max(1), data.clone()))
            }
            other => Err(wrong_kind("array", other)),
        })
    }

    pub fn array_element_size(&self, h: &ObjectHandle) -> Result<usize, HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::Array { element_size, .. } => Ok(*element_size),
            other => Err(wrong_kind("array", other)),
        })
    }

    pub fn array_len(&self, h: &ObjectHandle) -> Result<usize, HeapError> {
        Ok(self.array_data(h)?.0)
    }

    pub fn write_array(&mut self, h: &ObjectHandle, bytes: &[u8]) -> Result<(), HeapError> {
        self.with_object_mut(h, |o| match o {
            HeapObject::Array { data, .. } => {
                check_range(0, bytes.len(), data.len())?;
                data[..bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            other => Err(wrong_kind("array", other)),
        })
    }

    pub fn delegate_target(&self, h: &ObjectHandle) -> Result<usize, HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::Delegate { target } => Ok(*target),
            other => Err(wrong_kind("delegate", other)),
        })
    }

    /// Takes a reference on the handle for the duration of a native call and
    /// returns the raw handle value.
    pub fn safe_handle_add_ref(&mut self, h: &ObjectHandle) -> Result<usize, HeapError> {
        self.with_object_mut(h, |o| match o {
            HeapObject::SafeHandle { closed: true, .. } => Err(HeapError::SafeHandleClosed),
            HeapObject::SafeHandle {
                handle, ref_count, ..
            } => {
                *ref_count += 1;
                Ok(*handle)
            }
            other => Err(wrong_kind("SafeHandle", other)),
        })
    }

    pub fn safe_handle_release(&mut self, h: &ObjectHandle) -> Result<(), HeapError> {
        self.with_object_mut(h, |o| match o {
            HeapObject::SafeHandle { ref_count, .. } => {
                *ref_count = ref_count.saturating_sub(1);
                Ok(())
            }
            other => Err(wrong_kind("SafeHandle", other)),
        })
    }

    pub fn close_safe_handle(&mut self, h: &ObjectHandle) -> Result<(), HeapError> {
        self.with_object_mut(h, |o| match o {
            HeapObject::SafeHandle { closed, .. } => {
                *closed = true;
                Ok(())
            }
            other => Err(wrong_kind("SafeHandle", other)),
        })
    }

    /// `(handle, ref_count, closed)`
    pub fn safe_handle_state(&self, h: &ObjectHandle) -> Result<(usize, u32, bool), HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::SafeHandle {
                handle,
                ref_count,
                closed,
            } => Ok((*handle, *ref_count, *closed)),
            other => Err(wrong_kind("SafeHandle", other)),
        })
    }

    pub fn com_pointer(&self, h: &ObjectHandle) -> Result<usize, HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::ComObject { iunknown } => Ok(*iunknown),
            other => Err(wrong_kind("COM object", other)),
        })
    }

    pub fn boxed_value(&self, h: &ObjectHandle) -> Result<BoxedValue, HeapError> {
        self.with_object(h, |o| match o {
            HeapObject::Boxed(v) => Ok(*v),
            other => Err(wrong_kind("boxed value", other)),
        })
    }
}
