//! Host object header and reference counting
//!
//! Every host value starts with a [`HostObject`] header: the reference
//! count at offset zero and the type pointer right after. Emitted code
//! manipulates both fields by raw offset, so the layout here is ABI.

use std::sync::atomic::{AtomicIsize, Ordering};

use super::typeobj::TypeObject;

/// Raw pointer to a host object. Null signals "no object" (error raised,
/// empty slot, exhausted iterator) depending on context.
pub type ObjPtr = *mut HostObject;

/// Initial refcount for objects that must never be deallocated.
const IMMORTAL: isize = isize::MAX / 2;

/// Common header of every host object.
///
/// The refcount is atomic only so immortal singletons can live in statics;
/// all traffic is `Relaxed` under the host's global execution lock, and
/// emitted code updates the field with plain loads and stores.
#[repr(C)]
pub struct HostObject {
    /// Reference count. Offset 0; emitted code relies on that.
    pub refcnt: AtomicIsize,
    /// The object's type.
    pub ty: *const TypeObject,
}

impl HostObject {
    /// Header for a fresh heap object with one reference.
    pub fn new(ty: &'static TypeObject) -> Self {
        HostObject {
            refcnt: AtomicIsize::new(1),
            ty,
        }
    }

    /// Header for an immortal static object.
    pub const fn immortal(ty: *const TypeObject) -> Self {
        HostObject {
            refcnt: AtomicIsize::new(IMMORTAL),
            ty,
        }
    }
}

/// The type of an object.
///
/// # Safety
/// `obj` must point to a live host object.
pub unsafe fn type_of<'a>(obj: ObjPtr) -> &'a TypeObject {
    &*(*obj).ty
}

/// Acquire a reference.
///
/// # Safety
/// `obj` must point to a live host object.
pub unsafe fn incref(obj: ObjPtr) {
    (*obj).refcnt.fetch_add(1, Ordering::Relaxed);
}

/// Release a reference, deallocating on the last one.
///
/// # Safety
/// `obj` must point to a live host object owned by the caller.
pub unsafe fn decref(obj: ObjPtr) {
    if (*obj).refcnt.fetch_sub(1, Ordering::Relaxed) == 1 {
        (type_of(obj).dealloc)(obj);
    }
}

/// [`decref`] tolerating null.
///
/// # Safety
/// `obj` must be null or point to a live owned object.
pub unsafe fn xdecref(obj: ObjPtr) {
    if !obj.is_null() {
        decref(obj);
    }
}

/// Current refcount, for tests and assertions.
///
/// # Safety
/// `obj` must point to a live host object.
pub unsafe fn refcount(obj: ObjPtr) -> isize {
    (*obj).refcnt.load(Ordering::Relaxed)
}

/// Deallocate a concrete object by reboxing it.
///
/// Used as the `dealloc` slot of types whose payload needs only `Drop`.
///
/// # Safety
/// `obj` must have been allocated by [`alloc`] with payload type `T`.
pub unsafe extern "C" fn dealloc_as<T>(obj: ObjPtr) {
    drop(Box::from_raw(obj as *mut T));
}

/// Move a payload to the heap and return its object pointer.
///
/// `T` must be `#[repr(C)]` with a `HostObject` header as its first field.
pub fn alloc<T>(payload: T) -> ObjPtr {
    Box::into_raw(Box::new(payload)) as ObjPtr
}

/// Hash an object through its type slot; raises `TypeError` when the type
/// is unhashable.
///
/// # Safety
/// `obj` must point to a live host object.
pub unsafe fn obj_hash(obj: ObjPtr) -> Option<u64> {
    match type_of(obj).hash {
        Some(slot) => slot(obj),
        None => {
            crate::host::exc::err_set_string(
                &crate::host::exc::TYPE_ERROR.0,
                &format!("unhashable type: '{}'", type_of(obj).name),
            );
            None
        }
    }
}

/// Equality used by dict and set probes: identity first, then the rich
/// comparison of either operand's type. `None` means a comparison raised.
///
/// # Safety
/// Both pointers must be live host objects.
pub unsafe fn obj_eq(a: ObjPtr, b: ObjPtr) -> Option<bool> {
    use crate::host::number::not_implemented;

    if std::ptr::eq(a, b) {
        return Some(true);
    }
    for (x, y) in [(a, b), (b, a)] {
        if let Some(slot) = type_of(x).richcompare {
            let res = slot(x, y, crate::host::typeobj::CmpOp::Eq)?;
            if !std::ptr::eq(res, not_implemented()) {
                let truth = crate::host::number::int_value(res) != 0;
                decref(res);
                return Some(truth);
            }
        }
    }
    Some(false)
}

/// `str()` of an object as a Rust string.
///
/// # Safety
/// `obj` must point to a live host object.
pub unsafe fn obj_str_string(obj: ObjPtr) -> Option<String> {
    let ty = type_of(obj);
    let slot = ty.str_.or(ty.repr);
    match slot {
        Some(slot) => {
            let rendered = slot(obj)?;
            let text = crate::host::str::str_value(rendered).to_string();
            decref(rendered);
            Some(text)
        }
        None => Some(format!("<{} object at {:p}>", ty.name, obj)),
    }
}

/// `repr()` of an object as a Rust string.
///
/// # Safety
/// `obj` must point to a live host object.
pub unsafe fn obj_repr_string(obj: ObjPtr) -> Option<String> {
    let ty = type_of(obj);
    match ty.repr {
        Some(slot) => {
            let rendered = slot(obj)?;
            let text = crate::host::str::str_value(rendered).to_string();
            decref(rendered);
            Some(text)
        }
        None => Some(format!("<{} object at {:p}>", ty.name, obj)),
    }
}

/// Wrapper that lets an object containing raw pointers live in a static.
#[repr(transparent)]
pub struct StaticObject<T>(pub T);

// Safety: static host objects are immortal and, under the host's global
// execution lock, only ever mutated through their atomic refcount.
unsafe impl<T> Sync for StaticObject<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::number::int_new;

    #[test]
    fn refcount_lifecycle() {
        unsafe {
            let obj = int_new(7);
            assert_eq!(refcount(obj), 1);
            incref(obj);
            assert_eq!(refcount(obj), 2);
            decref(obj);
            assert_eq!(refcount(obj), 1);
            decref(obj); // frees
        }
    }

    #[test]
    fn header_layout_is_fixed() {
        assert_eq!(std::mem::offset_of!(HostObject, refcnt), 0);
        assert_eq!(
            std::mem::offset_of!(HostObject, ty),
            std::mem::size_of::<usize>()
        );
    }
}
