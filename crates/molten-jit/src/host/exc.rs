//! Host exceptions and the thread-state error indicator
//!
//! Exception classes are ordinary type objects chained through `base` up
//! to `BaseException`; raising stores a (class, instance, traceback)
//! triple in the thread state. The indicator API mirrors the host C API:
//! helpers set it and return their sentinel, the unwinder consumes it.

use super::object::{
    alloc, decref, incref, obj_str_string, type_of, xdecref, HostObject, ObjPtr, StaticObject,
};
use super::state::state;
use super::str::str_new;
use super::typeobj::{as_type, is_type, TypeObject, TYPE_TYPE};

/// An exception instance.
#[repr(C)]
pub struct ExcObject {
    pub base: HostObject,
    /// Constructor arguments, always a tuple.
    pub args: ObjPtr,
    /// `NameError.name`, when set.
    pub name: ObjPtr,
    /// `raise ... from ...` cause, when set.
    pub cause: ObjPtr,
}

/// A traceback link; one per frame the exception passed through.
#[repr(C)]
pub struct TracebackObject {
    pub base: HostObject,
    pub lasti: i32,
    pub next: ObjPtr,
}

macro_rules! exc_type {
    ($static_name:ident, $py_name:literal, $base:expr) => {
        /// Exception class.
        pub static $static_name: StaticObject<TypeObject> = StaticObject(TypeObject {
            dealloc: exc_dealloc,
            base: $base,
            richcompare: None,
            str_: Some(exc_str),
            repr: Some(exc_repr),
            bool_: None,
            ..TypeObject::blank($py_name, &TYPE_TYPE.0)
        });
    };
}

exc_type!(BASE_EXCEPTION_TYPE, "BaseException", None);
exc_type!(EXCEPTION_TYPE, "Exception", Some(&BASE_EXCEPTION_TYPE.0));
exc_type!(TYPE_ERROR, "TypeError", Some(&EXCEPTION_TYPE.0));
exc_type!(VALUE_ERROR, "ValueError", Some(&EXCEPTION_TYPE.0));
exc_type!(NAME_ERROR, "NameError", Some(&EXCEPTION_TYPE.0));
exc_type!(UNBOUND_LOCAL_ERROR, "UnboundLocalError", Some(&NAME_ERROR.0));
exc_type!(RUNTIME_ERROR, "RuntimeError", Some(&EXCEPTION_TYPE.0));
exc_type!(STOP_ITERATION, "StopIteration", Some(&EXCEPTION_TYPE.0));
exc_type!(KEY_ERROR, "KeyError", Some(&EXCEPTION_TYPE.0));
exc_type!(INDEX_ERROR, "IndexError", Some(&EXCEPTION_TYPE.0));
exc_type!(ATTRIBUTE_ERROR, "AttributeError", Some(&EXCEPTION_TYPE.0));
exc_type!(IMPORT_ERROR, "ImportError", Some(&EXCEPTION_TYPE.0));
exc_type!(OVERFLOW_ERROR, "OverflowError", Some(&EXCEPTION_TYPE.0));
exc_type!(
    ZERO_DIVISION_ERROR,
    "ZeroDivisionError",
    Some(&EXCEPTION_TYPE.0)
);
exc_type!(SYSTEM_ERROR, "SystemError", Some(&EXCEPTION_TYPE.0));

/// The traceback type.
pub static TRACEBACK_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: tb_dealloc,
    ..TypeObject::blank("traceback", &TYPE_TYPE.0)
});

/// View a static exception class as a host object pointer.
pub fn class_obj(ty: &'static TypeObject) -> ObjPtr {
    ty as *const TypeObject as ObjPtr
}

/// Whether the object is an exception class.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_exc_class(obj: ObjPtr) -> bool {
    is_type(obj) && as_type(obj).is_subtype(&BASE_EXCEPTION_TYPE.0)
}

/// Whether the object is an exception instance.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_exc_instance(obj: ObjPtr) -> bool {
    type_of(obj).is_subtype(&BASE_EXCEPTION_TYPE.0)
}

/// New exception instance, stealing the args tuple.
pub fn exc_new_with_args(ty: &'static TypeObject, args: ObjPtr) -> ObjPtr {
    alloc(ExcObject {
        base: HostObject::new(ty),
        args,
        name: std::ptr::null_mut(),
        cause: std::ptr::null_mut(),
    })
}

/// New exception instance carrying a single message string.
pub fn exc_new(ty: &'static TypeObject, message: &str) -> ObjPtr {
    let args = super::container::tuple_new(vec![str_new(message)]);
    exc_new_with_args(ty, args)
}

/// Set the `name` attribute carried by name errors, stealing `name`.
///
/// # Safety
/// `exc` must be an exception instance.
pub unsafe fn exc_set_name(exc: ObjPtr, name: ObjPtr) {
    let exc = &mut *(exc as *mut ExcObject);
    xdecref(exc.name);
    exc.name = name;
}

/// Set the exception cause, stealing `cause` (null clears).
///
/// # Safety
/// `exc` must be an exception instance.
pub unsafe fn exc_set_cause(exc: ObjPtr, cause: ObjPtr) {
    let exc = &mut *(exc as *mut ExcObject);
    xdecref(exc.cause);
    exc.cause = cause;
}

/// Borrow the args tuple.
///
/// # Safety
/// `exc` must be an exception instance.
pub unsafe fn exc_args(exc: ObjPtr) -> ObjPtr {
    (*(exc as *const ExcObject)).args
}

/// Whether `given` (an instance or class) matches `pattern` (a class or a
/// tuple of classes), the way exception handlers test it.
///
/// # Safety
/// Both pointers must be live objects.
pub unsafe fn exc_matches(given: ObjPtr, pattern: ObjPtr) -> bool {
    if super::container::is_tuple(pattern) {
        return super::container::tuple_items(pattern)
            .iter()
            .any(|&p| exc_matches(given, p));
    }
    if !is_type(pattern) {
        return false;
    }
    let wanted = as_type(pattern);
    let given_ty = if is_type(given) {
        as_type(given)
    } else {
        type_of(given)
    };
    // 'static lifetimes: both point into immortal type statics.
    let given_ty: &'static TypeObject = std::mem::transmute(given_ty);
    let wanted: &'static TypeObject = std::mem::transmute(wanted);
    given_ty.is_subtype(wanted)
}

unsafe extern "C" fn exc_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut ExcObject);
    decref(boxed.args);
    xdecref(boxed.name);
    xdecref(boxed.cause);
}

unsafe fn exc_str(obj: ObjPtr) -> Option<ObjPtr> {
    let args = super::container::tuple_items(exc_args(obj));
    match args {
        [] => Some(str_new("")),
        [single] => {
            let text = obj_str_string(*single)?;
            Some(str_new(&text))
        }
        _ => {
            let text = obj_str_string(exc_args(obj))?;
            Some(str_new(&text))
        }
    }
}

unsafe fn exc_repr(obj: ObjPtr) -> Option<ObjPtr> {
    let name = type_of(obj).name;
    let args = super::object::obj_repr_string(exc_args(obj))?;
    // Render the args tuple without a trailing comma for the 1-element case.
    let inner = args
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(",)").or_else(|| s.strip_suffix(')')))
        .unwrap_or(&args);
    Some(str_new(&format!("{name}({inner})")))
}

unsafe extern "C" fn tb_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut TracebackObject);
    xdecref(boxed.next);
}

/// The `call` slot of `type`: instantiating exception classes.
///
/// # Safety
/// Slot calling convention.
pub(super) unsafe fn type_call(callable: ObjPtr, args: &[ObjPtr], kwnames: ObjPtr) -> Option<ObjPtr> {
    if !kwnames.is_null() {
        err_set_string(&TYPE_ERROR.0, "this type takes no keyword arguments");
        return None;
    }
    let ty = as_type(callable);
    if !ty.is_subtype(&BASE_EXCEPTION_TYPE.0) {
        err_set_string(
            &TYPE_ERROR.0,
            &format!("cannot create '{}' instances", ty.name),
        );
        return None;
    }
    let ty: &'static TypeObject = std::mem::transmute(ty);
    let mut items = Vec::with_capacity(args.len());
    for &arg in args {
        incref(arg);
        items.push(arg);
    }
    Some(exc_new_with_args(ty, super::container::tuple_new(items)))
}

// ===== thread-state error indicator =====

/// Whether an error is pending.
pub fn err_occurred() -> bool {
    unsafe { !(*state()).curexc_type.is_null() }
}

/// Raise `class` with a message string.
pub fn err_set_string(class: &'static TypeObject, message: &str) {
    let value = exc_new(class, message);
    err_set_object_stolen(class, value);
}

/// Raise `class` with an already-built instance, stealing the reference.
pub fn err_set_object_stolen(class: &'static TypeObject, value: ObjPtr) {
    unsafe {
        let st = &mut *state();
        xdecref(st.curexc_type);
        xdecref(st.curexc_value);
        xdecref(st.curexc_traceback);
        st.curexc_type = class_obj(class);
        st.curexc_value = value;
        st.curexc_traceback = std::ptr::null_mut();
    }
}

/// Take the pending triple, clearing the indicator.
pub fn err_fetch() -> (ObjPtr, ObjPtr, ObjPtr) {
    unsafe {
        let st = &mut *state();
        let triple = (st.curexc_type, st.curexc_value, st.curexc_traceback);
        st.curexc_type = std::ptr::null_mut();
        st.curexc_value = std::ptr::null_mut();
        st.curexc_traceback = std::ptr::null_mut();
        triple
    }
}

/// Install a triple, stealing all three references.
pub fn err_restore(ty: ObjPtr, value: ObjPtr, tb: ObjPtr) {
    unsafe {
        let st = &mut *state();
        xdecref(st.curexc_type);
        xdecref(st.curexc_value);
        xdecref(st.curexc_traceback);
        st.curexc_type = ty;
        st.curexc_value = value;
        st.curexc_traceback = tb;
    }
}

/// Drop any pending error.
pub fn err_clear() {
    let (ty, value, tb) = err_fetch();
    unsafe {
        xdecref(ty);
        xdecref(value);
        xdecref(tb);
    }
}

/// Whether the pending error matches a class.
pub fn err_matches(class: &'static TypeObject) -> bool {
    unsafe {
        let ty = (*state()).curexc_type;
        !ty.is_null() && exc_matches(ty, class_obj(class))
    }
}

/// Normalize a fetched triple so the value is an instance of the type.
pub fn err_normalize(ty: &mut ObjPtr, value: &mut ObjPtr, _tb: &mut ObjPtr) {
    unsafe {
        if ty.is_null() {
            return;
        }
        let class: &'static TypeObject = std::mem::transmute(as_type(*ty));
        if !value.is_null() && is_exc_instance(*value) {
            return;
        }
        let args = if value.is_null() {
            super::container::tuple_new(vec![])
        } else {
            super::container::tuple_new(vec![*value])
        };
        *value = exc_new_with_args(class, args);
    }
}

/// Record the current frame position in the pending traceback chain.
///
/// # Safety
/// An error must be pending; `lasti` is the frame's last-instruction index.
pub unsafe fn traceback_here(lasti: i32) {
    let st = &mut *state();
    debug_assert!(!st.curexc_type.is_null());
    let tb = alloc(TracebackObject {
        base: HostObject::new(&TRACEBACK_TYPE.0),
        lasti,
        next: st.curexc_traceback,
    });
    st.curexc_traceback = tb;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::state::test_reset_state;

    #[test]
    fn indicator_set_fetch_clear() {
        test_reset_state();
        err_set_string(&VALUE_ERROR.0, "boom");
        assert!(err_occurred());
        assert!(err_matches(&VALUE_ERROR.0));
        assert!(err_matches(&EXCEPTION_TYPE.0));
        assert!(!err_matches(&TYPE_ERROR.0));
        let (ty, value, tb) = err_fetch();
        assert!(!err_occurred());
        unsafe {
            assert!(is_exc_class(ty));
            assert!(is_exc_instance(value));
            assert!(tb.is_null());
            decref(value);
        }
    }

    #[test]
    fn matching_walks_tuples_and_bases() {
        test_reset_state();
        unsafe {
            let exc = exc_new(&UNBOUND_LOCAL_ERROR.0, "x");
            assert!(exc_matches(exc, class_obj(&NAME_ERROR.0)));
            let pattern = crate::host::container::tuple_new(vec![
                class_obj(&TYPE_ERROR.0),
                class_obj(&NAME_ERROR.0),
            ]);
            // Class objects are immortal; the tuple stealing them is fine.
            assert!(exc_matches(exc, pattern));
            assert!(!exc_matches(exc, class_obj(&KEY_ERROR.0)));
            decref(exc);
        }
    }

    #[test]
    fn normalize_wraps_bare_types() {
        test_reset_state();
        let mut ty = class_obj(&RUNTIME_ERROR.0);
        let mut value: ObjPtr = std::ptr::null_mut();
        let mut tb: ObjPtr = std::ptr::null_mut();
        err_normalize(&mut ty, &mut value, &mut tb);
        unsafe {
            assert!(is_exc_instance(value));
            decref(value);
        }
    }

    #[test]
    fn type_call_builds_instances() {
        test_reset_state();
        unsafe {
            let msg = str_new("nope");
            let exc = type_call(class_obj(&VALUE_ERROR.0), &[msg], std::ptr::null_mut()).unwrap();
            assert!(is_exc_instance(exc));
            assert!(exc_matches(exc, class_obj(&VALUE_ERROR.0)));
            decref(exc);
            decref(msg);
        }
    }
}
