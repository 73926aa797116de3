//! Host strings
//!
//! Strings cache their hash the way the host does, so the name-lookup
//! helpers can probe namespaces without rehashing on every access.

use std::cell::Cell;

use super::object::{alloc, dealloc_as, HostObject, ObjPtr, StaticObject};
use super::typeobj::{
    CmpOp, SequenceSlots, TypeObject, TYPE_TYPE,
};
use crate::host::exc::err_set_string;
use crate::host::number::{bool_obj, not_implemented};
use crate::host::object::incref;

/// Hash sentinel meaning "not yet computed".
const HASH_UNSET: u64 = u64::MAX;

/// A host string.
#[repr(C)]
pub struct StrObject {
    pub base: HostObject,
    hash: Cell<u64>,
    pub value: String,
}

/// The `str` type.
pub static STR_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: dealloc_as::<StrObject>,
    sequence: Some(&STR_SEQUENCE),
    richcompare: Some(str_richcompare),
    hash: Some(str_hash_slot),
    bool_: Some(str_bool),
    repr: Some(str_repr_slot),
    str_: Some(str_str_slot),
    ..TypeObject::blank("str", &TYPE_TYPE.0)
});

static STR_SEQUENCE: SequenceSlots = SequenceSlots {
    length: Some(str_len),
    concat: Some(str_concat),
    repeat: Some(str_repeat),
    contains: Some(str_contains),
    ..SequenceSlots::EMPTY
};

/// New reference to a fresh host string.
pub fn str_new(value: &str) -> ObjPtr {
    alloc(StrObject {
        base: HostObject::new(&STR_TYPE.0),
        hash: Cell::new(HASH_UNSET),
        value: value.to_string(),
    })
}

/// Whether the object is a host string.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_str(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &STR_TYPE.0)
}

/// Borrow the string payload.
///
/// # Safety
/// `obj` must be a host string.
pub unsafe fn str_value<'a>(obj: ObjPtr) -> &'a str {
    debug_assert!(is_str(obj));
    &(*(obj as *const StrObject)).value
}

/// FNV-1a over the bytes; stable across the process.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    // Keep the unset sentinel out of the value range.
    if hash == HASH_UNSET {
        0
    } else {
        hash
    }
}

/// The string's hash, computed once and cached in the object.
///
/// # Safety
/// `obj` must be a host string.
pub unsafe fn str_hash(obj: ObjPtr) -> u64 {
    let s = &*(obj as *const StrObject);
    let cached = s.hash.get();
    if cached != HASH_UNSET {
        return cached;
    }
    let hash = hash_bytes(s.value.as_bytes());
    s.hash.set(hash);
    hash
}

/// Minimal %-formatting for the string modulo fast path: `%s`, `%r`,
/// `%d`, and `%%`, with a tuple right-hand side distributing its items.
///
/// # Safety
/// `fmt` must be a host string; `args` a live object.
pub unsafe fn str_format(fmt: ObjPtr, args: ObjPtr) -> Option<ObjPtr> {
    use crate::host::container::{is_tuple, tuple_items};
    use crate::host::number::{int_value, is_int_like};
    use crate::host::object::{obj_repr_string, obj_str_string};

    let template = str_value(fmt);
    let items: Vec<ObjPtr> = if is_tuple(args) {
        tuple_items(args).to_vec()
    } else {
        vec![args]
    };

    let mut out = String::new();
    let mut next = 0usize;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(kind @ ('s' | 'r' | 'd')) => {
                let Some(&arg) = items.get(next) else {
                    err_set_string(
                        &crate::host::exc::TYPE_ERROR.0,
                        "not enough arguments for format string",
                    );
                    return None;
                };
                next += 1;
                match kind {
                    's' => out.push_str(&obj_str_string(arg)?),
                    'r' => out.push_str(&obj_repr_string(arg)?),
                    'd' => {
                        if !is_int_like(arg) {
                            err_set_string(
                                &crate::host::exc::TYPE_ERROR.0,
                                "%d format: a number is required",
                            );
                            return None;
                        }
                        out.push_str(&int_value(arg).to_string());
                    }
                    _ => unreachable!(),
                }
            }
            _ => {
                err_set_string(
                    &crate::host::exc::VALUE_ERROR.0,
                    "unsupported format character",
                );
                return None;
            }
        }
    }
    Some(str_new(&out))
}

// ===== slots =====

unsafe fn str_len(obj: ObjPtr) -> Option<i64> {
    Some(str_value(obj).chars().count() as i64)
}

unsafe fn str_concat(left: ObjPtr, right: ObjPtr) -> Option<ObjPtr> {
    if !is_str(right) {
        err_set_string(
            &crate::host::exc::TYPE_ERROR.0,
            "can only concatenate str to str",
        );
        return None;
    }
    let mut out = String::with_capacity(str_value(left).len() + str_value(right).len());
    out.push_str(str_value(left));
    out.push_str(str_value(right));
    Some(str_new(&out))
}

unsafe fn str_repeat(obj: ObjPtr, count: i64) -> Option<ObjPtr> {
    let n = count.max(0) as usize;
    Some(str_new(&str_value(obj).repeat(n)))
}

unsafe fn str_contains(obj: ObjPtr, needle: ObjPtr) -> Option<bool> {
    if !is_str(needle) {
        err_set_string(
            &crate::host::exc::TYPE_ERROR.0,
            "'in <string>' requires string as left operand",
        );
        return None;
    }
    Some(str_value(obj).contains(str_value(needle)))
}

unsafe fn str_richcompare(left: ObjPtr, right: ObjPtr, op: CmpOp) -> Option<ObjPtr> {
    if !is_str(left) || !is_str(right) {
        return Some(not_implemented());
    }
    let ordering = str_value(left).cmp(str_value(right));
    use std::cmp::Ordering::*;
    let truth = match op {
        CmpOp::Lt => ordering == Less,
        CmpOp::Le => ordering != Greater,
        CmpOp::Eq => ordering == Equal,
        CmpOp::Ne => ordering != Equal,
        CmpOp::Gt => ordering == Greater,
        CmpOp::Ge => ordering != Less,
    };
    let obj = bool_obj(truth);
    incref(obj);
    Some(obj)
}

unsafe fn str_hash_slot(obj: ObjPtr) -> Option<u64> {
    Some(str_hash(obj))
}

unsafe fn str_bool(obj: ObjPtr) -> Option<bool> {
    Some(!str_value(obj).is_empty())
}

unsafe fn str_str_slot(obj: ObjPtr) -> Option<ObjPtr> {
    incref(obj);
    Some(obj)
}

unsafe fn str_repr_slot(obj: ObjPtr) -> Option<ObjPtr> {
    Some(str_new(&format!("'{}'", str_value(obj).escape_default())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::container::tuple_new;
    use crate::host::number::int_new;
    use crate::host::state::test_reset_state;

    #[test]
    fn hash_is_cached() {
        unsafe {
            let s = str_new("hello");
            let h1 = str_hash(s);
            let h2 = str_hash(s);
            assert_eq!(h1, h2);
            let t = str_new("hello");
            assert_eq!(str_hash(t), h1);
        }
    }

    #[test]
    fn concat_requires_strings() {
        test_reset_state();
        unsafe {
            let s = str_new("a");
            assert!(str_concat(s, int_new(1)).is_none());
            crate::host::exc::err_clear();
        }
    }

    #[test]
    fn format_with_tuple() {
        test_reset_state();
        unsafe {
            let fmt = str_new("%s=%d");
            let args = tuple_new(vec![str_new("x"), int_new(3)]);
            let out = str_format(fmt, args).unwrap();
            assert_eq!(str_value(out), "x=3");
        }
    }
}
