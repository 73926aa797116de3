//! Host containers: tuple, list, dict, set, and the sequence iterator
//!
//! Dicts keep insertion order in a flat entry vector and probe by cached
//! hash before falling back to value equality, which is all the namespace
//! helpers need. The sequence iterator drives any type with `length` and
//! `item` slots and exposes the C-ABI `iternext` emitted loops call.

use super::object::{
    alloc, decref, incref, obj_eq, obj_hash, obj_repr_string, xdecref, HostObject, ObjPtr,
    StaticObject,
};
use super::str::{is_str, str_hash, str_value};
use super::typeobj::{CmpOp, MappingSlots, SequenceSlots, TypeObject, TYPE_TYPE};
use crate::host::exc::{err_set_string, KEY_ERROR, TYPE_ERROR};
use crate::host::number::{bool_obj, not_implemented};

/// A host tuple.
#[repr(C)]
pub struct TupleObject {
    pub base: HostObject,
    items: Box<[ObjPtr]>,
}

/// A host list.
#[repr(C)]
pub struct ListObject {
    pub base: HostObject,
    items: Vec<ObjPtr>,
}

struct DictEntry {
    hash: u64,
    key: ObjPtr,
    value: ObjPtr,
}

/// A host dict: insertion-ordered, hash-probed.
#[repr(C)]
pub struct DictObject {
    pub base: HostObject,
    entries: Vec<DictEntry>,
}

/// A host set.
#[repr(C)]
pub struct SetObject {
    pub base: HostObject,
    entries: Vec<(u64, ObjPtr)>,
}

/// Iterator over any sequence with `length` and `item` slots.
#[repr(C)]
pub struct SeqIterObject {
    pub base: HostObject,
    seq: ObjPtr,
    index: i64,
}

/// The `tuple` type.
pub static TUPLE_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: tuple_dealloc,
    sequence: Some(&TUPLE_SEQUENCE),
    richcompare: Some(seq_richcompare),
    hash: Some(tuple_hash),
    bool_: Some(seq_bool),
    repr: Some(tuple_repr),
    iter: Some(seq_iter_new),
    ..TypeObject::blank("tuple", &TYPE_TYPE.0)
});

/// The `list` type.
pub static LIST_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: list_dealloc,
    sequence: Some(&LIST_SEQUENCE),
    richcompare: Some(seq_richcompare),
    bool_: Some(seq_bool),
    repr: Some(list_repr),
    iter: Some(seq_iter_new),
    ..TypeObject::blank("list", &TYPE_TYPE.0)
});

/// The `dict` type.
pub static DICT_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: dict_dealloc,
    mapping: Some(&DICT_MAPPING),
    sequence: Some(&DICT_SEQUENCE),
    bool_: Some(dict_bool),
    ..TypeObject::blank("dict", &TYPE_TYPE.0)
});

/// The `set` type.
pub static SET_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: set_dealloc,
    sequence: Some(&SET_SEQUENCE),
    bool_: Some(set_bool),
    ..TypeObject::blank("set", &TYPE_TYPE.0)
});

/// The sequence-iterator type; its `iternext` is called by emitted loops.
pub static SEQ_ITER_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: seq_iter_dealloc,
    iternext: Some(seq_iter_next),
    ..TypeObject::blank("iterator", &TYPE_TYPE.0)
});

static TUPLE_SEQUENCE: SequenceSlots = SequenceSlots {
    length: Some(tuple_len),
    item: Some(tuple_item),
    concat: Some(tuple_concat),
    contains: Some(seq_contains),
    ..SequenceSlots::EMPTY
};

static LIST_SEQUENCE: SequenceSlots = SequenceSlots {
    length: Some(list_len),
    item: Some(list_item),
    concat: Some(list_concat),
    inplace_concat: Some(list_inplace_concat),
    contains: Some(seq_contains),
    ..SequenceSlots::EMPTY
};

static DICT_MAPPING: MappingSlots = MappingSlots {
    length: Some(dict_len_slot),
    subscript: Some(dict_subscript),
    ass_subscript: Some(dict_ass_subscript),
};

static DICT_SEQUENCE: SequenceSlots = SequenceSlots {
    contains: Some(dict_contains_slot),
    ..SequenceSlots::EMPTY
};

static SET_SEQUENCE: SequenceSlots = SequenceSlots {
    length: Some(set_len_slot),
    contains: Some(set_contains_slot),
    ..SequenceSlots::EMPTY
};

// ===== tuple =====

/// New tuple stealing the item references.
pub fn tuple_new(items: Vec<ObjPtr>) -> ObjPtr {
    alloc(TupleObject {
        base: HostObject::new(&TUPLE_TYPE.0),
        items: items.into_boxed_slice(),
    })
}

/// Whether the object is a tuple.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_tuple(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &TUPLE_TYPE.0)
}

/// Borrow a tuple's items.
///
/// # Safety
/// `obj` must be a tuple.
pub unsafe fn tuple_items<'a>(obj: ObjPtr) -> &'a [ObjPtr] {
    debug_assert!(is_tuple(obj));
    &(*(obj as *const TupleObject)).items
}

unsafe extern "C" fn tuple_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut TupleObject);
    for &item in boxed.items.iter() {
        decref(item);
    }
}

unsafe fn tuple_len(obj: ObjPtr) -> Option<i64> {
    Some(tuple_items(obj).len() as i64)
}

unsafe fn tuple_item(obj: ObjPtr, index: i64) -> Option<ObjPtr> {
    let items = tuple_items(obj);
    match usize::try_from(index).ok().and_then(|i| items.get(i)) {
        Some(&item) => {
            incref(item);
            Some(item)
        }
        None => {
            err_set_string(&crate::host::exc::INDEX_ERROR.0, "tuple index out of range");
            None
        }
    }
}

unsafe fn tuple_concat(left: ObjPtr, right: ObjPtr) -> Option<ObjPtr> {
    if !is_tuple(right) {
        err_set_string(&TYPE_ERROR.0, "can only concatenate tuple to tuple");
        return None;
    }
    let mut out = Vec::new();
    for &item in tuple_items(left).iter().chain(tuple_items(right)) {
        incref(item);
        out.push(item);
    }
    Some(tuple_new(out))
}

unsafe fn tuple_hash(obj: ObjPtr) -> Option<u64> {
    let mut hash: u64 = 0x345678;
    for &item in tuple_items(obj) {
        hash = hash
            .rotate_left(13)
            .wrapping_mul(1_000_003)
            .wrapping_add(obj_hash(item)?);
    }
    Some(hash)
}

unsafe fn tuple_repr(obj: ObjPtr) -> Option<ObjPtr> {
    let items = tuple_items(obj);
    let mut parts = Vec::with_capacity(items.len());
    for &item in items {
        parts.push(obj_repr_string(item)?);
    }
    let body = parts.join(", ");
    let text = if items.len() == 1 {
        format!("({body},)")
    } else {
        format!("({body})")
    };
    Some(super::str::str_new(&text))
}

// ===== list =====

/// New list stealing the item references.
pub fn list_new(items: Vec<ObjPtr>) -> ObjPtr {
    alloc(ListObject {
        base: HostObject::new(&LIST_TYPE.0),
        items,
    })
}

/// Whether the object is a list.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_list(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &LIST_TYPE.0)
}

/// Borrow a list's items.
///
/// # Safety
/// `obj` must be a list.
pub unsafe fn list_items<'a>(obj: ObjPtr) -> &'a [ObjPtr] {
    debug_assert!(is_list(obj));
    &(*(obj as *const ListObject)).items
}

/// Append, acquiring a reference to the value.
///
/// # Safety
/// `list` must be a list; `value` a live object.
pub unsafe fn list_append(list: ObjPtr, value: ObjPtr) {
    incref(value);
    (*(list as *mut ListObject)).items.push(value);
}

/// Extend from any iterable, acquiring references to the items.
///
/// # Safety
/// `list` must be a list; `iterable` a live object.
pub unsafe fn list_extend(list: ObjPtr, iterable: ObjPtr) -> bool {
    if is_list(iterable) {
        for &item in list_items(iterable).to_vec().iter() {
            list_append(list, item);
        }
        return true;
    }
    if is_tuple(iterable) {
        for &item in tuple_items(iterable) {
            list_append(list, item);
        }
        return true;
    }
    let ty = super::object::type_of(iterable);
    let Some(iter_slot) = ty.iter else {
        err_set_string(
            &TYPE_ERROR.0,
            &format!("'{}' object is not iterable", ty.name),
        );
        return false;
    };
    let Some(iter) = iter_slot(iterable) else {
        return false;
    };
    loop {
        let next_slot = super::object::type_of(iter)
            .iternext
            .expect("iter slot produced a non-iterator");
        let item = next_slot(iter);
        if item.is_null() {
            decref(iter);
            return !crate::host::exc::err_occurred();
        }
        (*(list as *mut ListObject)).items.push(item);
    }
}

/// Convert a list into a tuple, acquiring item references.
///
/// # Safety
/// `list` must be a list.
pub unsafe fn list_as_tuple(list: ObjPtr) -> ObjPtr {
    let mut items = Vec::new();
    for &item in list_items(list) {
        incref(item);
        items.push(item);
    }
    tuple_new(items)
}

unsafe extern "C" fn list_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut ListObject);
    for &item in boxed.items.iter() {
        decref(item);
    }
}

unsafe fn list_len(obj: ObjPtr) -> Option<i64> {
    Some(list_items(obj).len() as i64)
}

unsafe fn list_item(obj: ObjPtr, index: i64) -> Option<ObjPtr> {
    let items = list_items(obj);
    match usize::try_from(index).ok().and_then(|i| items.get(i)) {
        Some(&item) => {
            incref(item);
            Some(item)
        }
        None => {
            err_set_string(&crate::host::exc::INDEX_ERROR.0, "list index out of range");
            None
        }
    }
}

unsafe fn list_concat(left: ObjPtr, right: ObjPtr) -> Option<ObjPtr> {
    if !is_list(right) {
        err_set_string(&TYPE_ERROR.0, "can only concatenate list to list");
        return None;
    }
    let mut out = Vec::new();
    for &item in list_items(left).iter().chain(list_items(right)) {
        incref(item);
        out.push(item);
    }
    Some(list_new(out))
}

unsafe fn list_inplace_concat(left: ObjPtr, right: ObjPtr) -> Option<ObjPtr> {
    if !list_extend(left, right) {
        return None;
    }
    incref(left);
    Some(left)
}

unsafe fn list_repr(obj: ObjPtr) -> Option<ObjPtr> {
    let mut parts = Vec::new();
    for &item in list_items(obj) {
        parts.push(obj_repr_string(item)?);
    }
    Some(super::str::str_new(&format!("[{}]", parts.join(", "))))
}

// ===== shared sequence slots =====

unsafe fn seq_items<'a>(obj: ObjPtr) -> &'a [ObjPtr] {
    if is_tuple(obj) {
        tuple_items(obj)
    } else {
        list_items(obj)
    }
}

unsafe fn seq_bool(obj: ObjPtr) -> Option<bool> {
    Some(!seq_items(obj).is_empty())
}

unsafe fn seq_contains(obj: ObjPtr, needle: ObjPtr) -> Option<bool> {
    for &item in seq_items(obj) {
        if obj_eq(item, needle)? {
            return Some(true);
        }
    }
    Some(false)
}

unsafe fn seq_richcompare(left: ObjPtr, right: ObjPtr, op: CmpOp) -> Option<ObjPtr> {
    if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
        return Some(not_implemented());
    }
    let same_kind = (is_tuple(left) && is_tuple(right)) || (is_list(left) && is_list(right));
    if !same_kind {
        return Some(not_implemented());
    }
    let a = seq_items(left);
    let b = seq_items(right);
    let mut equal = a.len() == b.len();
    if equal {
        for (&x, &y) in a.iter().zip(b) {
            if !obj_eq(x, y)? {
                equal = false;
                break;
            }
        }
    }
    let obj = bool_obj(equal == (op == CmpOp::Eq));
    incref(obj);
    Some(obj)
}

// ===== dict =====

/// New empty dict.
pub fn dict_new() -> ObjPtr {
    alloc(DictObject {
        base: HostObject::new(&DICT_TYPE.0),
        entries: Vec::new(),
    })
}

/// Whether the object is a dict.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_dict(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &DICT_TYPE.0)
}

unsafe fn dict_ref<'a>(obj: ObjPtr) -> &'a mut DictObject {
    debug_assert!(is_dict(obj));
    &mut *(obj as *mut DictObject)
}

/// Number of entries.
///
/// # Safety
/// `dict` must be a dict.
pub unsafe fn dict_len(dict: ObjPtr) -> usize {
    dict_ref(dict).entries.len()
}

unsafe fn dict_find(dict: ObjPtr, key: ObjPtr, hash: u64) -> Result<Option<usize>, ()> {
    for (i, entry) in dict_ref(dict).entries.iter().enumerate() {
        if entry.hash != hash {
            continue;
        }
        match obj_eq(entry.key, key) {
            Some(true) => return Ok(Some(i)),
            Some(false) => continue,
            None => return Err(()),
        }
    }
    Ok(None)
}

/// Borrowed lookup with a caller-provided hash.
///
/// `Err` means key hashing or comparison raised.
///
/// # Safety
/// `dict` must be a dict; `key` a live object.
pub unsafe fn dict_get_hashed(
    dict: ObjPtr,
    key: ObjPtr,
    hash: u64,
) -> Result<Option<ObjPtr>, ()> {
    Ok(dict_find(dict, key, hash)?.map(|i| dict_ref(dict).entries[i].value))
}

/// Borrowed lookup hashing the key first.
///
/// # Safety
/// `dict` must be a dict; `key` a live object.
pub unsafe fn dict_get(dict: ObjPtr, key: ObjPtr) -> Result<Option<ObjPtr>, ()> {
    let Some(hash) = obj_hash(key) else {
        return Err(());
    };
    dict_get_hashed(dict, key, hash)
}

/// Insert or overwrite, acquiring references to key and value.
///
/// # Safety
/// `dict` must be a dict; `key` and `value` live objects.
pub unsafe fn dict_set(dict: ObjPtr, key: ObjPtr, value: ObjPtr) -> bool {
    let Some(hash) = obj_hash(key) else {
        return false;
    };
    match dict_find(dict, key, hash) {
        Ok(Some(i)) => {
            incref(value);
            let old = std::mem::replace(&mut dict_ref(dict).entries[i].value, value);
            decref(old);
            true
        }
        Ok(None) => {
            incref(key);
            incref(value);
            dict_ref(dict).entries.push(DictEntry { hash, key, value });
            true
        }
        Err(()) => false,
    }
}

/// Remove a key. `Ok(true)` when it was present.
///
/// # Safety
/// `dict` must be a dict; `key` a live object.
pub unsafe fn dict_del(dict: ObjPtr, key: ObjPtr) -> Result<bool, ()> {
    let Some(hash) = obj_hash(key) else {
        return Err(());
    };
    match dict_find(dict, key, hash)? {
        Some(i) => {
            let entry = dict_ref(dict).entries.remove(i);
            decref(entry.key);
            decref(entry.value);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Fast borrowed probe for a host-string key, reusing its cached hash.
///
/// # Safety
/// `dict` must be a dict; `name` a host string.
pub unsafe fn dict_get_str(dict: ObjPtr, name: ObjPtr) -> Option<ObjPtr> {
    debug_assert!(is_str(name));
    let hash = str_hash(name);
    for entry in &dict_ref(dict).entries {
        if entry.hash == hash && is_str(entry.key) && str_value(entry.key) == str_value(name) {
            return Some(entry.value);
        }
    }
    None
}

/// Copy every entry of `src` into `dst`.
///
/// # Safety
/// Both must be dicts.
pub unsafe fn dict_update(dst: ObjPtr, src: ObjPtr) -> bool {
    let entries: Vec<(ObjPtr, ObjPtr)> = dict_ref(src)
        .entries
        .iter()
        .map(|e| (e.key, e.value))
        .collect();
    for (key, value) in entries {
        if !dict_set(dst, key, value) {
            return false;
        }
    }
    true
}

/// Keys currently in the dict, borrowed.
///
/// # Safety
/// `dict` must be a dict.
pub unsafe fn dict_keys(dict: ObjPtr) -> Vec<ObjPtr> {
    dict_ref(dict).entries.iter().map(|e| e.key).collect()
}

unsafe extern "C" fn dict_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut DictObject);
    for entry in boxed.entries.iter() {
        decref(entry.key);
        decref(entry.value);
    }
}

unsafe fn dict_len_slot(obj: ObjPtr) -> Option<i64> {
    Some(dict_len(obj) as i64)
}

unsafe fn dict_subscript(obj: ObjPtr, key: ObjPtr) -> Option<ObjPtr> {
    match dict_get(obj, key) {
        Ok(Some(value)) => {
            incref(value);
            Some(value)
        }
        Ok(None) => {
            let rendered = obj_repr_string(key).unwrap_or_else(|| "<key>".to_string());
            err_set_string(&KEY_ERROR.0, &rendered);
            None
        }
        Err(()) => None,
    }
}

unsafe fn dict_ass_subscript(obj: ObjPtr, key: ObjPtr, value: ObjPtr) -> bool {
    if value.is_null() {
        match dict_del(obj, key) {
            Ok(true) => true,
            Ok(false) => {
                let rendered = obj_repr_string(key).unwrap_or_else(|| "<key>".to_string());
                err_set_string(&KEY_ERROR.0, &rendered);
                false
            }
            Err(()) => false,
        }
    } else {
        dict_set(obj, key, value)
    }
}

unsafe fn dict_contains_slot(obj: ObjPtr, key: ObjPtr) -> Option<bool> {
    match dict_get(obj, key) {
        Ok(found) => Some(found.is_some()),
        Err(()) => None,
    }
}

unsafe fn dict_bool(obj: ObjPtr) -> Option<bool> {
    Some(dict_len(obj) != 0)
}

// ===== set =====

/// New empty set.
pub fn set_new() -> ObjPtr {
    alloc(SetObject {
        base: HostObject::new(&SET_TYPE.0),
        entries: Vec::new(),
    })
}

/// Whether the object is a set.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_set(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &SET_TYPE.0)
}

unsafe fn set_ref<'a>(obj: ObjPtr) -> &'a mut SetObject {
    debug_assert!(is_set(obj));
    &mut *(obj as *mut SetObject)
}

/// Add a value, acquiring a reference when it was absent.
///
/// # Safety
/// `set` must be a set; `value` a live object.
pub unsafe fn set_add(set: ObjPtr, value: ObjPtr) -> bool {
    let Some(hash) = obj_hash(value) else {
        return false;
    };
    for &(h, existing) in &set_ref(set).entries {
        if h == hash {
            match obj_eq(existing, value) {
                Some(true) => return true,
                Some(false) => continue,
                None => return false,
            }
        }
    }
    incref(value);
    set_ref(set).entries.push((hash, value));
    true
}

/// Number of members.
///
/// # Safety
/// `set` must be a set.
pub unsafe fn set_len(set: ObjPtr) -> usize {
    set_ref(set).entries.len()
}

/// Membership test.
///
/// # Safety
/// `set` must be a set; `value` a live object.
pub unsafe fn set_contains(set: ObjPtr, value: ObjPtr) -> Option<bool> {
    let hash = obj_hash(value)?;
    for &(h, existing) in &set_ref(set).entries {
        if h == hash && obj_eq(existing, value)? {
            return Some(true);
        }
    }
    Some(false)
}

unsafe extern "C" fn set_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut SetObject);
    for &(_, value) in boxed.entries.iter() {
        decref(value);
    }
}

unsafe fn set_len_slot(obj: ObjPtr) -> Option<i64> {
    Some(set_len(obj) as i64)
}

unsafe fn set_contains_slot(obj: ObjPtr, value: ObjPtr) -> Option<bool> {
    set_contains(obj, value)
}

unsafe fn set_bool(obj: ObjPtr) -> Option<bool> {
    Some(set_len(obj) != 0)
}

// ===== sequence iterator =====

/// `iter()` slot shared by the indexable types.
pub(super) unsafe fn seq_iter_new(seq: ObjPtr) -> Option<ObjPtr> {
    incref(seq);
    Some(alloc(SeqIterObject {
        base: HostObject::new(&SEQ_ITER_TYPE.0),
        seq,
        index: 0,
    }))
}

unsafe extern "C" fn seq_iter_next(obj: ObjPtr) -> ObjPtr {
    let iter = &mut *(obj as *mut SeqIterObject);
    let ty = super::object::type_of(iter.seq);
    let slots = ty.sequence.expect("sequence iterator over non-sequence");
    let len = match (slots.length.expect("sequence without length"))(iter.seq) {
        Some(len) => len,
        None => return std::ptr::null_mut(),
    };
    if iter.index >= len {
        return std::ptr::null_mut();
    }
    let item = (slots.item.expect("sequence without item"))(iter.seq, iter.index);
    match item {
        Some(item) => {
            iter.index += 1;
            item
        }
        None => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn seq_iter_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut SeqIterObject);
    decref(boxed.seq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::number::{int_new, int_value};
    use crate::host::object::refcount;
    use crate::host::state::test_reset_state;
    use crate::host::str::str_new;

    #[test]
    fn dict_round_trip() {
        test_reset_state();
        unsafe {
            let d = dict_new();
            let k = str_new("answer");
            let v = int_new(42);
            assert!(dict_set(d, k, v));
            let found = dict_get(d, k).unwrap().unwrap();
            assert_eq!(int_value(found), 42);
            assert!(dict_get_str(d, k).is_some());
            assert!(dict_del(d, k).unwrap());
            assert!(dict_get(d, k).unwrap().is_none());
        }
    }

    #[test]
    fn dict_probes_by_value_equality() {
        test_reset_state();
        unsafe {
            let d = dict_new();
            let k1 = str_new("key");
            let k2 = str_new("key");
            dict_set(d, k1, int_new(1));
            let found = dict_get(d, k2).unwrap().unwrap();
            assert_eq!(int_value(found), 1);
        }
    }

    #[test]
    fn tuple_owns_items() {
        test_reset_state();
        unsafe {
            let item = int_new(5);
            incref(item);
            let t = tuple_new(vec![item]);
            assert_eq!(refcount(item), 2);
            decref(t);
            assert_eq!(refcount(item), 1);
            decref(item);
        }
    }

    #[test]
    fn seq_iter_walks_list() {
        test_reset_state();
        unsafe {
            let list = list_new(vec![int_new(1), int_new(2)]);
            let iter = seq_iter_new(list).unwrap();
            let next = super::super::object::type_of(iter).iternext.unwrap();
            assert_eq!(int_value(next(iter)), 1);
            assert_eq!(int_value(next(iter)), 2);
            assert!(next(iter).is_null());
        }
    }

    #[test]
    fn set_deduplicates() {
        test_reset_state();
        unsafe {
            let s = set_new();
            assert!(set_add(s, int_new(3)));
            assert!(set_add(s, int_new(3)));
            assert_eq!(set_len(s), 1);
            assert_eq!(set_contains(s, int_new(3)), Some(true));
        }
    }

    #[test]
    fn list_extend_from_tuple() {
        test_reset_state();
        unsafe {
            let list = list_new(vec![]);
            let t = tuple_new(vec![int_new(1), int_new(2)]);
            assert!(list_extend(list, t));
            assert_eq!(list_items(list).len(), 2);
        }
    }
}
