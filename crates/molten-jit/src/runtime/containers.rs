//! Container builders and appends
//!
//! Builders receive the base of a contiguous run of value-stack slots and
//! steal those references into the new container; the append family
//! borrows its container (which sits deeper in the stack) and releases
//! only the pushed value, matching what the emitter pops.

use molten_bytecode::opcode::{FVC_ASCII, FVC_NONE, FVC_REPR, FVC_STR};

use crate::host::container::{
    dict_new, dict_set, dict_update, is_dict, is_tuple, list_append, list_as_tuple, list_extend,
    list_new, set_add, set_new, tuple_items, tuple_new,
};
use crate::host::exc::{err_set_string, SYSTEM_ERROR, TYPE_ERROR};
use crate::host::object::{decref, incref, obj_repr_string, obj_str_string, type_of};
use crate::host::str::{is_str, str_new, str_value};
use crate::host::ObjPtr;

use super::unwind::goto_error_handler;

unsafe fn slots<'a>(values: *mut ObjPtr, count: i64) -> &'a [ObjPtr] {
    std::slice::from_raw_parts(values, count as usize)
}

pub(crate) unsafe extern "C-unwind" fn handle_build_tuple(
    values: *mut ObjPtr,
    count: i64,
) -> ObjPtr {
    tuple_new(slots(values, count).to_vec())
}

pub(crate) unsafe extern "C-unwind" fn handle_build_list(
    values: *mut ObjPtr,
    count: i64,
) -> ObjPtr {
    list_new(slots(values, count).to_vec())
}

pub(crate) unsafe extern "C-unwind" fn handle_build_set(values: *mut ObjPtr, count: i64) -> ObjPtr {
    let set = set_new();
    for &value in slots(values, count) {
        if !set_add(set, value) {
            decref(set);
            goto_error_handler();
        }
    }
    for &value in slots(values, count) {
        decref(value);
    }
    set
}

pub(crate) unsafe extern "C-unwind" fn handle_build_map(values: *mut ObjPtr, count: i64) -> ObjPtr {
    let map = dict_new();
    for pair in slots(values, 2 * count).chunks_exact(2) {
        if !dict_set(map, pair[0], pair[1]) {
            decref(map);
            goto_error_handler();
        }
    }
    for &value in slots(values, 2 * count) {
        decref(value);
    }
    map
}

/// `BuildConstKeyMap`: `count` values followed by a key tuple.
pub(crate) unsafe extern "C-unwind" fn handle_build_const_key_map(
    values: *mut ObjPtr,
    count: i64,
) -> ObjPtr {
    let keys = *values.add(count as usize);
    if !is_tuple(keys) || tuple_items(keys).len() != count as usize {
        err_set_string(&SYSTEM_ERROR.0, "bad BuildConstKeyMap keys argument");
        goto_error_handler();
    }
    let map = dict_new();
    for (i, &key) in tuple_items(keys).iter().enumerate() {
        if !dict_set(map, key, *values.add(i)) {
            decref(map);
            goto_error_handler();
        }
    }
    decref(keys);
    for i in 0..count as usize {
        decref(*values.add(i));
    }
    map
}

pub(crate) unsafe extern "C-unwind" fn handle_build_string(
    values: *mut ObjPtr,
    count: i64,
) -> ObjPtr {
    let mut out = String::new();
    for &fragment in slots(values, count) {
        debug_assert!(is_str(fragment));
        out.push_str(str_value(fragment));
    }
    let result = str_new(&out);
    for &fragment in slots(values, count) {
        decref(fragment);
    }
    result
}

pub(crate) unsafe extern "C-unwind" fn handle_list_append(list: ObjPtr, value: ObjPtr) {
    list_append(list, value);
}

pub(crate) unsafe extern "C-unwind" fn handle_set_add(set: ObjPtr, value: ObjPtr) {
    if !set_add(set, value) {
        goto_error_handler();
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_map_add(map: ObjPtr, key: ObjPtr, value: ObjPtr) {
    if !dict_set(map, key, value) {
        goto_error_handler();
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_list_extend(list: ObjPtr, iterable: ObjPtr) {
    if !list_extend(list, iterable) {
        if crate::host::exc::err_matches(&TYPE_ERROR.0) {
            crate::host::exc::err_clear();
            err_set_string(
                &TYPE_ERROR.0,
                &format!(
                    "Value after * must be an iterable, not {}",
                    type_of(iterable).name
                ),
            );
        }
        goto_error_handler();
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_set_update(set: ObjPtr, iterable: ObjPtr) {
    // Reuse list extension to walk the iterable, then add each item.
    let staging = list_new(vec![]);
    if !list_extend(staging, iterable) {
        decref(staging);
        goto_error_handler();
    }
    for &item in crate::host::container::list_items(staging) {
        if !set_add(set, item) {
            decref(staging);
            goto_error_handler();
        }
    }
    decref(staging);
}

pub(crate) unsafe extern "C-unwind" fn handle_dict_update(dict: ObjPtr, update: ObjPtr) {
    if !is_dict(update) {
        err_set_string(
            &TYPE_ERROR.0,
            &format!("'{}' object is not a mapping", type_of(update).name),
        );
        goto_error_handler();
    }
    if !dict_update(dict, update) {
        goto_error_handler();
    }
}

/// `DictMerge` rejects duplicate keys, naming the callee in the message.
pub(crate) unsafe extern "C-unwind" fn handle_dict_merge(
    callee: ObjPtr,
    dict: ObjPtr,
    update: ObjPtr,
) {
    if !is_dict(update) {
        err_set_string(
            &TYPE_ERROR.0,
            &format!(
                "argument after ** must be a mapping, not {}",
                type_of(update).name
            ),
        );
        goto_error_handler();
    }
    for key in crate::host::container::dict_keys(update) {
        match crate::host::container::dict_get(dict, key) {
            Ok(Some(_)) => {
                let rendered =
                    obj_repr_string(key).unwrap_or_else(|| "<key>".to_string());
                let callee_name = obj_repr_string(callee)
                    .unwrap_or_else(|| "<callable>".to_string());
                err_set_string(
                    &TYPE_ERROR.0,
                    &format!(
                        "{callee_name} got multiple values for keyword argument {rendered}"
                    ),
                );
                goto_error_handler();
            }
            Ok(None) => {}
            Err(()) => goto_error_handler(),
        }
    }
    if !dict_update(dict, update) {
        goto_error_handler();
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_list_to_tuple(list: ObjPtr) -> ObjPtr {
    list_as_tuple(list)
}

/// `FormatValue`: apply the conversion, then the format spec. Specs other
/// than the empty string are not interpreted by this host.
pub(crate) unsafe extern "C-unwind" fn handle_format_value(
    value: ObjPtr,
    fmt_spec: ObjPtr,
    which_conversion: i64,
) -> ObjPtr {
    let converted: ObjPtr = match which_conversion as u32 {
        FVC_NONE => {
            incref(value);
            value
        }
        FVC_STR | FVC_ASCII => match obj_str_string(value) {
            Some(text) => str_new(&text),
            None => goto_error_handler(),
        },
        FVC_REPR => match obj_repr_string(value) {
            Some(text) => str_new(&text),
            None => goto_error_handler(),
        },
        other => {
            err_set_string(
                &SYSTEM_ERROR.0,
                &format!("unexpected conversion flag {other}"),
            );
            goto_error_handler();
        }
    };

    if fmt_spec.is_null() && is_str(converted) {
        return converted;
    }
    if !fmt_spec.is_null() && !str_value(fmt_spec).is_empty() {
        decref(converted);
        err_set_string(&SYSTEM_ERROR.0, "format specs are not supported");
        goto_error_handler();
    }
    if is_str(converted) {
        return converted;
    }
    let rendered = match obj_str_string(converted) {
        Some(text) => str_new(&text),
        None => {
            decref(converted);
            goto_error_handler();
        }
    };
    decref(converted);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::container::{dict_get, dict_len, list_items, set_len};
    use crate::host::number::{int_new, int_value};
    use crate::host::object::refcount;
    use crate::host::state::test_reset_state;

    #[test]
    fn build_tuple_steals_references() {
        test_reset_state();
        unsafe {
            let a = int_new(1);
            incref(a);
            let mut slots = [a, int_new(2)];
            let t = handle_build_tuple(slots.as_mut_ptr(), 2);
            assert_eq!(tuple_items(t).len(), 2);
            assert_eq!(refcount(a), 2);
            decref(t);
            assert_eq!(refcount(a), 1);
            decref(a);
        }
    }

    #[test]
    fn build_map_pairs_in_order() {
        test_reset_state();
        unsafe {
            let k1 = str_new("a");
            let v1 = int_new(1);
            let k2 = str_new("b");
            let v2 = int_new(2);
            let mut slots = [k1, v1, k2, v2];
            incref(k1);
            let map = handle_build_map(slots.as_mut_ptr(), 2);
            assert_eq!(dict_len(map), 2);
            assert_eq!(int_value(dict_get(map, k1).unwrap().unwrap()), 1);
            decref(k1);
            decref(map);
        }
    }

    #[test]
    fn build_const_key_map_uses_key_tuple() {
        test_reset_state();
        unsafe {
            let keys = tuple_new(vec![str_new("x"), str_new("y")]);
            let probe = str_new("y");
            let mut slots = [int_new(1), int_new(2), keys];
            let map = handle_build_const_key_map(slots.as_mut_ptr(), 2);
            assert_eq!(int_value(dict_get(map, probe).unwrap().unwrap()), 2);
            decref(probe);
            decref(map);
        }
    }

    #[test]
    fn build_string_joins_fragments() {
        test_reset_state();
        unsafe {
            let mut slots = [str_new("ab"), str_new("cd")];
            let joined = handle_build_string(slots.as_mut_ptr(), 2);
            assert_eq!(str_value(joined), "abcd");
            decref(joined);
        }
    }

    #[test]
    fn appends_borrow_their_containers() {
        test_reset_state();
        unsafe {
            let list = list_new(vec![]);
            let v = int_new(9);
            handle_list_append(list, v);
            assert_eq!(list_items(list).len(), 1);
            // The append acquired its own reference.
            assert_eq!(refcount(v), 2);
            decref(v);
            decref(list);

            let set = set_new();
            handle_set_add(set, int_new(1));
            assert_eq!(set_len(set), 1);
            decref(set);
        }
    }

    #[test]
    fn format_value_applies_conversions() {
        test_reset_state();
        unsafe {
            let n = int_new(7);
            let formatted =
                handle_format_value(n, std::ptr::null_mut(), FVC_STR as i64);
            assert_eq!(str_value(formatted), "7");
            decref(formatted);

            let s = str_new("x");
            let reprd = handle_format_value(s, std::ptr::null_mut(), FVC_REPR as i64);
            assert_eq!(str_value(reprd), "'x'");
            decref(reprd);
        }
    }
}
