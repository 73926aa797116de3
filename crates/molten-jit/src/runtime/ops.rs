//! Dispatching operator helpers
//!
//! Each arithmetic, comparison, and subscript opcode resolves to one entry
//! here. Binary dispatch follows the host protocol: the left operand's
//! in-place slot first for in-place opcodes, then the regular slot with
//! subclass priority for the reflected operand, retrying on the
//! `NotImplemented` sentinel and raising an operator-sign-bearing
//! `TypeError` when every slot declines. Failures never return; they
//! escape through the unwinder.

use crate::host::exc::{err_set_string, TYPE_ERROR};
use crate::host::number::{bool_obj, int_value, is_int_like, none, not_implemented};
use crate::host::object::{decref, incref, type_of};
use crate::host::str::is_str;
use crate::host::typeobj::{BinaryFunc, CmpOp, NumberSlots, TypeObject};
use crate::host::ObjPtr;

use super::unwind::goto_error_handler;

/// Binary operator selector, carrying the slot accessors and the
/// source-level signs used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    FloorDivide,
    TrueDivide,
    Modulo,
    Power,
    MatrixMultiply,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
}

impl BinOp {
    fn slot(self, slots: &NumberSlots) -> Option<BinaryFunc> {
        match self {
            BinOp::Add => slots.add,
            BinOp::Subtract => slots.subtract,
            BinOp::Multiply => slots.multiply,
            BinOp::FloorDivide => slots.floor_divide,
            BinOp::TrueDivide => slots.true_divide,
            BinOp::Modulo => slots.remainder,
            BinOp::Power => slots.power,
            BinOp::MatrixMultiply => slots.matrix_multiply,
            BinOp::Lshift => slots.lshift,
            BinOp::Rshift => slots.rshift,
            BinOp::And => slots.and,
            BinOp::Or => slots.or,
            BinOp::Xor => slots.xor,
        }
    }

    fn inplace_slot(self, slots: &NumberSlots) -> Option<BinaryFunc> {
        match self {
            BinOp::Add => slots.inplace_add,
            BinOp::Subtract => slots.inplace_subtract,
            BinOp::Multiply => slots.inplace_multiply,
            BinOp::FloorDivide => slots.inplace_floor_divide,
            BinOp::TrueDivide => slots.inplace_true_divide,
            BinOp::Modulo => slots.inplace_remainder,
            BinOp::Power => slots.inplace_power,
            BinOp::MatrixMultiply => slots.inplace_matrix_multiply,
            BinOp::Lshift => slots.inplace_lshift,
            BinOp::Rshift => slots.inplace_rshift,
            BinOp::And => slots.inplace_and,
            BinOp::Or => slots.inplace_or,
            BinOp::Xor => slots.inplace_xor,
        }
    }

    fn sign(self, inplace: bool) -> &'static str {
        match (self, inplace) {
            (BinOp::Add, false) => "+",
            (BinOp::Add, true) => "+=",
            (BinOp::Subtract, false) => "-",
            (BinOp::Subtract, true) => "-=",
            (BinOp::Multiply, false) => "*",
            (BinOp::Multiply, true) => "*=",
            (BinOp::FloorDivide, false) => "//",
            (BinOp::FloorDivide, true) => "//=",
            (BinOp::TrueDivide, false) => "/",
            (BinOp::TrueDivide, true) => "/=",
            (BinOp::Modulo, false) => "%",
            (BinOp::Modulo, true) => "%=",
            (BinOp::Power, false) => "**",
            (BinOp::Power, true) => "**=",
            (BinOp::MatrixMultiply, false) => "@",
            (BinOp::MatrixMultiply, true) => "@=",
            (BinOp::Lshift, false) => "<<",
            (BinOp::Lshift, true) => "<<=",
            (BinOp::Rshift, false) => ">>",
            (BinOp::Rshift, true) => ">>=",
            (BinOp::And, false) => "&",
            (BinOp::And, true) => "&=",
            (BinOp::Or, false) => "|",
            (BinOp::Or, true) => "|=",
            (BinOp::Xor, false) => "^",
            (BinOp::Xor, true) => "^=",
        }
    }
}

unsafe fn raise_binop_type_error(v: ObjPtr, w: ObjPtr, sign: &str, hint: &str) -> ! {
    err_set_string(
        &TYPE_ERROR.0,
        &format!(
            "unsupported operand type(s) for {sign}: '{}' and '{}'{hint}",
            type_of(v).name,
            type_of(w).name
        ),
    );
    goto_error_handler();
}

unsafe fn call_binary_slot(slot: BinaryFunc, v: ObjPtr, w: ObjPtr) -> ObjPtr {
    match slot(v, w) {
        Some(result) => result,
        None => goto_error_handler(),
    }
}

/// The slot-dispatch core: in-place slot first when asked, regular slots
/// with subclass priority for the reflected operand, `NotImplemented`
/// retries. Returns null when every slot declined.
unsafe fn dispatch_binary(v: ObjPtr, w: ObjPtr, op: BinOp, inplace: bool) -> ObjPtr {
    let ty_v = type_of(v);
    let ty_w = type_of(w);

    if inplace {
        if let Some(slot) = ty_v.number.and_then(|n| op.inplace_slot(n)) {
            let result = call_binary_slot(slot, v, w);
            if !std::ptr::eq(result, not_implemented()) {
                return result;
            }
            decref(result);
        }
    }

    let slot_v = ty_v.number.and_then(|n| op.slot(n));
    let mut slot_w = ty_w.number.and_then(|n| op.slot(n));
    if slot_w == slot_v {
        slot_w = None;
    }

    if let Some(sv) = slot_v {
        if let Some(sw) = slot_w {
            if subtype(ty_w, ty_v) {
                let result = call_binary_slot(sw, v, w);
                if !std::ptr::eq(result, not_implemented()) {
                    return result;
                }
                decref(result);
                slot_w = None;
            }
        }
        let result = call_binary_slot(sv, v, w);
        if !std::ptr::eq(result, not_implemented()) {
            return result;
        }
        decref(result);
    }
    if let Some(sw) = slot_w {
        let result = call_binary_slot(sw, v, w);
        if !std::ptr::eq(result, not_implemented()) {
            return result;
        }
        decref(result);
    }
    std::ptr::null_mut()
}

unsafe fn subtype(a: &TypeObject, b: &TypeObject) -> bool {
    let a: &'static TypeObject = std::mem::transmute(a);
    let b: &'static TypeObject = std::mem::transmute(b);
    a.is_subtype(b)
}

unsafe fn handle_binary(v: ObjPtr, w: ObjPtr, op: BinOp, inplace: bool) -> ObjPtr {
    let result = dispatch_binary(v, w, op, inplace);
    if !result.is_null() {
        return result;
    }
    raise_binop_type_error(v, w, op.sign(inplace), "");
}

/// Sequence repetition fallback for `*` and `*=`.
unsafe fn repeat_sequence(v: ObjPtr, w: ObjPtr, inplace: bool) -> ObjPtr {
    let mut repeat = None;
    let mut seq = v;
    let mut count_obj = w;
    if let Some(slots) = type_of(v).sequence {
        repeat = if inplace {
            slots.inplace_repeat.or(slots.repeat)
        } else {
            slots.repeat
        };
    }
    if repeat.is_none() {
        if let Some(slots) = type_of(w).sequence {
            if let Some(slot) = slots.repeat {
                repeat = Some(slot);
                seq = w;
                count_obj = v;
            }
        }
    }
    let Some(repeat) = repeat else {
        raise_binop_type_error(v, w, BinOp::Multiply.sign(inplace), "");
    };
    if !is_int_like(count_obj) {
        err_set_string(
            &TYPE_ERROR.0,
            &format!(
                "can't multiply sequence by non-int of type '{}'",
                type_of(count_obj).name
            ),
        );
        goto_error_handler();
    }
    match repeat(seq, int_value(count_obj)) {
        Some(result) => result,
        None => goto_error_handler(),
    }
}

/// `+` with the sequence-concat fallback.
unsafe fn add_with_concat(v: ObjPtr, w: ObjPtr, inplace: bool) -> ObjPtr {
    let result = dispatch_binary(v, w, BinOp::Add, inplace);
    if !result.is_null() {
        return result;
    }
    if let Some(slots) = type_of(v).sequence {
        let concat = if inplace {
            slots.inplace_concat.or(slots.concat)
        } else {
            slots.concat
        };
        if let Some(concat) = concat {
            return call_binary_slot(concat, v, w);
        }
    }
    raise_binop_type_error(v, w, BinOp::Add.sign(inplace), "");
}

macro_rules! binary_helper {
    ($name:ident, $op:expr, $inplace:literal) => {
        pub(crate) unsafe extern "C-unwind" fn $name(v: ObjPtr, w: ObjPtr) -> ObjPtr {
            handle_binary(v, w, $op, $inplace)
        }
    };
}

pub(crate) unsafe extern "C-unwind" fn handle_binary_add(v: ObjPtr, w: ObjPtr) -> ObjPtr {
    add_with_concat(v, w, false)
}

pub(crate) unsafe extern "C-unwind" fn handle_inplace_add(v: ObjPtr, w: ObjPtr) -> ObjPtr {
    add_with_concat(v, w, true)
}

pub(crate) unsafe extern "C-unwind" fn handle_binary_multiply(v: ObjPtr, w: ObjPtr) -> ObjPtr {
    let result = dispatch_binary(v, w, BinOp::Multiply, false);
    if !result.is_null() {
        return result;
    }
    repeat_sequence(v, w, false)
}

pub(crate) unsafe extern "C-unwind" fn handle_inplace_multiply(v: ObjPtr, w: ObjPtr) -> ObjPtr {
    let result = dispatch_binary(v, w, BinOp::Multiply, true);
    if !result.is_null() {
        return result;
    }
    repeat_sequence(v, w, true)
}

/// `%` with the string-format fast path.
pub(crate) unsafe extern "C-unwind" fn handle_binary_modulo(v: ObjPtr, w: ObjPtr) -> ObjPtr {
    if is_str(v) {
        match crate::host::str::str_format(v, w) {
            Some(result) => return result,
            None => goto_error_handler(),
        }
    }
    handle_binary(v, w, BinOp::Modulo, false)
}

binary_helper!(handle_binary_subtract, BinOp::Subtract, false);
binary_helper!(handle_inplace_subtract, BinOp::Subtract, true);
binary_helper!(handle_binary_floor_divide, BinOp::FloorDivide, false);
binary_helper!(handle_inplace_floor_divide, BinOp::FloorDivide, true);
binary_helper!(handle_binary_true_divide, BinOp::TrueDivide, false);
binary_helper!(handle_inplace_true_divide, BinOp::TrueDivide, true);
binary_helper!(handle_inplace_modulo, BinOp::Modulo, true);
binary_helper!(handle_binary_power, BinOp::Power, false);
binary_helper!(handle_inplace_power, BinOp::Power, true);
binary_helper!(handle_binary_matrix_multiply, BinOp::MatrixMultiply, false);
binary_helper!(handle_inplace_matrix_multiply, BinOp::MatrixMultiply, true);
binary_helper!(handle_binary_lshift, BinOp::Lshift, false);
binary_helper!(handle_inplace_lshift, BinOp::Lshift, true);

/// `>>` carries a hint when the left operand is the `print` builtin.
pub(crate) unsafe extern "C-unwind" fn handle_binary_rshift(v: ObjPtr, w: ObjPtr) -> ObjPtr {
    let result = dispatch_binary(v, w, BinOp::Rshift, false);
    if !result.is_null() {
        return result;
    }
    let hint = if is_print_builtin(v) {
        " Did you mean \"print(<message>, file=<output_stream>)\"?"
    } else {
        ""
    };
    raise_binop_type_error(v, w, BinOp::Rshift.sign(false), hint);
}

unsafe fn is_print_builtin(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &crate::host::func::NATIVE_FUNC_TYPE.0)
        && (*(obj as *const crate::host::func::NativeFuncObject)).name == "print"
}

binary_helper!(handle_inplace_rshift, BinOp::Rshift, true);
binary_helper!(handle_binary_and, BinOp::And, false);
binary_helper!(handle_inplace_and, BinOp::And, true);
binary_helper!(handle_binary_or, BinOp::Or, false);
binary_helper!(handle_inplace_or, BinOp::Or, true);
binary_helper!(handle_binary_xor, BinOp::Xor, false);
binary_helper!(handle_inplace_xor, BinOp::Xor, true);

// ===== unary operators =====

pub(crate) unsafe extern "C-unwind" fn handle_unary_not(value: ObjPtr) -> ObjPtr {
    let truth = obj_is_true(value);
    let result = bool_obj(!truth);
    incref(result);
    result
}

unsafe fn handle_unary(
    value: ObjPtr,
    slot_of: fn(&NumberSlots) -> Option<crate::host::typeobj::UnaryFunc>,
    sign: char,
) -> ObjPtr {
    let ty = type_of(value);
    if let Some(slot) = ty.number.and_then(slot_of) {
        match slot(value) {
            Some(result) => return result,
            None => goto_error_handler(),
        }
    }
    err_set_string(
        &TYPE_ERROR.0,
        &format!("bad operand type for unary {sign}: '{}'", ty.name),
    );
    goto_error_handler();
}

pub(crate) unsafe extern "C-unwind" fn handle_unary_positive(value: ObjPtr) -> ObjPtr {
    handle_unary(value, |n| n.positive, '+')
}

pub(crate) unsafe extern "C-unwind" fn handle_unary_negative(value: ObjPtr) -> ObjPtr {
    handle_unary(value, |n| n.negative, '-')
}

pub(crate) unsafe extern "C-unwind" fn handle_unary_invert(value: ObjPtr) -> ObjPtr {
    handle_unary(value, |n| n.invert, '~')
}

// ===== comparison and membership =====

/// Rich comparison with reflected-subclass priority and the identity
/// fallback for equality.
pub(crate) unsafe extern "C-unwind" fn handle_compare_op(
    v: ObjPtr,
    w: ObjPtr,
    op: i64,
) -> ObjPtr {
    let Some(op) = CmpOp::from_oparg(op as u32) else {
        err_set_string(&TYPE_ERROR.0, "invalid comparison operand");
        goto_error_handler();
    };
    let ty_v = type_of(v);
    let ty_w = type_of(w);
    let slot_v = ty_v.richcompare;
    let mut slot_w = ty_w.richcompare;

    if let Some(sw) = slot_w {
        if !std::ptr::eq(ty_v, ty_w) && subtype(ty_w, ty_v) {
            match sw(w, v, op.swapped()) {
                Some(result) if !std::ptr::eq(result, not_implemented()) => return result,
                Some(result) => decref(result),
                None => goto_error_handler(),
            }
            slot_w = None;
        }
    }
    if let Some(sv) = slot_v {
        match sv(v, w, op) {
            Some(result) if !std::ptr::eq(result, not_implemented()) => return result,
            Some(result) => decref(result),
            None => goto_error_handler(),
        }
    }
    if let Some(sw) = slot_w {
        match sw(w, v, op.swapped()) {
            Some(result) if !std::ptr::eq(result, not_implemented()) => return result,
            Some(result) => decref(result),
            None => goto_error_handler(),
        }
    }

    if matches!(op, CmpOp::Eq | CmpOp::Ne) {
        let truth = std::ptr::eq(v, w) == (op == CmpOp::Eq);
        let result = bool_obj(truth);
        incref(result);
        return result;
    }

    err_set_string(
        &TYPE_ERROR.0,
        &format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.sign(),
            ty_v.name,
            ty_w.name
        ),
    );
    goto_error_handler();
}

/// Membership test; the emitter applies the invert bit.
pub(crate) unsafe extern "C-unwind" fn handle_contains_op(
    container: ObjPtr,
    value: ObjPtr,
) -> i64 {
    if let Some(contains) = type_of(container).sequence.and_then(|s| s.contains) {
        match contains(container, value) {
            Some(found) => return found as i64,
            None => goto_error_handler(),
        }
    }
    // Iterator search fallback.
    let iter = handle_get_iter_inner(container);
    loop {
        let next = type_of(iter)
            .iternext
            .expect("get_iter produced a non-iterator");
        let item = next(iter);
        if item.is_null() {
            decref(iter);
            if crate::host::exc::err_occurred() {
                goto_error_handler();
            }
            return 0;
        }
        let equal = crate::host::object::obj_eq(item, value);
        decref(item);
        match equal {
            Some(true) => {
                decref(iter);
                return 1;
            }
            Some(false) => continue,
            None => {
                decref(iter);
                goto_error_handler();
            }
        }
    }
}

/// Truthiness, shared by the conditional-jump slow path.
pub(crate) unsafe fn obj_is_true(obj: ObjPtr) -> bool {
    if std::ptr::eq(obj, none()) {
        return false;
    }
    let ty = type_of(obj);
    if let Some(slot) = ty.bool_ {
        match slot(obj) {
            Some(truth) => return truth,
            None => goto_error_handler(),
        }
    }
    if let Some(length) = ty.mapping.and_then(|m| m.length) {
        match length(obj) {
            Some(len) => return len > 0,
            None => goto_error_handler(),
        }
    }
    if let Some(length) = ty.sequence.and_then(|s| s.length) {
        match length(obj) {
            Some(len) => return len > 0,
            None => goto_error_handler(),
        }
    }
    true
}

pub(crate) unsafe extern "C-unwind" fn cast_to_bool(obj: ObjPtr) -> i64 {
    obj_is_true(obj) as i64
}

// ===== iteration and subscripts =====

unsafe fn handle_get_iter_inner(obj: ObjPtr) -> ObjPtr {
    let ty = type_of(obj);
    if let Some(iter_slot) = ty.iter {
        let Some(iter) = iter_slot(obj) else {
            goto_error_handler();
        };
        if type_of(iter).iternext.is_some() {
            return iter;
        }
        err_set_string(
            &TYPE_ERROR.0,
            &format!(
                "iter() returned non-iterator of type '{}'",
                type_of(iter).name
            ),
        );
        decref(iter);
        goto_error_handler();
    }
    err_set_string(
        &TYPE_ERROR.0,
        &format!("'{}' object is not iterable", ty.name),
    );
    goto_error_handler();
}

pub(crate) unsafe extern "C-unwind" fn handle_get_iter(obj: ObjPtr) -> ObjPtr {
    handle_get_iter_inner(obj)
}

pub(crate) unsafe extern "C-unwind" fn handle_binary_subscr(
    container: ObjPtr,
    sub: ObjPtr,
) -> ObjPtr {
    let ty = type_of(container);
    if let Some(subscript) = ty.mapping.and_then(|m| m.subscript) {
        match subscript(container, sub) {
            Some(result) => return result,
            None => goto_error_handler(),
        }
    }
    if let Some(item) = ty.sequence.and_then(|s| s.item) {
        if is_int_like(sub) {
            match item(container, int_value(sub)) {
                Some(result) => return result,
                None => goto_error_handler(),
            }
        }
        err_set_string(
            &TYPE_ERROR.0,
            &format!(
                "indices must be integers, not '{}'",
                type_of(sub).name
            ),
        );
        goto_error_handler();
    }
    err_set_string(
        &TYPE_ERROR.0,
        &format!("'{}' object is not subscriptable", ty.name),
    );
    goto_error_handler();
}

/// Subscript store; a null value deletes, matching the emitter's shared
/// lowering of `StoreSubscr` and `DeleteSubscr`.
pub(crate) unsafe extern "C-unwind" fn handle_store_subscr(
    container: ObjPtr,
    sub: ObjPtr,
    value: ObjPtr,
) {
    let ty = type_of(container);
    let Some(ass) = ty.mapping.and_then(|m| m.ass_subscript) else {
        let action = if value.is_null() {
            "deletion"
        } else {
            "assignment"
        };
        err_set_string(
            &TYPE_ERROR.0,
            &format!("'{}' object does not support item {action}", ty.name),
        );
        goto_error_handler();
    };
    if !ass(container, sub, value) {
        goto_error_handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::container::{dict_new, dict_set, list_new, tuple_new};
    use crate::host::exc::err_clear;
    use crate::host::number::{float_value, int_new, is_float};
    use crate::host::state::test_reset_state;
    use crate::host::str::{str_new, str_value};

    #[test]
    fn int_add_dispatches_through_slots() {
        test_reset_state();
        unsafe {
            let r = handle_binary_add(int_new(2), int_new(3));
            assert_eq!(int_value(r), 5);
        }
    }

    #[test]
    fn mixed_int_float_resolves_via_retry() {
        test_reset_state();
        unsafe {
            // int.add declines the float, float.add accepts both.
            let r = handle_binary_add(int_new(2), crate::host::number::float_new(0.5));
            assert!(is_float(r));
            assert_eq!(float_value(r), 2.5);
        }
    }

    #[test]
    fn string_concat_falls_back_to_sequence() {
        test_reset_state();
        unsafe {
            let r = handle_binary_add(str_new("ab"), str_new("cd"));
            assert_eq!(str_value(r), "abcd");
        }
    }

    #[test]
    fn string_repeat_falls_back_to_sequence() {
        test_reset_state();
        unsafe {
            let r = handle_binary_multiply(str_new("ab"), int_new(3));
            assert_eq!(str_value(r), "ababab");
            // Reflected: int * str also repeats.
            let r = handle_binary_multiply(int_new(2), str_new("x"));
            assert_eq!(str_value(r), "xx");
        }
    }

    #[test]
    fn string_modulo_formats() {
        test_reset_state();
        unsafe {
            let args = tuple_new(vec![int_new(7)]);
            let r = handle_binary_modulo(str_new("n=%d"), args);
            assert_eq!(str_value(r), "n=7");
        }
    }

    #[test]
    fn compare_falls_back_to_identity_for_eq() {
        test_reset_state();
        unsafe {
            let d = dict_new();
            let r = handle_compare_op(d, d, CmpOp::Eq as i64);
            assert!(std::ptr::eq(r, crate::host::number::true_obj()));
            let r = handle_compare_op(d, dict_new(), CmpOp::Ne as i64);
            assert!(std::ptr::eq(r, crate::host::number::true_obj()));
        }
    }

    #[test]
    fn contains_uses_sequence_slot() {
        test_reset_state();
        unsafe {
            let list = list_new(vec![int_new(1), int_new(2)]);
            assert_eq!(handle_contains_op(list, int_new(2)), 1);
            assert_eq!(handle_contains_op(list, int_new(9)), 0);
        }
    }

    #[test]
    fn truthiness_prefers_bool_then_length() {
        test_reset_state();
        unsafe {
            assert!(!obj_is_true(none()));
            assert!(!obj_is_true(int_new(0)));
            assert!(obj_is_true(int_new(4)));
            assert!(!obj_is_true(list_new(vec![])));
            assert!(obj_is_true(list_new(vec![int_new(1)])));
            let d = dict_new();
            assert!(!obj_is_true(d));
            dict_set(d, str_new("k"), int_new(1));
            assert!(obj_is_true(d));
        }
    }

    #[test]
    fn subscript_probes_mapping_then_sequence() {
        test_reset_state();
        unsafe {
            let d = dict_new();
            dict_set(d, str_new("k"), int_new(5));
            let r = handle_binary_subscr(d, str_new("k"));
            assert_eq!(int_value(r), 5);

            let t = tuple_new(vec![int_new(10), int_new(11)]);
            let r = handle_binary_subscr(t, int_new(1));
            assert_eq!(int_value(r), 11);
        }
    }

    #[test]
    fn store_subscr_handles_delete() {
        test_reset_state();
        unsafe {
            let d = dict_new();
            let k = str_new("k");
            handle_store_subscr(d, k, int_new(1));
            assert!(crate::host::container::dict_get(d, k).unwrap().is_some());
            handle_store_subscr(d, k, std::ptr::null_mut());
            assert!(crate::host::container::dict_get(d, k).unwrap().is_none());
            err_clear();
        }
    }
}
