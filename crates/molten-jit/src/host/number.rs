//! Host numbers: int, bool, float, and the protocol singletons
//!
//! The host `int` is a machine `i64` with overflow-checked arithmetic.
//! `bool` shares the int payload layout and inherits its arithmetic;
//! `True + True` is `2`. Mixed int/float arithmetic resolves through the
//! `NotImplemented` retry protocol: int slots decline non-int operands and
//! the float slots accept both.

use super::object::{alloc, dealloc_as, HostObject, ObjPtr, StaticObject};
use super::str::str_new;
use super::typeobj::{
    dealloc_immortal, CmpOp, NumberSlots, TypeObject, TYPE_TYPE,
};
use crate::host::exc::{err_set_string, OVERFLOW_ERROR, ZERO_DIVISION_ERROR};

/// A host integer (also the payload layout of `bool`).
#[repr(C)]
pub struct IntObject {
    pub base: HostObject,
    pub value: i64,
}

/// A host float.
#[repr(C)]
pub struct FloatObject {
    pub base: HostObject,
    pub value: f64,
}

/// The `None` type.
pub static NONE_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    bool_: Some(none_bool),
    repr: Some(none_repr),
    hash: Some(pointer_hash),
    ..TypeObject::blank("NoneType", &TYPE_TYPE.0)
});

/// The `NotImplemented` type.
pub static NOT_IMPLEMENTED_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    repr: Some(not_implemented_repr),
    ..TypeObject::blank("NotImplementedType", &TYPE_TYPE.0)
});

/// The `int` type.
pub static INT_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: dealloc_as::<IntObject>,
    number: Some(&INT_NUMBER),
    richcompare: Some(int_richcompare),
    hash: Some(int_hash),
    bool_: Some(int_bool),
    repr: Some(int_repr),
    str_: Some(int_repr),
    ..TypeObject::blank("int", &TYPE_TYPE.0)
});

/// The `bool` type: int payload, int arithmetic, its own rendering.
pub static BOOL_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: dealloc_immortal,
    base: Some(&INT_TYPE.0),
    number: Some(&INT_NUMBER),
    richcompare: Some(int_richcompare),
    hash: Some(int_hash),
    bool_: Some(int_bool),
    repr: Some(bool_repr),
    str_: Some(bool_repr),
    ..TypeObject::blank("bool", &TYPE_TYPE.0)
});

/// The `float` type.
pub static FLOAT_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: dealloc_as::<FloatObject>,
    number: Some(&FLOAT_NUMBER),
    richcompare: Some(float_richcompare),
    hash: Some(float_hash),
    bool_: Some(float_bool),
    repr: Some(float_repr),
    str_: Some(float_repr),
    ..TypeObject::blank("float", &TYPE_TYPE.0)
});

static NONE_OBJ: StaticObject<HostObject> =
    StaticObject(HostObject::immortal(&NONE_TYPE.0));
static NOT_IMPLEMENTED_OBJ: StaticObject<HostObject> =
    StaticObject(HostObject::immortal(&NOT_IMPLEMENTED_TYPE.0));
static TRUE_OBJ: StaticObject<IntObject> = StaticObject(IntObject {
    base: HostObject::immortal(&BOOL_TYPE.0),
    value: 1,
});
static FALSE_OBJ: StaticObject<IntObject> = StaticObject(IntObject {
    base: HostObject::immortal(&BOOL_TYPE.0),
    value: 0,
});
/// Sentinel pushed by `LoadMethod` when the attribute was not a method.
/// Compared by address only; it renders as nothing and is never user
/// visible.
static NOT_A_METHOD_OBJ: StaticObject<HostObject> =
    StaticObject(HostObject::immortal(&NONE_TYPE.0));

/// Borrowed pointer to `None`.
pub fn none() -> ObjPtr {
    &NONE_OBJ.0 as *const HostObject as ObjPtr
}

/// Borrowed pointer to `NotImplemented`.
pub fn not_implemented() -> ObjPtr {
    &NOT_IMPLEMENTED_OBJ.0 as *const HostObject as ObjPtr
}

/// Borrowed pointer to `True`.
pub fn true_obj() -> ObjPtr {
    &TRUE_OBJ.0 as *const IntObject as ObjPtr
}

/// Borrowed pointer to `False`.
pub fn false_obj() -> ObjPtr {
    &FALSE_OBJ.0 as *const IntObject as ObjPtr
}

/// Borrowed pointer to the not-a-method sentinel.
pub fn not_a_method() -> ObjPtr {
    &NOT_A_METHOD_OBJ.0 as *const HostObject as ObjPtr
}

/// Borrowed boolean singleton for a Rust bool.
pub fn bool_obj(value: bool) -> ObjPtr {
    if value {
        true_obj()
    } else {
        false_obj()
    }
}

/// New reference to a fresh host int.
pub fn int_new(value: i64) -> ObjPtr {
    alloc(IntObject {
        base: HostObject::new(&INT_TYPE.0),
        value,
    })
}

/// New reference to a fresh host float.
pub fn float_new(value: f64) -> ObjPtr {
    alloc(FloatObject {
        base: HostObject::new(&FLOAT_TYPE.0),
        value,
    })
}

/// Whether the object is an int or bool.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_int_like(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &INT_TYPE.0) || std::ptr::eq((*obj).ty, &BOOL_TYPE.0)
}

/// Whether the object is a float.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_float(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &FLOAT_TYPE.0)
}

/// Integer payload of an int or bool.
///
/// # Safety
/// `obj` must be int-like.
pub unsafe fn int_value(obj: ObjPtr) -> i64 {
    debug_assert!(is_int_like(obj));
    (*(obj as *const IntObject)).value
}

/// Float payload.
///
/// # Safety
/// `obj` must be a float.
pub unsafe fn float_value(obj: ObjPtr) -> f64 {
    debug_assert!(is_float(obj));
    (*(obj as *const FloatObject)).value
}

/// Numeric value of an int, bool, or float, for float arithmetic.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn coerce_f64(obj: ObjPtr) -> Option<f64> {
    if is_float(obj) {
        Some(float_value(obj))
    } else if is_int_like(obj) {
        Some(int_value(obj) as f64)
    } else {
        None
    }
}

// ===== int slots =====

static INT_NUMBER: NumberSlots = NumberSlots {
    add: Some(int_add),
    subtract: Some(int_sub),
    multiply: Some(int_mul),
    remainder: Some(int_mod),
    power: Some(int_pow),
    floor_divide: Some(int_floordiv),
    true_divide: Some(int_truediv),
    lshift: Some(int_lshift),
    rshift: Some(int_rshift),
    and: Some(int_and),
    or: Some(int_or),
    xor: Some(int_xor),
    negative: Some(int_neg),
    positive: Some(int_pos),
    invert: Some(int_invert),
    ..NumberSlots::EMPTY
};

unsafe fn checked(result: Option<i64>) -> Option<ObjPtr> {
    match result {
        Some(v) => Some(int_new(v)),
        None => {
            err_set_string(&OVERFLOW_ERROR.0, "int result too large");
            None
        }
    }
}

macro_rules! int_binary {
    ($name:ident, |$a:ident, $b:ident| $body:expr) => {
        unsafe fn $name(left: ObjPtr, right: ObjPtr) -> Option<ObjPtr> {
            if !is_int_like(left) || !is_int_like(right) {
                return Some(not_implemented());
            }
            let $a = int_value(left);
            let $b = int_value(right);
            $body
        }
    };
}

int_binary!(int_add, |a, b| checked(a.checked_add(b)));
int_binary!(int_sub, |a, b| checked(a.checked_sub(b)));
int_binary!(int_mul, |a, b| checked(a.checked_mul(b)));
int_binary!(int_and, |a, b| Some(int_new(a & b)));
int_binary!(int_or, |a, b| Some(int_new(a | b)));
int_binary!(int_xor, |a, b| Some(int_new(a ^ b)));

int_binary!(int_floordiv, |a, b| {
    if b == 0 {
        err_set_string(&ZERO_DIVISION_ERROR.0, "integer division or modulo by zero");
        return None;
    }
    checked(floor_div(a, b))
});

int_binary!(int_mod, |a, b| {
    if b == 0 {
        err_set_string(&ZERO_DIVISION_ERROR.0, "integer division or modulo by zero");
        return None;
    }
    Some(int_new(floor_mod(a, b)))
});

int_binary!(int_truediv, |a, b| {
    if b == 0 {
        err_set_string(&ZERO_DIVISION_ERROR.0, "division by zero");
        return None;
    }
    Some(float_new(a as f64 / b as f64))
});

int_binary!(int_pow, |a, b| {
    if b < 0 {
        return Some(float_new((a as f64).powf(b as f64)));
    }
    let exp = u32::try_from(b).ok();
    match exp {
        Some(e) => checked(a.checked_pow(e)),
        None => checked(None),
    }
});

int_binary!(int_lshift, |a, b| {
    if b < 0 {
        err_set_string(&crate::host::exc::VALUE_ERROR.0, "negative shift count");
        return None;
    }
    if b >= 64 {
        return checked(if a == 0 { Some(0) } else { None });
    }
    let shifted = a << b;
    checked(if shifted >> b == a { Some(shifted) } else { None })
});

int_binary!(int_rshift, |a, b| {
    if b < 0 {
        err_set_string(&crate::host::exc::VALUE_ERROR.0, "negative shift count");
        return None;
    }
    Some(int_new(a >> b.min(63)))
});

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

unsafe fn int_neg(obj: ObjPtr) -> Option<ObjPtr> {
    checked(int_value(obj).checked_neg())
}

unsafe fn int_pos(obj: ObjPtr) -> Option<ObjPtr> {
    Some(int_new(int_value(obj)))
}

unsafe fn int_invert(obj: ObjPtr) -> Option<ObjPtr> {
    Some(int_new(!int_value(obj)))
}

unsafe fn int_richcompare(left: ObjPtr, right: ObjPtr, op: CmpOp) -> Option<ObjPtr> {
    if !is_int_like(left) {
        return Some(not_implemented());
    }
    let a = int_value(left);
    if is_int_like(right) {
        return Some(cmp_result(a.cmp(&int_value(right)), op));
    }
    if is_float(right) {
        return float_cmp(a as f64, float_value(right), op);
    }
    Some(not_implemented())
}

fn cmp_result(ordering: std::cmp::Ordering, op: CmpOp) -> ObjPtr {
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
    unsafe { super::object::incref(obj) };
    obj
}

unsafe fn int_hash(obj: ObjPtr) -> Option<u64> {
    Some(int_value(obj) as u64)
}

unsafe fn int_bool(obj: ObjPtr) -> Option<bool> {
    Some(int_value(obj) != 0)
}

unsafe fn int_repr(obj: ObjPtr) -> Option<ObjPtr> {
    Some(str_new(&int_value(obj).to_string()))
}

unsafe fn bool_repr(obj: ObjPtr) -> Option<ObjPtr> {
    Some(str_new(if int_value(obj) != 0 { "True" } else { "False" }))
}

// ===== float slots =====

static FLOAT_NUMBER: NumberSlots = NumberSlots {
    add: Some(float_add),
    subtract: Some(float_sub),
    multiply: Some(float_mul),
    remainder: Some(float_mod),
    power: Some(float_pow),
    floor_divide: Some(float_floordiv),
    true_divide: Some(float_truediv),
    negative: Some(float_neg),
    positive: Some(float_pos),
    ..NumberSlots::EMPTY
};

macro_rules! float_binary {
    ($name:ident, |$a:ident, $b:ident| $body:expr) => {
        unsafe fn $name(left: ObjPtr, right: ObjPtr) -> Option<ObjPtr> {
            let (Some($a), Some($b)) = (coerce_f64(left), coerce_f64(right)) else {
                return Some(not_implemented());
            };
            $body
        }
    };
}

float_binary!(float_add, |a, b| Some(float_new(a + b)));
float_binary!(float_sub, |a, b| Some(float_new(a - b)));
float_binary!(float_mul, |a, b| Some(float_new(a * b)));
float_binary!(float_pow, |a, b| Some(float_new(a.powf(b))));

float_binary!(float_truediv, |a, b| {
    if b == 0.0 {
        err_set_string(&ZERO_DIVISION_ERROR.0, "float division by zero");
        return None;
    }
    Some(float_new(a / b))
});

float_binary!(float_floordiv, |a, b| {
    if b == 0.0 {
        err_set_string(&ZERO_DIVISION_ERROR.0, "float floor division by zero");
        return None;
    }
    Some(float_new((a / b).floor()))
});

float_binary!(float_mod, |a, b| {
    if b == 0.0 {
        err_set_string(&ZERO_DIVISION_ERROR.0, "float modulo");
        return None;
    }
    let mut r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r += b;
    }
    Some(float_new(r))
});

unsafe fn float_neg(obj: ObjPtr) -> Option<ObjPtr> {
    Some(float_new(-float_value(obj)))
}

unsafe fn float_pos(obj: ObjPtr) -> Option<ObjPtr> {
    Some(float_new(float_value(obj)))
}

unsafe fn float_richcompare(left: ObjPtr, right: ObjPtr, op: CmpOp) -> Option<ObjPtr> {
    let (Some(a), Some(b)) = (coerce_f64(left), coerce_f64(right)) else {
        return Some(not_implemented());
    };
    float_cmp(a, b, op)
}

unsafe fn float_cmp(a: f64, b: f64, op: CmpOp) -> Option<ObjPtr> {
    let truth = match op {
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    };
    let obj = bool_obj(truth);
    super::object::incref(obj);
    Some(obj)
}

unsafe fn float_hash(obj: ObjPtr) -> Option<u64> {
    let v = float_value(obj);
    // Equal int/float values must hash equally for dict probes.
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64 as u64)
    } else {
        Some(v.to_bits())
    }
}

unsafe fn float_bool(obj: ObjPtr) -> Option<bool> {
    Some(float_value(obj) != 0.0)
}

unsafe fn float_repr(obj: ObjPtr) -> Option<ObjPtr> {
    let v = float_value(obj);
    let text = if v.fract() == 0.0 && v.is_finite() {
        format!("{v:.1}")
    } else {
        format!("{v}")
    };
    Some(str_new(&text))
}

// ===== None / NotImplemented slots =====

unsafe fn none_bool(_obj: ObjPtr) -> Option<bool> {
    Some(false)
}

unsafe fn none_repr(_obj: ObjPtr) -> Option<ObjPtr> {
    Some(str_new("None"))
}

unsafe fn not_implemented_repr(_obj: ObjPtr) -> Option<ObjPtr> {
    Some(str_new("NotImplemented"))
}

unsafe fn pointer_hash(obj: ObjPtr) -> Option<u64> {
    Some(obj as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::state::test_reset_state;

    #[test]
    fn int_arithmetic() {
        test_reset_state();
        unsafe {
            let a = int_new(7);
            let b = int_new(3);
            let sum = int_add(a, b).unwrap();
            assert_eq!(int_value(sum), 10);
            let q = int_floordiv(int_new(-7), int_new(2)).unwrap();
            assert_eq!(int_value(q), -4);
            let m = int_mod(int_new(-7), int_new(2)).unwrap();
            assert_eq!(int_value(m), 1);
        }
    }

    #[test]
    fn int_overflow_raises() {
        test_reset_state();
        unsafe {
            let r = int_add(int_new(i64::MAX), int_new(1));
            assert!(r.is_none());
            assert!(crate::host::exc::err_occurred());
            crate::host::exc::err_clear();
        }
    }

    #[test]
    fn int_declines_foreign_operands() {
        test_reset_state();
        unsafe {
            let s = crate::host::str::str_new("x");
            let r = int_add(int_new(1), s).unwrap();
            assert!(std::ptr::eq(r, not_implemented()));
        }
    }

    #[test]
    fn float_accepts_ints() {
        test_reset_state();
        unsafe {
            let r = float_add(int_new(1), float_new(0.5)).unwrap();
            assert_eq!(float_value(r), 1.5);
        }
    }

    #[test]
    fn bool_is_int_like() {
        unsafe {
            assert!(is_int_like(true_obj()));
            assert_eq!(int_value(true_obj()), 1);
            assert!(BOOL_TYPE.0.is_subtype(&INT_TYPE.0));
        }
    }

    #[test]
    fn division_by_zero_raises() {
        test_reset_state();
        unsafe {
            assert!(int_truediv(int_new(1), int_new(0)).is_none());
            crate::host::exc::err_clear();
        }
    }
}
