//! Type objects and slot tables
//!
//! A [`TypeObject`] is itself a host object (its header points at the
//! type-of-types), carrying the slot tables the operator helpers dispatch
//! through. Slots follow the host C API's conventions: a null/`None`
//! return means an error is pending in the thread state, and binary slots
//! may return the `NotImplemented` singleton to ask for the reflected
//! operand. `iternext` alone uses the C ABI because emitted code calls it
//! directly through the type.

use super::object::{HostObject, ObjPtr, StaticObject};

/// Unary slot: consumes nothing, returns a new reference or raises.
pub type UnaryFunc = unsafe fn(ObjPtr) -> Option<ObjPtr>;
/// Binary slot: may return `NotImplemented`.
pub type BinaryFunc = unsafe fn(ObjPtr, ObjPtr) -> Option<ObjPtr>;
/// Sequence repetition slot.
pub type RepeatFunc = unsafe fn(ObjPtr, i64) -> Option<ObjPtr>;
/// Rich comparison slot; may return `NotImplemented`.
pub type RichCmpFunc = unsafe fn(ObjPtr, ObjPtr, CmpOp) -> Option<ObjPtr>;
/// Hash slot.
pub type HashFunc = unsafe fn(ObjPtr) -> Option<u64>;
/// Truthiness slot.
pub type BoolFunc = unsafe fn(ObjPtr) -> Option<bool>;
/// Length slot.
pub type LenFunc = unsafe fn(ObjPtr) -> Option<i64>;
/// Membership slot.
pub type ContainsFunc = unsafe fn(ObjPtr, ObjPtr) -> Option<bool>;
/// Attribute read slot; name is a host string.
pub type GetAttrFunc = unsafe fn(ObjPtr, ObjPtr) -> Option<ObjPtr>;
/// Attribute write slot; a null value deletes. Returns false on error.
pub type SetAttrFunc = unsafe fn(ObjPtr, ObjPtr, ObjPtr) -> bool;
/// Subscript write slot; a null value deletes. Returns false on error.
pub type AssSubscriptFunc = unsafe fn(ObjPtr, ObjPtr, ObjPtr) -> bool;
/// Vectorcall slot: callable, positional args, optional kwname tuple.
pub type CallFunc = unsafe fn(ObjPtr, &[ObjPtr], ObjPtr) -> Option<ObjPtr>;
/// Iteration step. C ABI: emitted loops call this through the type
/// object. Returns null when exhausted (no error pending) or raising.
pub type IterNextFunc = unsafe extern "C" fn(ObjPtr) -> ObjPtr;
/// Destructor.
pub type DeallocFunc = unsafe extern "C" fn(ObjPtr);

/// Rich comparison selector, numbered like `CompareOp` operands.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `<`
    Lt = 0,
    /// `<=`
    Le = 1,
    /// `==`
    Eq = 2,
    /// `!=`
    Ne = 3,
    /// `>`
    Gt = 4,
    /// `>=`
    Ge = 5,
}

impl CmpOp {
    /// Decode a `CompareOp` operand.
    pub fn from_oparg(oparg: u32) -> Option<Self> {
        match oparg {
            0 => Some(Self::Lt),
            1 => Some(Self::Le),
            2 => Some(Self::Eq),
            3 => Some(Self::Ne),
            4 => Some(Self::Gt),
            5 => Some(Self::Ge),
            _ => None,
        }
    }

    /// The comparison with operands exchanged.
    pub fn swapped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }

    /// Source-level operator sign, for error messages.
    pub fn sign(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Numeric slot table.
#[derive(Default)]
pub struct NumberSlots {
    pub add: Option<BinaryFunc>,
    pub subtract: Option<BinaryFunc>,
    pub multiply: Option<BinaryFunc>,
    pub remainder: Option<BinaryFunc>,
    pub power: Option<BinaryFunc>,
    pub floor_divide: Option<BinaryFunc>,
    pub true_divide: Option<BinaryFunc>,
    pub matrix_multiply: Option<BinaryFunc>,
    pub lshift: Option<BinaryFunc>,
    pub rshift: Option<BinaryFunc>,
    pub and: Option<BinaryFunc>,
    pub or: Option<BinaryFunc>,
    pub xor: Option<BinaryFunc>,
    pub negative: Option<UnaryFunc>,
    pub positive: Option<UnaryFunc>,
    pub invert: Option<UnaryFunc>,
    pub inplace_add: Option<BinaryFunc>,
    pub inplace_subtract: Option<BinaryFunc>,
    pub inplace_multiply: Option<BinaryFunc>,
    pub inplace_remainder: Option<BinaryFunc>,
    pub inplace_power: Option<BinaryFunc>,
    pub inplace_floor_divide: Option<BinaryFunc>,
    pub inplace_true_divide: Option<BinaryFunc>,
    pub inplace_matrix_multiply: Option<BinaryFunc>,
    pub inplace_lshift: Option<BinaryFunc>,
    pub inplace_rshift: Option<BinaryFunc>,
    pub inplace_and: Option<BinaryFunc>,
    pub inplace_or: Option<BinaryFunc>,
    pub inplace_xor: Option<BinaryFunc>,
}

impl NumberSlots {
    /// Empty table usable in statics.
    pub const EMPTY: NumberSlots = NumberSlots {
        add: None,
        subtract: None,
        multiply: None,
        remainder: None,
        power: None,
        floor_divide: None,
        true_divide: None,
        matrix_multiply: None,
        lshift: None,
        rshift: None,
        and: None,
        or: None,
        xor: None,
        negative: None,
        positive: None,
        invert: None,
        inplace_add: None,
        inplace_subtract: None,
        inplace_multiply: None,
        inplace_remainder: None,
        inplace_power: None,
        inplace_floor_divide: None,
        inplace_true_divide: None,
        inplace_matrix_multiply: None,
        inplace_lshift: None,
        inplace_rshift: None,
        inplace_and: None,
        inplace_or: None,
        inplace_xor: None,
    };
}

/// Sequence slot table.
#[derive(Default)]
pub struct SequenceSlots {
    pub length: Option<LenFunc>,
    pub concat: Option<BinaryFunc>,
    pub repeat: Option<RepeatFunc>,
    pub inplace_concat: Option<BinaryFunc>,
    pub inplace_repeat: Option<RepeatFunc>,
    pub item: Option<RepeatFunc>,
    pub contains: Option<ContainsFunc>,
}

impl SequenceSlots {
    /// Empty table usable in statics.
    pub const EMPTY: SequenceSlots = SequenceSlots {
        length: None,
        concat: None,
        repeat: None,
        inplace_concat: None,
        inplace_repeat: None,
        item: None,
        contains: None,
    };
}

/// Mapping slot table.
#[derive(Default)]
pub struct MappingSlots {
    pub length: Option<LenFunc>,
    pub subscript: Option<BinaryFunc>,
    pub ass_subscript: Option<AssSubscriptFunc>,
}

impl MappingSlots {
    /// Empty table usable in statics.
    pub const EMPTY: MappingSlots = MappingSlots {
        length: None,
        subscript: None,
        ass_subscript: None,
    };
}

/// A host type. The field order up to `iternext` is ABI: emitted `ForIter`
/// loops read `iternext` through the object's type by fixed offset.
#[repr(C)]
pub struct TypeObject {
    /// Types are objects too; `header.ty` points at the type-of-types.
    pub header: HostObject,
    /// Iteration step slot, read directly by emitted code.
    pub iternext: Option<IterNextFunc>,
    /// Printable type name.
    pub name: &'static str,
    /// Single base type, or `None` for `object`-level roots.
    pub base: Option<&'static TypeObject>,
    /// Destructor.
    pub dealloc: DeallocFunc,
    /// Numeric slots.
    pub number: Option<&'static NumberSlots>,
    /// Sequence slots.
    pub sequence: Option<&'static SequenceSlots>,
    /// Mapping slots.
    pub mapping: Option<&'static MappingSlots>,
    /// Rich comparison.
    pub richcompare: Option<RichCmpFunc>,
    /// Hashing; unhashable types leave this empty.
    pub hash: Option<HashFunc>,
    /// Truthiness; empty means "always true" unless a length slot exists.
    pub bool_: Option<BoolFunc>,
    /// Attribute read.
    pub getattr: Option<GetAttrFunc>,
    /// Attribute write/delete.
    pub setattr: Option<SetAttrFunc>,
    /// Vectorcall.
    pub call: Option<CallFunc>,
    /// `iter()` slot.
    pub iter: Option<UnaryFunc>,
    /// `str()` rendering.
    pub str_: Option<UnaryFunc>,
    /// `repr()` rendering.
    pub repr: Option<UnaryFunc>,
}

/// A no-op destructor for static types and singletons.
pub unsafe extern "C" fn dealloc_immortal(_obj: ObjPtr) {}

impl TypeObject {
    /// Byte offset of the `iternext` slot, shared with the emitter.
    pub fn iternext_offset() -> usize {
        std::mem::offset_of!(TypeObject, iternext)
    }

    /// Whether `self` is `other` or inherits from it.
    pub fn is_subtype(&'static self, other: &'static TypeObject) -> bool {
        let mut cursor = Some(self);
        while let Some(ty) = cursor {
            if std::ptr::eq(ty, other) {
                return true;
            }
            cursor = ty.base;
        }
        false
    }

    /// Template for building concrete types; fills every slot with "absent".
    pub const fn blank(name: &'static str, ty_of_types: *const TypeObject) -> TypeObject {
        TypeObject {
            header: HostObject::immortal(ty_of_types),
            iternext: None,
            name,
            base: None,
            dealloc: dealloc_immortal,
            number: None,
            sequence: None,
            mapping: None,
            richcompare: None,
            hash: None,
            bool_: None,
            getattr: None,
            setattr: None,
            call: None,
            iter: None,
            str_: None,
            repr: None,
        }
    }
}

/// The type of type objects.
pub static TYPE_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    call: Some(super::exc::type_call),
    repr: Some(type_repr),
    ..TypeObject::blank("type", &TYPE_TYPE.0)
});

unsafe fn type_repr(obj: ObjPtr) -> Option<ObjPtr> {
    let ty = &*(obj as *const TypeObject);
    Some(super::str::str_new(&format!("<class '{}'>", ty.name)))
}

/// View an object pointer as a type object.
///
/// # Safety
/// `obj` must point at a live object whose type is `type`.
pub unsafe fn as_type<'a>(obj: ObjPtr) -> &'a TypeObject {
    debug_assert!(std::ptr::eq((*obj).ty, &TYPE_TYPE.0));
    &*(obj as *const TypeObject)
}

/// Whether the object is a type object.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_type(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &TYPE_TYPE.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::exc::{EXCEPTION_TYPE, VALUE_ERROR};
    use crate::host::number::INT_TYPE;

    #[test]
    fn subtype_walks_base_chain() {
        assert!(VALUE_ERROR.0.is_subtype(&EXCEPTION_TYPE.0));
        assert!(!INT_TYPE.0.is_subtype(&EXCEPTION_TYPE.0));
        assert!(INT_TYPE.0.is_subtype(&INT_TYPE.0));
    }

    #[test]
    fn cmp_op_swaps() {
        assert_eq!(CmpOp::Lt.swapped(), CmpOp::Gt);
        assert_eq!(CmpOp::Eq.swapped(), CmpOp::Eq);
        assert_eq!(CmpOp::from_oparg(4), Some(CmpOp::Gt));
        assert_eq!(CmpOp::from_oparg(9), None);
    }

    #[test]
    fn iternext_slot_has_stable_offset() {
        // The emitter bakes this offset into generated code.
        assert_eq!(
            TypeObject::iternext_offset(),
            std::mem::size_of::<HostObject>()
        );
    }
}
