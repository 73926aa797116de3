//! The runtime helpers table
//!
//! A process-wide `#[repr(C)]` struct of pointers, initialized once and
//! passed to every compiled function as its first argument. Emitted code
//! reaches helpers by loading the entry at a fixed offset and calling it
//! indirectly, so position-independent code needs no relocations; the
//! [`Sym`] enum is the emitter- and backend-side name for each offset.
//! The first few entries are data pointers (the boolean and `None`
//! singletons); everything else is a `C-unwind` function pointer, since a
//! failing helper escapes by unwinding rather than returning.

use once_cell::sync::Lazy;

use crate::host::frame::Frame;
use crate::host::number::{false_obj, none, true_obj};
use crate::host::ObjPtr;

use super::{calls, containers, names, ops, unwind};

/// Unary operator helper.
pub type UnaryHelper = unsafe extern "C-unwind" fn(ObjPtr) -> ObjPtr;
/// Binary operator helper.
pub type BinaryHelper = unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) -> ObjPtr;

macro_rules! helper_table {
    ($( $variant:ident => $field:ident : $ty:ty = $init:expr; )+) => {
        /// The fixed-offset table of runtime entry points.
        #[repr(C)]
        pub struct HelperTable {
            $( pub $field: $ty, )+
        }

        /// Name of a table entry; resolves to its byte offset for the
        /// backend and to a label for IR display.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Sym {
            $( $variant, )+
        }

        impl Sym {
            /// Byte offset of the entry inside the table.
            pub fn offset(self) -> usize {
                match self {
                    $( Sym::$variant => std::mem::offset_of!(HelperTable, $field), )+
                }
            }

            /// Field name, used by the IR printer.
            pub fn name(self) -> &'static str {
                match self {
                    $( Sym::$variant => stringify!($field), )+
                }
            }
        }

        impl HelperTable {
            fn new() -> Self {
                HelperTable {
                    $( $field: $init, )+
                }
            }
        }
    };
}

helper_table! {
    // Data entries: the singletons compiled code compares against.
    PyTrue => py_true: ObjPtr = true_obj();
    PyFalse => py_false: ObjPtr = false_obj();
    PyNone => py_none: ObjPtr = none();

    // Refcount escape hatch: the inlined decref's zero path.
    Dealloc => dealloc: unsafe extern "C-unwind" fn(ObjPtr) = unwind::handle_dealloc;

    // Unary operators.
    UnaryNot => unary_not: UnaryHelper = ops::handle_unary_not;
    UnaryPositive => unary_positive: UnaryHelper = ops::handle_unary_positive;
    UnaryNegative => unary_negative: UnaryHelper = ops::handle_unary_negative;
    UnaryInvert => unary_invert: UnaryHelper = ops::handle_unary_invert;

    // Binary and in-place operators.
    BinaryAdd => binary_add: BinaryHelper = ops::handle_binary_add;
    InplaceAdd => inplace_add: BinaryHelper = ops::handle_inplace_add;
    BinarySubtract => binary_subtract: BinaryHelper = ops::handle_binary_subtract;
    InplaceSubtract => inplace_subtract: BinaryHelper = ops::handle_inplace_subtract;
    BinaryMultiply => binary_multiply: BinaryHelper = ops::handle_binary_multiply;
    InplaceMultiply => inplace_multiply: BinaryHelper = ops::handle_inplace_multiply;
    BinaryFloorDivide => binary_floor_divide: BinaryHelper = ops::handle_binary_floor_divide;
    InplaceFloorDivide => inplace_floor_divide: BinaryHelper = ops::handle_inplace_floor_divide;
    BinaryTrueDivide => binary_true_divide: BinaryHelper = ops::handle_binary_true_divide;
    InplaceTrueDivide => inplace_true_divide: BinaryHelper = ops::handle_inplace_true_divide;
    BinaryModulo => binary_modulo: BinaryHelper = ops::handle_binary_modulo;
    InplaceModulo => inplace_modulo: BinaryHelper = ops::handle_inplace_modulo;
    BinaryPower => binary_power: BinaryHelper = ops::handle_binary_power;
    InplacePower => inplace_power: BinaryHelper = ops::handle_inplace_power;
    BinaryMatrixMultiply => binary_matrix_multiply: BinaryHelper = ops::handle_binary_matrix_multiply;
    InplaceMatrixMultiply => inplace_matrix_multiply: BinaryHelper = ops::handle_inplace_matrix_multiply;
    BinaryLshift => binary_lshift: BinaryHelper = ops::handle_binary_lshift;
    InplaceLshift => inplace_lshift: BinaryHelper = ops::handle_inplace_lshift;
    BinaryRshift => binary_rshift: BinaryHelper = ops::handle_binary_rshift;
    InplaceRshift => inplace_rshift: BinaryHelper = ops::handle_inplace_rshift;
    BinaryAnd => binary_and: BinaryHelper = ops::handle_binary_and;
    InplaceAnd => inplace_and: BinaryHelper = ops::handle_inplace_and;
    BinaryOr => binary_or: BinaryHelper = ops::handle_binary_or;
    InplaceOr => inplace_or: BinaryHelper = ops::handle_inplace_or;
    BinaryXor => binary_xor: BinaryHelper = ops::handle_binary_xor;
    InplaceXor => inplace_xor: BinaryHelper = ops::handle_inplace_xor;

    BinarySubscr => binary_subscr: BinaryHelper = ops::handle_binary_subscr;
    StoreSubscr => store_subscr: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, ObjPtr) = ops::handle_store_subscr;
    CompareOp => compare_op: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, i64) -> ObjPtr = ops::handle_compare_op;
    ContainsOp => contains_op: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) -> i64 = ops::handle_contains_op;
    CastToBool => cast_to_bool: unsafe extern "C-unwind" fn(ObjPtr) -> i64 = ops::cast_to_bool;

    // Name lookup.
    LoadGlobal => load_global: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr) -> ObjPtr = names::handle_load_global;
    StoreGlobal => store_global: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr, ObjPtr) = names::handle_store_global;
    DeleteGlobal => delete_global: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr) = names::handle_delete_global;
    LoadName => load_name: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr) -> ObjPtr = names::handle_load_name;
    StoreName => store_name: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr, ObjPtr) = names::handle_store_name;
    DeleteName => delete_name: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr) = names::handle_delete_name;
    LoadClassderef => load_classderef: unsafe extern "C-unwind" fn(*mut Frame, i64) -> ObjPtr = names::handle_load_classderef;
    LoadBuildClass => load_build_class: unsafe extern "C-unwind" fn(ObjPtr) -> ObjPtr = names::handle_load_build_class;

    // Attributes and methods.
    LoadAttr => load_attr: BinaryHelper = names::handle_load_attr;
    LoadMethod => load_method: unsafe extern "C-unwind" fn(ObjPtr, *mut ObjPtr) = names::handle_load_method;
    StoreAttr => store_attr: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, ObjPtr) = names::handle_store_attr;

    // Iteration.
    GetIter => get_iter: UnaryHelper = ops::handle_get_iter;

    // Calls.
    CallFunction => call_function: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = calls::handle_call_function;
    CallMethod => call_method: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = calls::handle_call_method;
    CallFunctionKw => call_function_kw: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = calls::handle_call_function_kw;
    CallFunctionEx => call_function_ex: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, ObjPtr) -> ObjPtr = calls::handle_call_function_ex;
    MakeFunction => make_function: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr, ObjPtr) -> ObjPtr = calls::handle_make_function;

    // Imports.
    ImportName => import_name: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr, ObjPtr, ObjPtr) -> ObjPtr = names::handle_import_name;
    ImportFrom => import_from: BinaryHelper = names::handle_import_from;
    ImportStar => import_star: unsafe extern "C-unwind" fn(*mut Frame, ObjPtr) = names::handle_import_star;

    // Container builders and appends.
    BuildString => build_string: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = containers::handle_build_string;
    BuildTuple => build_tuple: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = containers::handle_build_tuple;
    BuildList => build_list: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = containers::handle_build_list;
    BuildSet => build_set: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = containers::handle_build_set;
    BuildMap => build_map: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = containers::handle_build_map;
    BuildConstKeyMap => build_const_key_map: unsafe extern "C-unwind" fn(*mut ObjPtr, i64) -> ObjPtr = containers::handle_build_const_key_map;
    ListAppend => list_append: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) = containers::handle_list_append;
    SetAdd => set_add: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) = containers::handle_set_add;
    MapAdd => map_add: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, ObjPtr) = containers::handle_map_add;
    ListExtend => list_extend: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) = containers::handle_list_extend;
    SetUpdate => set_update: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) = containers::handle_set_update;
    DictUpdate => dict_update: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) = containers::handle_dict_update;
    DictMerge => dict_merge: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, ObjPtr) = containers::handle_dict_merge;
    ListToTuple => list_to_tuple: UnaryHelper = containers::handle_list_to_tuple;
    FormatValue => format_value: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, i64) -> ObjPtr = containers::handle_format_value;

    // Exception machinery.
    RaiseException => raise_exception: unsafe extern "C-unwind" fn() -> ! = unwind::raise_exception;
    RaiseVarargs => raise_varargs: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) -> ! = unwind::handle_raise_varargs;
    BlockSetup => block_setup: unsafe extern "C-unwind" fn(*mut Frame, i64, i64, i64) = unwind::handle_block_setup;
    BlockPop => block_pop: unsafe extern "C-unwind" fn(*mut Frame) = unwind::handle_block_pop;
    PopExcept => pop_except: unsafe extern "C-unwind" fn(*mut Frame) = unwind::handle_pop_except;
    ExcMatch => exc_match: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr) -> i64 = unwind::handle_exc_match;
    Reraise => reraise: unsafe extern "C-unwind" fn(*mut Frame, i64) -> ! = unwind::handle_reraise;
    SetupWith => setup_with: unsafe extern "C-unwind" fn(*mut Frame, *mut ObjPtr, i64) = unwind::handle_setup_with;
    WithExceptStart => with_except_start: unsafe extern "C-unwind" fn(ObjPtr, ObjPtr, ObjPtr, ObjPtr) -> ObjPtr = unwind::handle_with_except_start;
    UnimplementedOpcode => unimplemented_opcode: unsafe extern "C-unwind" fn() -> ! = unwind::handle_unimplemented_opcode;
}

// Safety: the data entries are immortal singletons and the function
// pointers are immutable after initialization.
unsafe impl Sync for HelperTable {}
unsafe impl Send for HelperTable {}

static TABLE: Lazy<HelperTable> = Lazy::new(HelperTable::new);

/// The process-wide table.
pub fn helpers() -> &'static HelperTable {
    &TABLE
}

/// The table as the raw pointer compiled functions receive.
pub fn helpers_ptr() -> *const HelperTable {
    helpers() as *const HelperTable
}

impl HelperTable {
    /// Read the raw entry at a symbol's offset, the way emitted code does.
    ///
    /// # Safety
    /// `sym` must name an entry of this table.
    pub unsafe fn entry(&self, sym: Sym) -> *const () {
        let base = self as *const HelperTable as *const u8;
        *(base.add(sym.offset()) as *const *const ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_pointer_strides() {
        assert_eq!(Sym::PyTrue.offset(), 0);
        assert_eq!(Sym::PyFalse.offset(), std::mem::size_of::<usize>());
        // Every entry is pointer-sized; the table is a flat array.
        assert_eq!(
            std::mem::size_of::<HelperTable>() % std::mem::size_of::<usize>(),
            0
        );
    }

    #[test]
    fn entries_resolve_like_emitted_loads() {
        let table = helpers();
        unsafe {
            assert_eq!(
                table.entry(Sym::PyTrue),
                crate::host::number::true_obj() as *const ()
            );
            assert_eq!(
                table.entry(Sym::BinaryAdd),
                table.binary_add as *const ()
            );
        }
    }

    #[test]
    fn names_match_fields() {
        assert_eq!(Sym::BinaryAdd.name(), "binary_add");
        assert_eq!(Sym::RaiseException.name(), "raise_exception");
    }
}
