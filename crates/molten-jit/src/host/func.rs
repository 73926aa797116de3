//! Host code objects, functions, builtins, and cells
//!
//! A [`CodeObject`] wraps an immutable [`CodeUnit`] with its realized
//! constant and name tables (contiguous object-pointer arrays the emitter
//! indexes directly) and the extra slot where the translator parks
//! compiled code. [`FunctionObject`] field order is ABI from `defaults`
//! on: `MakeFunction` stores popped extras straight into those slots.

use molten_bytecode::{CodeUnit, Const};
use once_cell::sync::OnceCell;

use super::container::{dict_get_str, tuple_items, tuple_new};
use super::exc::{err_set_string, TYPE_ERROR};
use super::frame::Frame;
use super::number::{bool_obj, float_new, int_new, none};
use super::object::{
    alloc, decref, incref, xdecref, HostObject, ObjPtr, StaticObject,
};
use super::str::{is_str, str_new, str_value};
use super::typeobj::{TypeObject, TYPE_TYPE};

/// Evaluator invoked when a host function object is called. Installed once
/// by the engine; receives a ready frame and returns a new reference or
/// null with the error indicator set. The frame is freed by the caller.
pub type FrameEval = unsafe fn(*mut Frame) -> ObjPtr;

static FRAME_EVAL: OnceCell<FrameEval> = OnceCell::new();

/// Install the process-wide frame evaluator. Later installs are ignored.
pub fn install_frame_eval(eval: FrameEval) {
    let _ = FRAME_EVAL.set(eval);
}

/// A host code object.
#[repr(C)]
pub struct CodeObject {
    pub base: HostObject,
    /// Base of the realized constant table. ABI: emitted code loads this.
    pub consts_ptr: *const ObjPtr,
    /// Base of the realized name table. ABI: emitted code loads this.
    pub names_ptr: *const ObjPtr,
    /// Extra-data slot: the installed compiled entry point, or null.
    pub extra: *mut (),
    /// The immutable translation input.
    pub unit: CodeUnit,
    consts: Box<[ObjPtr]>,
    names: Box<[ObjPtr]>,
}

/// A host function.
#[repr(C)]
pub struct FunctionObject {
    pub base: HostObject,
    pub code: ObjPtr,
    pub globals: ObjPtr,
    pub builtins: ObjPtr,
    pub qualname: ObjPtr,
    /// Positional defaults tuple or null. ABI from here down.
    pub defaults: ObjPtr,
    /// Keyword-only defaults dict or null.
    pub kwdefaults: ObjPtr,
    /// Annotations dict or null.
    pub annotations: ObjPtr,
    /// Closure tuple of cells or null.
    pub closure: ObjPtr,
}

/// A builtin implemented in the host runtime.
#[repr(C)]
pub struct NativeFuncObject {
    pub base: HostObject,
    pub name: String,
    pub func: NativeFn,
}

/// Native callable: positional args plus an optional kwname tuple.
pub type NativeFn = unsafe fn(&[ObjPtr], ObjPtr) -> Option<ObjPtr>;

/// A closure cell.
#[repr(C)]
pub struct CellObject {
    pub base: HostObject,
    /// The referent; null when the cell is empty. ABI: deref opcodes read
    /// and write this field by offset.
    pub contents: ObjPtr,
}

/// The `code` type.
pub static CODE_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: code_dealloc,
    ..TypeObject::blank("code", &TYPE_TYPE.0)
});

/// The `function` type.
pub static FUNCTION_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: function_dealloc,
    call: Some(function_call),
    ..TypeObject::blank("function", &TYPE_TYPE.0)
});

/// The builtin-function type.
pub static NATIVE_FUNC_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: super::object::dealloc_as::<NativeFuncObject>,
    call: Some(native_call),
    ..TypeObject::blank("builtin_function_or_method", &TYPE_TYPE.0)
});

/// The `cell` type.
pub static CELL_TYPE: StaticObject<TypeObject> = StaticObject(TypeObject {
    dealloc: cell_dealloc,
    ..TypeObject::blank("cell", &TYPE_TYPE.0)
});

fn realize_const(value: &Const) -> ObjPtr {
    match value {
        Const::None => {
            let obj = none();
            unsafe { incref(obj) };
            obj
        }
        Const::Bool(b) => {
            let obj = bool_obj(*b);
            unsafe { incref(obj) };
            obj
        }
        Const::Int(i) => int_new(*i),
        Const::Float(f) => float_new(*f),
        Const::Str(s) => str_new(s),
        Const::Tuple(items) => tuple_new(items.iter().map(realize_const).collect()),
    }
}

/// Build a code object from a code unit, realizing its literal tables.
pub fn code_new(unit: CodeUnit) -> ObjPtr {
    let consts: Box<[ObjPtr]> = unit.consts.iter().map(realize_const).collect();
    let names: Box<[ObjPtr]> = unit.names.iter().map(|n| str_new(n)).collect();
    let obj = alloc(CodeObject {
        base: HostObject::new(&CODE_TYPE.0),
        consts_ptr: std::ptr::null(),
        names_ptr: std::ptr::null(),
        extra: std::ptr::null_mut(),
        unit,
        consts,
        names,
    });
    unsafe {
        let code = obj as *mut CodeObject;
        (*code).consts_ptr = (*code).consts.as_ptr();
        (*code).names_ptr = (*code).names.as_ptr();
    }
    obj
}

/// Whether the object is a code object.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_code(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &CODE_TYPE.0)
}

/// Borrow the code unit behind a code object.
///
/// # Safety
/// `code` must be a live code object.
pub unsafe fn code_unit<'a>(code: *mut CodeObject) -> &'a CodeUnit {
    &(*code).unit
}

/// Borrow the realized name table entry at `index`.
///
/// # Safety
/// `code` must be live and the index in range.
pub unsafe fn code_name(code: *mut CodeObject, index: usize) -> ObjPtr {
    (*code).names[index]
}

/// Borrow the realized constant at `index`.
///
/// # Safety
/// `code` must be live and the index in range.
pub unsafe fn code_const(code: *mut CodeObject, index: usize) -> ObjPtr {
    (*code).consts[index]
}

unsafe extern "C" fn code_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut CodeObject);
    for &c in boxed.consts.iter() {
        decref(c);
    }
    for &n in boxed.names.iter() {
        decref(n);
    }
}

/// Build a function object; steals `code`, `globals`, `builtins`,
/// `qualname`.
pub fn function_new(code: ObjPtr, globals: ObjPtr, builtins: ObjPtr, qualname: ObjPtr) -> ObjPtr {
    alloc(FunctionObject {
        base: HostObject::new(&FUNCTION_TYPE.0),
        code,
        globals,
        builtins,
        qualname,
        defaults: std::ptr::null_mut(),
        kwdefaults: std::ptr::null_mut(),
        annotations: std::ptr::null_mut(),
        closure: std::ptr::null_mut(),
    })
}

/// Whether the object is a host function.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_function(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &FUNCTION_TYPE.0)
}

unsafe extern "C" fn function_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut FunctionObject);
    decref(boxed.code);
    decref(boxed.globals);
    decref(boxed.builtins);
    decref(boxed.qualname);
    xdecref(boxed.defaults);
    xdecref(boxed.kwdefaults);
    xdecref(boxed.annotations);
    xdecref(boxed.closure);
}

/// Bind call arguments into a fresh frame's local slots.
///
/// Positional parameters first, then keyword arguments by name, then
/// defaults right-aligned, then keyword-only defaults. Cell slots for the
/// function's closure are populated from its closure tuple.
unsafe fn bind_arguments(
    frame: *mut Frame,
    func: &FunctionObject,
    args: &[ObjPtr],
    kwnames: ObjPtr,
) -> bool {
    let code = func.code as *mut CodeObject;
    let unit = code_unit(code);
    let total_named = (unit.arg_count + unit.kwonly_arg_count) as usize;
    let positional = unit.arg_count as usize;

    // Vectorcall layout: keyword values trail the positionals in `args`,
    // named by the kwname tuple.
    let kw_count = if kwnames.is_null() {
        0
    } else {
        tuple_items(kwnames).len()
    };
    let split = args.len() - kw_count;
    let (pos_args, kw_values) = args.split_at(split);

    if pos_args.len() > positional {
        err_set_string(
            &TYPE_ERROR.0,
            &format!(
                "{}() takes {} positional arguments but {} were given",
                unit.name,
                positional,
                pos_args.len()
            ),
        );
        return false;
    }

    let slots = (*frame).slots_mut();
    for (i, &arg) in pos_args.iter().enumerate() {
        incref(arg);
        slots[i] = arg;
    }

    if kw_count != 0 {
        let names = tuple_items(kwnames);
        for (offset, &name) in names.iter().enumerate() {
            debug_assert!(is_str(name));
            let wanted = str_value(name);
            let Some(index) = unit.varnames[..total_named]
                .iter()
                .position(|v| v.as_str() == wanted)
            else {
                err_set_string(
                    &TYPE_ERROR.0,
                    &format!("{}() got an unexpected keyword argument '{wanted}'", unit.name),
                );
                return false;
            };
            if !slots[index].is_null() {
                err_set_string(
                    &TYPE_ERROR.0,
                    &format!("{}() got multiple values for argument '{wanted}'", unit.name),
                );
                return false;
            }
            let value = kw_values[offset];
            incref(value);
            slots[index] = value;
        }
    }

    if !func.defaults.is_null() {
        let defaults = tuple_items(func.defaults);
        let first_defaulted = positional - defaults.len().min(positional);
        for (i, &default) in defaults.iter().enumerate() {
            let slot = first_defaulted + i;
            if slots[slot].is_null() {
                incref(default);
                slots[slot] = default;
            }
        }
    }

    if !func.kwdefaults.is_null() {
        for slot in positional..total_named {
            if slots[slot].is_null() {
                let name = str_new(&unit.varnames[slot]);
                if let Some(default) = dict_get_str(func.kwdefaults, name) {
                    incref(default);
                    slots[slot] = default;
                }
                decref(name);
            }
        }
    }

    for slot in slots.iter().take(total_named) {
        if slot.is_null() {
            err_set_string(
                &TYPE_ERROR.0,
                &format!("{}() missing required arguments", unit.name),
            );
            return false;
        }
    }

    if !func.closure.is_null() {
        let cells = tuple_items(func.closure);
        let cell_base = unit.nlocals as usize + unit.cellvars.len();
        for (i, &cell) in cells.iter().enumerate() {
            incref(cell);
            slots[cell_base + i] = cell;
        }
    }
    for i in 0..unit.cellvars.len() {
        slots[unit.nlocals as usize + i] = cell_new(std::ptr::null_mut());
    }

    true
}

unsafe fn function_call(callable: ObjPtr, args: &[ObjPtr], kwnames: ObjPtr) -> Option<ObjPtr> {
    let Some(&eval) = FRAME_EVAL.get() else {
        err_set_string(&TYPE_ERROR.0, "no frame evaluator installed");
        return None;
    };
    let func = &*(callable as *const FunctionObject);
    let frame = Frame::alloc(func.code as *mut CodeObject, func.globals, func.builtins);
    if !bind_arguments(frame, func, args, kwnames) {
        Frame::free(frame);
        return None;
    }
    let result = eval(frame);
    Frame::free(frame);
    if result.is_null() {
        None
    } else {
        Some(result)
    }
}

unsafe fn native_call(callable: ObjPtr, args: &[ObjPtr], kwnames: ObjPtr) -> Option<ObjPtr> {
    let native = &*(callable as *const NativeFuncObject);
    (native.func)(args, kwnames)
}

/// Build a native (builtin) function object.
pub fn native_new(name: &str, func: NativeFn) -> ObjPtr {
    alloc(NativeFuncObject {
        base: HostObject::new(&NATIVE_FUNC_TYPE.0),
        name: name.to_string(),
        func,
    })
}

/// Build a cell; steals `contents` (null for an empty cell).
pub fn cell_new(contents: ObjPtr) -> ObjPtr {
    alloc(CellObject {
        base: HostObject::new(&CELL_TYPE.0),
        contents,
    })
}

/// Whether the object is a cell.
///
/// # Safety
/// `obj` must point at a live object.
pub unsafe fn is_cell(obj: ObjPtr) -> bool {
    std::ptr::eq((*obj).ty, &CELL_TYPE.0)
}

unsafe extern "C" fn cell_dealloc(obj: ObjPtr) {
    let boxed = Box::from_raw(obj as *mut CellObject);
    xdecref(boxed.contents);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::number::int_value;
    use crate::host::state::test_reset_state;
    use molten_bytecode::Assembler;

    #[test]
    fn code_object_realizes_tables() {
        test_reset_state();
        let mut asm = Assembler::new("f");
        let k = asm.const_int(9);
        asm.op_arg(molten_bytecode::Opcode::LoadConst, k);
        asm.op(molten_bytecode::Opcode::ReturnValue);
        asm.name("print");
        let unit = asm.finish();

        unsafe {
            let code = code_new(unit) as *mut CodeObject;
            assert_eq!(int_value(code_const(code, 0)), 9);
            assert_eq!(str_value(code_name(code, 0)), "print");
            assert_eq!((*code).consts_ptr, (*code).consts.as_ptr());
            decref(code as ObjPtr);
        }
    }

    #[test]
    fn native_functions_are_callable() {
        test_reset_state();
        unsafe fn double(args: &[ObjPtr], _kw: ObjPtr) -> Option<ObjPtr> {
            unsafe { Some(int_new(int_value(args[0]) * 2)) }
        }
        unsafe {
            let f = native_new("double", double);
            let arg = int_new(21);
            let call = super::super::object::type_of(f).call.unwrap();
            let out = call(f, &[arg], std::ptr::null_mut()).unwrap();
            assert_eq!(int_value(out), 42);
            decref(out);
            decref(arg);
            decref(f);
        }
    }
}
