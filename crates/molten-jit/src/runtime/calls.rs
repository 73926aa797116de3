//! Call helpers
//!
//! Vectorcall-style dispatch: the emitter leaves the callable and its
//! arguments contiguous on the frame's value stack and passes the base
//! slot pointer here. Consumed references are released only after the
//! call returns, so a failing call leaves the slots for the unwinder to
//! drain at the recorded stack height.

use crate::host::container::{is_dict, is_list, is_tuple, list_as_tuple, tuple_items, tuple_new};
use crate::host::exc::{err_set_string, TYPE_ERROR};
use crate::host::frame::Frame;
use crate::host::func::function_new;
use crate::host::object::{decref, incref, type_of};
use crate::host::ObjPtr;

use super::unwind::goto_error_handler;

unsafe fn vectorcall(callable: ObjPtr, args: &[ObjPtr], kwnames: ObjPtr) -> ObjPtr {
    let Some(call) = type_of(callable).call else {
        err_set_string(
            &TYPE_ERROR.0,
            &format!("'{}' object is not callable", type_of(callable).name),
        );
        goto_error_handler();
    };
    match call(callable, args, kwnames) {
        Some(result) => result,
        None => goto_error_handler(),
    }
}

/// `CallFunction`: `func_args[0]` is the callable, then `nargs` values.
pub(crate) unsafe extern "C-unwind" fn handle_call_function(
    func_args: *mut ObjPtr,
    nargs: i64,
) -> ObjPtr {
    let callable = *func_args;
    let args = std::slice::from_raw_parts(func_args.add(1), nargs as usize);
    let result = vectorcall(callable, args, std::ptr::null_mut());
    for i in (0..=nargs as usize).rev() {
        decref(*func_args.add(i));
    }
    result
}

/// `CallMethod`: `func_args[0]` is the not-a-method sentinel or a bound
/// receiver, the callable and `nargs` values follow. The sentinel slot is
/// skipped; either way every consumed slot is released after the call.
pub(crate) unsafe extern "C-unwind" fn handle_call_method(
    func_args: *mut ObjPtr,
    nargs: i64,
) -> ObjPtr {
    let is_meth = !std::ptr::eq(*func_args, crate::host::number::not_a_method());
    let (callable_slot, arg_count) = if is_meth {
        // Receiver in slot 0 becomes the leading argument.
        (0usize, nargs as usize + 1)
    } else {
        (1usize, nargs as usize)
    };
    let callable = *func_args.add(callable_slot);
    let args = std::slice::from_raw_parts(func_args.add(callable_slot + 1), arg_count);
    let result = vectorcall(callable, args, std::ptr::null_mut());
    for i in (0..nargs as usize + 2).rev() {
        decref(*func_args.add(i));
    }
    result
}

/// `CallFunctionKw`: as above plus a trailing kwname tuple; the last
/// `len(kwnames)` values are the keyword arguments.
pub(crate) unsafe extern "C-unwind" fn handle_call_function_kw(
    func_args: *mut ObjPtr,
    nargs: i64,
) -> ObjPtr {
    let callable = *func_args;
    let kwnames = *func_args.add(nargs as usize + 1);
    debug_assert!(is_tuple(kwnames));
    let args = std::slice::from_raw_parts(func_args.add(1), nargs as usize);
    let result = vectorcall(callable, args, kwnames);
    for i in (0..=nargs as usize + 1).rev() {
        decref(*func_args.add(i));
    }
    result
}

/// `CallFunctionEx`: unpacked argument containers. The emitter owns the
/// operand references; this helper only borrows them.
pub(crate) unsafe extern "C-unwind" fn handle_call_function_ex(
    callable: ObjPtr,
    args: ObjPtr,
    kwargs: ObjPtr,
) -> ObjPtr {
    let args_tuple = if is_tuple(args) {
        incref(args);
        args
    } else if is_list(args) {
        list_as_tuple(args)
    } else {
        err_set_string(
            &TYPE_ERROR.0,
            &format!(
                "argument after * must be an iterable, not {}",
                type_of(args).name
            ),
        );
        goto_error_handler();
    };

    let result = if kwargs.is_null() {
        let positional = tuple_items(args_tuple);
        vectorcall(callable, positional, std::ptr::null_mut())
    } else {
        if !is_dict(kwargs) {
            decref(args_tuple);
            err_set_string(
                &TYPE_ERROR.0,
                &format!(
                    "argument after ** must be a mapping, not {}",
                    type_of(kwargs).name
                ),
            );
            goto_error_handler();
        }
        // Flatten the dict into vectorcall layout: positional values,
        // then keyword values named by a fresh kwname tuple.
        let mut values: Vec<ObjPtr> = tuple_items(args_tuple).to_vec();
        let mut names: Vec<ObjPtr> = Vec::new();
        for key in crate::host::container::dict_keys(kwargs) {
            let Ok(Some(value)) = crate::host::container::dict_get(kwargs, key) else {
                decref(args_tuple);
                goto_error_handler();
            };
            incref(key);
            names.push(key);
            values.push(value);
        }
        let kwnames = tuple_new(names);
        let result = vectorcall(callable, &values, kwnames);
        decref(kwnames);
        result
    };
    decref(args_tuple);
    result
}

/// `MakeFunction` minus the flag-driven extras, which the emitter stores
/// into the function object directly.
pub(crate) unsafe extern "C-unwind" fn handle_make_function(
    frame: *mut Frame,
    code: ObjPtr,
    qualname: ObjPtr,
) -> ObjPtr {
    incref(code);
    incref(qualname);
    incref((*frame).globals);
    incref((*frame).builtins);
    function_new(code, (*frame).globals, (*frame).builtins, qualname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::container::dict_new;
    use crate::host::number::{int_new, int_value};
    use crate::host::object::refcount;
    use crate::host::state::test_reset_state;
    use crate::host::str::str_new;

    unsafe fn sum_native(args: &[ObjPtr], _kw: ObjPtr) -> Option<ObjPtr> {
        unsafe {
            let mut total = 0;
            for &arg in args {
                total += int_value(arg);
            }
            Some(int_new(total))
        }
    }

    #[test]
    fn call_function_consumes_slots_after_success() {
        test_reset_state();
        unsafe {
            let callable = crate::host::func::native_new("sum", sum_native);
            let a = int_new(1);
            let b = int_new(2);
            incref(a);
            let mut slots = [callable, a, b];
            let result = handle_call_function(slots.as_mut_ptr(), 2);
            assert_eq!(int_value(result), 3);
            // One reference per slot was released.
            assert_eq!(refcount(a), 1);
            decref(a);
            decref(result);
        }
    }

    #[test]
    fn call_function_kw_splits_names() {
        test_reset_state();
        unsafe fn kw_probe(args: &[ObjPtr], kw: ObjPtr) -> Option<ObjPtr> {
            unsafe {
                assert_eq!(args.len(), 2);
                assert_eq!(tuple_items(kw).len(), 1);
                Some(int_new(int_value(args[0]) * 10 + int_value(args[1])))
            }
        }
        unsafe {
            let callable = crate::host::func::native_new("probe", kw_probe);
            let kwnames = tuple_new(vec![str_new("k")]);
            let mut slots = [callable, int_new(1), int_new(2), kwnames];
            let result = handle_call_function_kw(slots.as_mut_ptr(), 2);
            assert_eq!(int_value(result), 12);
            decref(result);
        }
    }

    #[test]
    fn call_function_ex_accepts_tuple_and_dict() {
        test_reset_state();
        unsafe fn probe(args: &[ObjPtr], kw: ObjPtr) -> Option<ObjPtr> {
            unsafe {
                let kw_count = if kw.is_null() {
                    0
                } else {
                    tuple_items(kw).len()
                };
                Some(int_new((args.len() * 10 + kw_count) as i64))
            }
        }
        unsafe {
            let callable = crate::host::func::native_new("probe", probe);
            let args = tuple_new(vec![int_new(1), int_new(2)]);
            let kwargs = dict_new();
            crate::host::container::dict_set(kwargs, str_new("k"), int_new(3));
            let result = handle_call_function_ex(callable, args, kwargs);
            // Two positional, one keyword value appended, one kwname.
            assert_eq!(int_value(result), 31);
            decref(result);
            decref(args);
            decref(kwargs);
            decref(callable);
        }
    }

    #[test]
    fn make_function_borrows_frame_namespaces() {
        test_reset_state();
        unsafe {
            let mut asm = molten_bytecode::Assembler::new("inner");
            asm.op(molten_bytecode::Opcode::Nop);
            let code = crate::host::func::code_new(asm.finish());
            let globals = dict_new();
            let builtins = dict_new();
            let frame = Frame::alloc(
                code as *mut crate::host::func::CodeObject,
                globals,
                builtins,
            );
            let qualname = str_new("inner");
            let func = handle_make_function(frame, code, qualname);
            assert!(crate::host::func::is_function(func));
            decref(func);
            // The function held its own references; originals intact.
            assert_eq!(refcount(code), 1);
            Frame::free(frame);
            decref(qualname);
            decref(code);
            decref(globals);
            decref(builtins);
        }
    }
}
