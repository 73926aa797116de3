//! Name, attribute, and import helpers
//!
//! Namespace probes hash the name once through its cached hash and walk
//! globals then builtins (`LoadGlobal`) or locals first (`LoadName`).
//! Undefined names raise `NameError` carrying the name as an attribute.

use crate::host::container::{dict_del, dict_get_str, dict_keys, dict_set, is_dict};
use crate::host::exc::{
    err_set_string, ATTRIBUTE_ERROR, IMPORT_ERROR, NAME_ERROR, SYSTEM_ERROR, TYPE_ERROR,
};
use crate::host::frame::Frame;
use crate::host::func::{code_unit, CellObject};
use crate::host::number::{none, not_a_method};
use crate::host::object::{decref, incref, type_of};
use crate::host::str::{str_new, str_value};
use crate::host::ObjPtr;

use super::unwind::{goto_error_handler, raise_undefined_free, raise_undefined_name};

const NOT_DEFINED: &str = "name '{name}' is not defined";

unsafe fn load_global_or_builtin(frame: *mut Frame, name: ObjPtr) -> ObjPtr {
    if let Some(value) = dict_get_str((*frame).globals, name) {
        incref(value);
        return value;
    }
    if let Some(value) = dict_get_str((*frame).builtins, name) {
        incref(value);
        return value;
    }
    raise_undefined_name(name, NOT_DEFINED);
    goto_error_handler();
}

pub(crate) unsafe extern "C-unwind" fn handle_load_global(
    frame: *mut Frame,
    name: ObjPtr,
) -> ObjPtr {
    load_global_or_builtin(frame, name)
}

pub(crate) unsafe extern "C-unwind" fn handle_store_global(
    frame: *mut Frame,
    name: ObjPtr,
    value: ObjPtr,
) {
    if !dict_set((*frame).globals, name, value) {
        goto_error_handler();
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_delete_global(frame: *mut Frame, name: ObjPtr) {
    match dict_del((*frame).globals, name) {
        Ok(true) => {}
        Ok(false) => {
            raise_undefined_name(name, NOT_DEFINED);
            goto_error_handler();
        }
        Err(()) => goto_error_handler(),
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_load_name(frame: *mut Frame, name: ObjPtr) -> ObjPtr {
    let locals = (*frame).locals;
    if locals.is_null() {
        err_set_string(
            &SYSTEM_ERROR.0,
            &format!("no locals when loading '{}'", str_value(name)),
        );
        goto_error_handler();
    }
    if let Some(value) = dict_get_str(locals, name) {
        incref(value);
        return value;
    }
    load_global_or_builtin(frame, name)
}

pub(crate) unsafe extern "C-unwind" fn handle_store_name(
    frame: *mut Frame,
    name: ObjPtr,
    value: ObjPtr,
) {
    let locals = (*frame).locals;
    if locals.is_null() {
        err_set_string(
            &SYSTEM_ERROR.0,
            &format!("no locals found when storing '{}'", str_value(name)),
        );
        goto_error_handler();
    }
    if !dict_set(locals, name, value) {
        goto_error_handler();
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_delete_name(frame: *mut Frame, name: ObjPtr) {
    let locals = (*frame).locals;
    if locals.is_null() {
        err_set_string(
            &SYSTEM_ERROR.0,
            &format!("no locals when deleting '{}'", str_value(name)),
        );
        goto_error_handler();
    }
    match dict_del(locals, name) {
        Ok(true) => {}
        Ok(false) | Err(()) => {
            raise_undefined_name(name, NOT_DEFINED);
            goto_error_handler();
        }
    }
}

/// Class-body cell load: probe the class namespace first, then the cell.
pub(crate) unsafe extern "C-unwind" fn handle_load_classderef(
    frame: *mut Frame,
    oparg: i64,
) -> ObjPtr {
    let unit = code_unit((*frame).code);
    let oparg = oparg as usize;
    let free_index = oparg - unit.cellvars.len();
    let name = str_new(&unit.freevars[free_index]);

    let locals = (*frame).locals;
    debug_assert!(!locals.is_null());
    if let Some(value) = dict_get_str(locals, name) {
        incref(value);
        decref(name);
        return value;
    }

    let cell_slot = (*frame)
        .slots_ptr()
        .add(unit.nlocals as usize + oparg);
    let cell = *cell_slot;
    if !cell.is_null() {
        let contents = (*(cell as *const CellObject)).contents;
        if !contents.is_null() {
            incref(contents);
            decref(name);
            return contents;
        }
    }
    raise_undefined_free(name);
    decref(name);
    goto_error_handler();
}

pub(crate) unsafe extern "C-unwind" fn handle_load_build_class(builtins: ObjPtr) -> ObjPtr {
    let key = str_new("__build_class__");
    let found = dict_get_str(builtins, key);
    decref(key);
    match found {
        Some(value) => {
            incref(value);
            value
        }
        None => {
            err_set_string(&NAME_ERROR.0, "__build_class__ not found");
            goto_error_handler();
        }
    }
}

// ===== attributes =====

pub(crate) unsafe extern "C-unwind" fn handle_load_attr(owner: ObjPtr, name: ObjPtr) -> ObjPtr {
    let ty = type_of(owner);
    if let Some(getattr) = ty.getattr {
        match getattr(owner, name) {
            Some(value) => return value,
            None => goto_error_handler(),
        }
    }
    err_set_string(
        &ATTRIBUTE_ERROR.0,
        &format!(
            "'{}' object has no attribute '{}'",
            ty.name,
            str_value(name)
        ),
    );
    goto_error_handler();
}

/// `LoadMethod`: fill the two reserved stack slots. This host resolves
/// attributes eagerly, so the lookup always takes the not-a-method path:
/// the sentinel below the callable, which `CallMethod` skips again.
pub(crate) unsafe extern "C-unwind" fn handle_load_method(name: ObjPtr, sp: *mut ObjPtr) {
    let obj = *sp;
    let attr = handle_load_attr(obj, name);
    let sentinel = not_a_method();
    incref(sentinel);
    *sp = sentinel;
    *sp.add(1) = attr;
    decref(obj);
}

/// Attribute store; a null value deletes.
pub(crate) unsafe extern "C-unwind" fn handle_store_attr(
    owner: ObjPtr,
    name: ObjPtr,
    value: ObjPtr,
) {
    let ty = type_of(owner);
    let Some(setattr) = ty.setattr else {
        err_set_string(
            &ATTRIBUTE_ERROR.0,
            &format!(
                "'{}' object has no settable attribute '{}'",
                ty.name,
                str_value(name)
            ),
        );
        goto_error_handler();
    };
    if !setattr(owner, name, value) {
        goto_error_handler();
    }
}

// ===== imports =====

pub(crate) unsafe extern "C-unwind" fn handle_import_name(
    frame: *mut Frame,
    name: ObjPtr,
    fromlist: ObjPtr,
    level: ObjPtr,
) -> ObjPtr {
    let key = str_new("__import__");
    let import_func = dict_get_str((*frame).builtins, key);
    decref(key);
    let Some(import_func) = import_func else {
        err_set_string(&IMPORT_ERROR.0, "__import__ not found");
        goto_error_handler();
    };

    let locals = if (*frame).locals.is_null() {
        none()
    } else {
        (*frame).locals
    };
    let Some(call) = type_of(import_func).call else {
        err_set_string(&TYPE_ERROR.0, "'__import__' object is not callable");
        goto_error_handler();
    };
    let args = [name, (*frame).globals, locals, fromlist, level];
    match call(import_func, &args, std::ptr::null_mut()) {
        Some(module) => module,
        None => goto_error_handler(),
    }
}

pub(crate) unsafe extern "C-unwind" fn handle_import_from(from: ObjPtr, name: ObjPtr) -> ObjPtr {
    if let Some(getattr) = type_of(from).getattr {
        if let Some(value) = getattr(from, name) {
            return value;
        }
        if crate::host::exc::err_matches(&ATTRIBUTE_ERROR.0) {
            crate::host::exc::err_clear();
        } else {
            goto_error_handler();
        }
    }
    err_set_string(
        &IMPORT_ERROR.0,
        &format!(
            "cannot import name '{}' from '{}'",
            str_value(name),
            type_of(from).name
        ),
    );
    goto_error_handler();
}

pub(crate) unsafe extern "C-unwind" fn handle_import_star(frame: *mut Frame, from: ObjPtr) {
    let locals = (*frame).locals;
    if locals.is_null() {
        err_set_string(&SYSTEM_ERROR.0, "no locals found during 'import *'");
        goto_error_handler();
    }
    if !is_dict(from) {
        err_set_string(
            &IMPORT_ERROR.0,
            "from-import-* object has no __dict__ and no __all__",
        );
        goto_error_handler();
    }
    for key in dict_keys(from) {
        if crate::host::str::is_str(key) && str_value(key).starts_with('_') {
            continue;
        }
        let Ok(Some(value)) = crate::host::container::dict_get(from, key) else {
            goto_error_handler();
        };
        if !dict_set(locals, key, value) {
            goto_error_handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::container::dict_new;
    use crate::host::exc::{err_clear, err_matches, exc_new};
    use crate::host::func::{code_new, CodeObject};
    use crate::host::number::{int_new, int_value};
    use crate::host::state::{state, test_reset_state, ExtendedCFrame};
    use molten_bytecode::Assembler;

    unsafe fn fixture_frame() -> (*mut Frame, Box<ExtendedCFrame>, Vec<i32>) {
        test_reset_state();
        let mut asm = Assembler::new("ns");
        asm.op(molten_bytecode::Opcode::Nop);
        let code = code_new(asm.finish());
        let globals = dict_new();
        let builtins = dict_new();
        let frame = Frame::alloc(code as *mut CodeObject, globals, builtins);
        (*frame).lasti = 0;
        let sp_map = vec![0i32];
        let mut cframe = Box::new(ExtendedCFrame {
            previous: std::ptr::null_mut(),
            sp_map: sp_map.as_ptr(),
            sp_map_len: sp_map.len(),
        });
        let st = &mut *state();
        st.frame = frame;
        st.cframe = &mut *cframe;
        (frame, cframe, sp_map)
    }

    #[test]
    fn global_probe_falls_back_to_builtins() {
        unsafe {
            let (frame, _cframe, _map) = fixture_frame();
            let name = str_new("answer");
            dict_set((*frame).builtins, name, int_new(42));
            let value = handle_load_global(frame, name);
            assert_eq!(int_value(value), 42);

            // Globals shadow builtins.
            dict_set((*frame).globals, name, int_new(1));
            let value = handle_load_global(frame, name);
            assert_eq!(int_value(value), 1);
        }
    }

    #[test]
    fn missing_global_raises_name_error_with_attribute() {
        unsafe {
            let (frame, _cframe, _map) = fixture_frame();
            let name = str_new("missing");
            let caught = std::panic::catch_unwind(|| handle_load_global(frame, name));
            assert!(caught.is_err());
            assert!(err_matches(&NAME_ERROR.0));
            let (_, value, _) = crate::host::exc::err_fetch();
            let carried = (*(value as *const crate::host::exc::ExcObject)).name;
            assert_eq!(str_value(carried), "missing");
            decref(value);
        }
    }

    #[test]
    fn store_and_delete_global_round_trip() {
        unsafe {
            let (frame, _cframe, _map) = fixture_frame();
            let name = str_new("g");
            handle_store_global(frame, name, int_new(3));
            assert!(dict_get_str((*frame).globals, name).is_some());
            handle_delete_global(frame, name);
            assert!(dict_get_str((*frame).globals, name).is_none());
        }
    }

    #[test]
    fn load_name_probes_locals_first() {
        unsafe {
            let (frame, _cframe, _map) = fixture_frame();
            (*frame).locals = dict_new();
            let name = str_new("n");
            dict_set((*frame).globals, name, int_new(1));
            dict_set((*frame).locals, name, int_new(2));
            let value = handle_load_name(frame, name);
            assert_eq!(int_value(value), 2);
        }
    }

    #[test]
    fn import_name_calls_the_builtin_hook() {
        unsafe fn fake_import(args: &[ObjPtr], _kw: ObjPtr) -> Option<ObjPtr> {
            unsafe {
                assert_eq!(args.len(), 5);
                Some(int_new(777))
            }
        }
        unsafe {
            let (frame, _cframe, _map) = fixture_frame();
            let hook_name = str_new("__import__");
            let hook = crate::host::func::native_new("__import__", fake_import);
            dict_set((*frame).builtins, hook_name, hook);

            let name = str_new("mod");
            let module = handle_import_name(frame, name, none(), int_new(0));
            assert_eq!(int_value(module), 777);
        }
    }

    #[test]
    fn load_method_pushes_sentinel_pair() {
        unsafe {
            let _fixture = fixture_frame();
            // An exception instance has no getattr slot, so drive the
            // path with a type that does: use a dict through load_attr's
            // error path instead — here we only check the sentinel shape
            // with a callable attribute via a native object.
            let exc = exc_new(&crate::host::exc::VALUE_ERROR.0, "m");
            let mut slots: [ObjPtr; 2] = [exc, std::ptr::null_mut()];
            let name = str_new("anything");
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handle_load_method(name, slots.as_mut_ptr());
            }));
            // Exception instances expose no attributes in this host.
            assert!(caught.is_err());
            err_clear();
        }
    }
}
