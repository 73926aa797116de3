//! Raise dispatch, frame unwinding, and the non-local exit
//!
//! Compiled code cannot unwind through interpreter frames with host
//! exception machinery. Every call into emitted code is bracketed by
//! `catch_unwind` in the dispatcher; when a helper fails, the unwinder
//! reconciles the frame's try-block stack — releasing operand-stack slack,
//! restoring previous exception triples, or arming a finally handler with
//! its six-value context — and then escapes by panicking with a
//! [`FrameTransfer`] token. The catch site inspects the frame to either
//! re-enter at the armed handler or report the raise.

use molten_bytecode::Opcode;

use crate::host::container::tuple_new;
use crate::host::exc::{
    class_obj, err_fetch, err_normalize, err_occurred, err_restore, err_set_string, exc_matches,
    exc_set_cause, is_exc_class, is_exc_instance, traceback_here, NAME_ERROR, RUNTIME_ERROR,
    SYSTEM_ERROR, TYPE_ERROR, UNBOUND_LOCAL_ERROR,
};
use crate::host::frame::{frame_state, Frame, BLOCK_EXCEPT_HANDLER, BLOCK_SETUP_FINALLY};
use crate::host::number::none;
use crate::host::object::{decref, incref, type_of, xdecref};
use crate::host::state::{recorded_stack_height, state};
use crate::host::str::str_new;
use crate::host::typeobj::as_type;
use crate::host::ObjPtr;

/// Panic payload carried by the non-local exit. The catch site reads the
/// frame state to learn whether a handler was armed.
pub struct FrameTransfer;

/// Escape to the dispatcher's catch site.
fn transfer() -> ! {
    std::panic::resume_unwind(Box::new(FrameTransfer));
}

/// Raise a `NameError` carrying the offending name as an attribute.
pub(crate) unsafe fn raise_undefined_name(name: ObjPtr, format: &str) {
    let text = format.replace("{name}", crate::host::str::str_value(name));
    let value = crate::host::exc::exc_new(&NAME_ERROR.0, &text);
    incref(name);
    crate::host::exc::exc_set_name(value, name);
    crate::host::exc::err_set_object_stolen(&NAME_ERROR.0, value);
}

pub(crate) unsafe fn raise_undefined_local(name: ObjPtr) {
    err_set_string(
        &UNBOUND_LOCAL_ERROR.0,
        &format!(
            "local variable '{}' referenced before assignment",
            crate::host::str::str_value(name)
        ),
    );
}

pub(crate) unsafe fn raise_undefined_free(name: ObjPtr) {
    raise_undefined_name(
        name,
        "free variable '{name}' referenced before assignment in enclosing scope",
    );
}

unsafe fn stack_push(frame: *mut Frame, value: ObjPtr) {
    let f = &mut *frame;
    *f.valuestack_ptr().add(f.stackdepth as usize) = value;
    f.stackdepth += 1;
}

unsafe fn stack_pop(frame: *mut Frame) -> ObjPtr {
    let f = &mut *frame;
    f.stackdepth -= 1;
    *f.valuestack_ptr().add(f.stackdepth as usize)
}

/// Walk the frame's try-block stack after a raise: pop plain blocks
/// (releasing operand-stack slack), pop active handler blocks (restoring
/// the previous exception triple), and on a finally block arm the handler
/// with its six-value context before escaping.
pub(crate) unsafe fn goto_unwind(frame: *mut Frame) -> ! {
    let f = &mut *frame;
    f.state = frame_state::UNWINDING;
    let mut handler: i32 = -1;

    while f.iblock > 0 {
        let block = Frame::block_pop(frame);

        if block.kind == BLOCK_EXCEPT_HANDLER {
            while f.stackdepth > block.level + 3 {
                xdecref(stack_pop(frame));
            }
            let st = &mut *state();
            let old_type = st.exc_info.exc_type;
            let old_value = st.exc_info.exc_value;
            let old_tb = st.exc_info.exc_traceback;
            st.exc_info.exc_type = stack_pop(frame);
            st.exc_info.exc_value = stack_pop(frame);
            st.exc_info.exc_traceback = stack_pop(frame);
            xdecref(old_type);
            xdecref(old_value);
            xdecref(old_tb);
            continue;
        }

        while f.stackdepth > block.level {
            xdecref(stack_pop(frame));
        }

        debug_assert_eq!(block.kind, BLOCK_SETUP_FINALLY);
        handler = block.handler;

        // Replace the finally block with a handler block recording the
        // depth to restore on POP_EXCEPT, then push the previous and the
        // normalized current exception triples.
        let st = &mut *state();
        Frame::block_setup(frame, BLOCK_EXCEPT_HANDLER, f.lasti, f.stackdepth);
        stack_push(frame, st.exc_info.exc_traceback);
        stack_push(frame, st.exc_info.exc_value);
        if !st.exc_info.exc_type.is_null() {
            stack_push(frame, st.exc_info.exc_type);
        } else {
            incref(none());
            stack_push(frame, none());
        }

        let (mut exc, mut value, mut tb) = err_fetch();
        err_normalize(&mut exc, &mut value, &mut tb);
        incref(exc);
        st.exc_info.exc_type = exc;
        incref(value);
        st.exc_info.exc_value = value;
        st.exc_info.exc_traceback = tb;

        let pushed_tb = if tb.is_null() { none() } else { tb };
        incref(pushed_tb);
        stack_push(frame, pushed_tb);
        stack_push(frame, value);
        stack_push(frame, exc);

        f.state = frame_state::EXECUTING;
        break;
    }

    if handler >= 0 {
        f.resume = handler;
        transfer();
    }

    while f.stackdepth > 0 {
        xdecref(stack_pop(frame));
    }
    f.state = frame_state::RAISED;
    transfer();
}

/// Entry point for helper failures: record the traceback, reconstruct the
/// operand-stack depth from the side table, and unwind.
pub(crate) unsafe fn goto_error_handler() -> ! {
    debug_assert!(err_occurred());
    let st = &*state();
    let frame = st.frame;
    traceback_here((*frame).lasti);
    (*frame).stackdepth = recorded_stack_height((*frame).lasti);
    goto_unwind(frame);
}

/// The inlined decref's zero path.
pub(crate) unsafe extern "C-unwind" fn handle_dealloc(obj: ObjPtr) {
    (type_of(obj).dealloc)(obj);
}

/// Raise the opcode-specific error for a null observed by emitted code,
/// dispatching on the current instruction the way the interpreter's error
/// messages do.
pub(crate) unsafe extern "C-unwind" fn raise_exception() -> ! {
    let st = &*state();
    let frame = st.frame;
    let code = (*frame).code;
    let unit = crate::host::func::code_unit(code);
    let lasti = (*frame).lasti as usize;
    let opcode = Opcode::from_u8(unit.raw(lasti).0);
    let oparg = unit.full_oparg(lasti) as usize;

    match opcode {
        Some(Opcode::LoadFast) | Some(Opcode::DeleteFast) => {
            let name = str_new(&unit.varnames[oparg]);
            raise_undefined_local(name);
            decref(name);
        }
        Some(Opcode::LoadDeref) | Some(Opcode::DeleteDeref) => {
            if oparg < unit.cellvars.len() {
                let name = str_new(&unit.cellvars[oparg]);
                raise_undefined_local(name);
                decref(name);
            } else {
                let name = str_new(&unit.freevars[oparg - unit.cellvars.len()]);
                raise_undefined_free(name);
                decref(name);
            }
        }
        Some(Opcode::GenStart) => {
            if oparg > 2 {
                err_set_string(&SYSTEM_ERROR.0, "illegal kind for GEN_START");
            } else {
                let kind = ["generator", "coroutine", "async generator"][oparg];
                err_set_string(
                    &TYPE_ERROR.0,
                    &format!("can't send non-None value to a just-started {kind}"),
                );
            }
        }
        _ => {
            debug_assert!(err_occurred(), "raise_exception with no pending error");
        }
    }
    goto_error_handler();
}

/// `raise` / `raise exc` / `raise exc from cause`. Consumes a reference
/// to each non-null argument.
pub(crate) unsafe extern "C-unwind" fn handle_raise_varargs(cause: ObjPtr, exc: ObjPtr) -> ! {
    if exc.is_null() {
        debug_assert!(cause.is_null());
        let st = &*state();
        let info = &st.exc_info;
        if info.exc_type.is_null() || std::ptr::eq(info.exc_type, none()) {
            err_set_string(&RUNTIME_ERROR.0, "No active exception to reraise");
            goto_error_handler();
        }
        incref(info.exc_type);
        if !info.exc_value.is_null() {
            incref(info.exc_value);
        }
        if !info.exc_traceback.is_null() {
            incref(info.exc_traceback);
        }
        err_restore(info.exc_type, info.exc_value, info.exc_traceback);
        goto_error_handler();
    }

    let (ty, value) = if is_exc_class(exc) {
        let class = as_type(exc);
        let class: &'static crate::host::TypeObject = std::mem::transmute(class);
        let value = crate::host::exc::exc_new_with_args(class, tuple_new(vec![]));
        (exc, value)
    } else if is_exc_instance(exc) {
        // The consumed reference moves into the error triple.
        let class = class_obj(std::mem::transmute(type_of(exc)));
        (class, exc)
    } else {
        decref(exc);
        xdecref(cause);
        err_set_string(&TYPE_ERROR.0, "exceptions must derive from BaseException");
        goto_error_handler();
    };

    if !cause.is_null() {
        if is_exc_class(cause) {
            let class = as_type(cause);
            let class: &'static crate::host::TypeObject = std::mem::transmute(class);
            let fixed = crate::host::exc::exc_new_with_args(class, tuple_new(vec![]));
            exc_set_cause(value, fixed);
            decref(cause);
        } else if is_exc_instance(cause) {
            exc_set_cause(value, cause);
        } else if std::ptr::eq(cause, none()) {
            exc_set_cause(value, std::ptr::null_mut());
            decref(cause);
        } else {
            decref(cause);
            decref(value);
            decref(exc);
            err_set_string(
                &TYPE_ERROR.0,
                "exception causes must derive from BaseException",
            );
            goto_error_handler();
        }
    }

    // The class reference came with `exc`; the triple owns it now.
    err_restore(ty, value, std::ptr::null_mut());
    goto_error_handler();
}

pub(crate) unsafe extern "C-unwind" fn handle_block_setup(
    frame: *mut Frame,
    kind: i64,
    handler: i64,
    level: i64,
) {
    Frame::block_setup(frame, kind as i32, handler as i32, level as i32);
}

pub(crate) unsafe extern "C-unwind" fn handle_block_pop(frame: *mut Frame) {
    Frame::block_pop(frame);
}

/// Leave an except block: restore the previous exception triple from the
/// operand stack.
pub(crate) unsafe extern "C-unwind" fn handle_pop_except(frame: *mut Frame) {
    let block = Frame::block_pop(frame);
    if block.kind != BLOCK_EXCEPT_HANDLER {
        err_set_string(&SYSTEM_ERROR.0, "popped block is not an except handler");
        goto_error_handler();
    }
    let f = &mut *frame;
    let mut depth = recorded_stack_height(f.lasti);
    debug_assert!(depth >= block.level + 3 && depth <= block.level + 4);
    let st = &mut *state();
    let old_type = st.exc_info.exc_type;
    let old_value = st.exc_info.exc_value;
    let old_tb = st.exc_info.exc_traceback;
    let stack = f.valuestack_ptr();
    depth -= 1;
    st.exc_info.exc_type = *stack.add(depth as usize);
    depth -= 1;
    st.exc_info.exc_value = *stack.add(depth as usize);
    depth -= 1;
    st.exc_info.exc_traceback = *stack.add(depth as usize);
    xdecref(old_type);
    xdecref(old_value);
    xdecref(old_tb);
    f.stackdepth = depth;
}

/// `JumpIfNotExcMatch`: validate the pattern and test the match.
pub(crate) unsafe extern "C-unwind" fn handle_exc_match(left: ObjPtr, right: ObjPtr) -> i64 {
    const CANNOT_CATCH: &str =
        "catching classes that do not inherit from BaseException is not allowed";
    if crate::host::container::is_tuple(right) {
        for &entry in crate::host::container::tuple_items(right) {
            if !is_exc_class(entry) {
                err_set_string(&TYPE_ERROR.0, CANNOT_CATCH);
                goto_error_handler();
            }
        }
    } else if !is_exc_class(right) {
        err_set_string(&TYPE_ERROR.0, CANNOT_CATCH);
        goto_error_handler();
    }
    exc_matches(left, right) as i64
}

/// `Reraise`: restore the triple saved by the active handler and resume
/// unwinding toward an outer handler.
pub(crate) unsafe extern "C-unwind" fn handle_reraise(frame: *mut Frame, _restore_lasti: i64) -> ! {
    let f = &mut *frame;
    debug_assert!(f.iblock > 0);
    let mut depth = recorded_stack_height(f.lasti);
    let stack = f.valuestack_ptr();
    depth -= 1;
    let exc = *stack.add(depth as usize);
    depth -= 1;
    let value = *stack.add(depth as usize);
    depth -= 1;
    let tb = *stack.add(depth as usize);
    f.stackdepth = depth;
    debug_assert!(is_exc_class(exc));
    err_restore(exc, value, tb);
    goto_unwind(frame);
}

unsafe fn lookup_special(obj: ObjPtr, name: &str) -> Option<ObjPtr> {
    let ty = type_of(obj);
    let Some(getattr) = ty.getattr else {
        err_set_string(
            &crate::host::exc::ATTRIBUTE_ERROR.0,
            &format!("'{}' object has no attribute '{name}'", ty.name),
        );
        return None;
    };
    let name_obj = str_new(name);
    let result = getattr(obj, name_obj);
    decref(name_obj);
    result
}

/// `SetupWith`: replace the context manager at the stack top with its
/// `__exit__`, push the `__enter__` result, and record the try-block.
pub(crate) unsafe extern "C-unwind" fn handle_setup_with(
    frame: *mut Frame,
    sp: *mut ObjPtr,
    handler: i64,
) {
    let mut sp = sp;
    sp = sp.sub(1);
    let mgr = *sp;
    let Some(enter) = lookup_special(mgr, "__enter__") else {
        goto_error_handler();
    };
    let Some(exit) = lookup_special(mgr, "__exit__") else {
        decref(enter);
        goto_error_handler();
    };
    *sp = exit;
    sp = sp.add(1);
    decref(mgr);

    let call = type_of(enter).call;
    let result = match call {
        Some(call) => call(enter, &[], std::ptr::null_mut()),
        None => {
            err_set_string(&TYPE_ERROR.0, "'__enter__' object is not callable");
            None
        }
    };
    decref(enter);
    let Some(result) = result else {
        goto_error_handler();
    };
    *sp = result;
    sp = sp.add(1);

    let level = sp.offset_from((*frame).valuestack_ptr()) as i32 - 1;
    Frame::block_setup(frame, BLOCK_SETUP_FINALLY, handler as i32, level);
}

/// `WithExceptStart`: call the saved `__exit__` with the active triple.
pub(crate) unsafe extern "C-unwind" fn handle_with_except_start(
    exc: ObjPtr,
    value: ObjPtr,
    tb: ObjPtr,
    exit_func: ObjPtr,
) -> ObjPtr {
    let Some(call) = type_of(exit_func).call else {
        err_set_string(&TYPE_ERROR.0, "context manager __exit__ is not callable");
        goto_error_handler();
    };
    match call(exit_func, &[exc, value, tb], std::ptr::null_mut()) {
        Some(result) => result,
        None => goto_error_handler(),
    }
}

/// Trap for opcode families the translator refuses; reaching it means a
/// function was installed despite failing translation.
pub(crate) unsafe extern "C-unwind" fn handle_unimplemented_opcode() -> ! {
    err_set_string(&SYSTEM_ERROR.0, "unimplemented opcode reached in compiled code");
    goto_error_handler();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::container::dict_new;
    use crate::host::exc::{err_clear, err_occurred, VALUE_ERROR};
    use crate::host::func::{code_new, CodeObject};
    use crate::host::number::int_new;
    use crate::host::object::refcount;
    use crate::host::state::{test_reset_state, ExtendedCFrame};
    use molten_bytecode::Assembler;

    struct FrameFixture {
        frame: *mut Frame,
        cframe: Box<ExtendedCFrame>,
        sp_map: Vec<i32>,
        globals: ObjPtr,
        builtins: ObjPtr,
        code: ObjPtr,
    }

    impl FrameFixture {
        fn install(stacksize: u32, sp_map: Vec<i32>) -> Self {
            test_reset_state();
            let mut asm = Assembler::new("fixture");
            asm.stacksize(stacksize);
            asm.op(molten_bytecode::Opcode::Nop);
            asm.op(molten_bytecode::Opcode::Nop);
            asm.op(molten_bytecode::Opcode::Nop);
            asm.op(molten_bytecode::Opcode::Nop);
            let code = code_new(asm.finish());
            unsafe {
                let globals = dict_new();
                let builtins = dict_new();
                let frame = Frame::alloc(code as *mut CodeObject, globals, builtins);
                (*frame).lasti = 0;
                let mut fixture = FrameFixture {
                    frame,
                    cframe: Box::new(ExtendedCFrame {
                        previous: std::ptr::null_mut(),
                        sp_map: std::ptr::null(),
                        sp_map_len: 0,
                    }),
                    sp_map,
                    globals,
                    builtins,
                    code,
                };
                fixture.cframe.sp_map = fixture.sp_map.as_ptr();
                fixture.cframe.sp_map_len = fixture.sp_map.len();
                let st = &mut *state();
                st.frame = frame;
                st.cframe = &mut *fixture.cframe;
                fixture
            }
        }
    }

    impl Drop for FrameFixture {
        fn drop(&mut self) {
            unsafe {
                Frame::free(self.frame);
                decref(self.globals);
                decref(self.builtins);
                decref(self.code);
                let st = &mut *state();
                st.frame = std::ptr::null_mut();
                st.cframe = std::ptr::null_mut();
            }
        }
    }

    fn catch_transfer(f: impl FnOnce() + std::panic::UnwindSafe) {
        let result = std::panic::catch_unwind(f);
        let payload = result.expect_err("unwinder must escape");
        assert!(payload.is::<FrameTransfer>());
    }

    #[test]
    fn unwind_without_handler_drains_and_marks_raised() {
        let fixture = FrameFixture::install(4, vec![2, 2, 2, 2]);
        unsafe {
            // Two live operand-stack slots.
            let a = int_new(1);
            let b = int_new(2);
            stack_push(fixture.frame, a);
            stack_push(fixture.frame, b);
            incref(a);

            crate::host::exc::err_set_string(&VALUE_ERROR.0, "boom");
            catch_transfer(|| goto_error_handler());

            assert_eq!((*fixture.frame).state, frame_state::RAISED);
            assert_eq!((*fixture.frame).stackdepth, 0);
            // Drained exactly once.
            assert_eq!(refcount(a), 1);
            decref(a);
            assert!(err_occurred());
            err_clear();
        }
    }

    #[test]
    fn unwind_arms_finally_handler_with_six_slots() {
        let fixture = FrameFixture::install(8, vec![1, 1, 1, 1]);
        unsafe {
            let guarded = int_new(9);
            stack_push(fixture.frame, guarded);
            // try-block recorded at depth 0 with handler token 2.
            Frame::block_setup(fixture.frame, BLOCK_SETUP_FINALLY, 2, 0);

            crate::host::exc::err_set_string(&VALUE_ERROR.0, "x");
            catch_transfer(|| goto_error_handler());

            let f = &*fixture.frame;
            assert_eq!(f.state, frame_state::EXECUTING);
            assert_eq!(f.resume, 2);
            // Previous triple (as None padding) plus the live triple.
            assert_eq!(f.stackdepth, 6);
            let top = f.stack_at(5);
            assert!(is_exc_class(top));
            assert!(exc_matches(top, class_obj(&VALUE_ERROR.0)));
            assert!(is_exc_instance(f.stack_at(4)));
            // The handler block replaced the finally block.
            assert_eq!(f.iblock, 1);
            assert_eq!(f.blockstack[0].kind, BLOCK_EXCEPT_HANDLER);
            // The guarded slot was released before the context was pushed.
            assert!(!err_occurred());
        }
    }

    #[test]
    fn pop_except_restores_previous_triple() {
        let fixture = FrameFixture::install(8, vec![1, 1, 1, 1]);
        unsafe {
            stack_push(fixture.frame, int_new(9));
            Frame::block_setup(fixture.frame, BLOCK_SETUP_FINALLY, 1, 0);
            crate::host::exc::err_set_string(&VALUE_ERROR.0, "x");
            catch_transfer(|| goto_error_handler());

            // Handler ran and popped the three live-exception slots.
            let f = &mut *fixture.frame;
            for _ in 0..3 {
                xdecref(stack_pop(fixture.frame));
            }
            // POP_EXCEPT sees depth 3 via the side table.
            f.lasti = 1;
            let fixed_map = [3i32, 3, 3, 3];
            (*(*state()).cframe).sp_map = fixed_map.as_ptr();
            handle_pop_except(fixture.frame);
            assert_eq!(f.iblock, 0);
            assert_eq!(f.stackdepth, 0);
            let st = &*state();
            // The "previous" triple was the None padding.
            assert!(std::ptr::eq(st.exc_info.exc_type, none()));
        }
    }

    #[test]
    fn exc_match_rejects_non_classes() {
        let fixture = FrameFixture::install(4, vec![0, 0, 0, 0]);
        unsafe {
            let exc = crate::host::exc::exc_new(&VALUE_ERROR.0, "v");
            let not_a_class = int_new(3);
            catch_transfer(|| {
                handle_exc_match(exc, not_a_class);
            });
            assert_eq!((*fixture.frame).state, frame_state::RAISED);
            assert!(err_matches_type_error());
            err_clear();
            decref(not_a_class);
        }
    }

    fn err_matches_type_error() -> bool {
        crate::host::exc::err_matches(&TYPE_ERROR.0)
    }

    #[test]
    fn raise_varargs_without_active_exception_is_runtime_error() {
        let fixture = FrameFixture::install(4, vec![0, 0, 0, 0]);
        unsafe {
            catch_transfer(|| {
                handle_raise_varargs(std::ptr::null_mut(), std::ptr::null_mut());
            });
            assert_eq!((*fixture.frame).state, frame_state::RAISED);
            assert!(crate::host::exc::err_matches(&RUNTIME_ERROR.0));
            err_clear();
        }
    }

    #[test]
    fn raise_varargs_instantiates_classes() {
        let fixture = FrameFixture::install(4, vec![0, 0, 0, 0]);
        unsafe {
            incref(class_obj(&VALUE_ERROR.0));
            catch_transfer(|| {
                handle_raise_varargs(std::ptr::null_mut(), class_obj(&VALUE_ERROR.0));
            });
            assert_eq!((*fixture.frame).state, frame_state::RAISED);
            assert!(crate::host::exc::err_matches(&VALUE_ERROR.0));
            err_clear();
        }
    }
}
