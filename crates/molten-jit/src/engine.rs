//! The translation engine
//!
//! [`Translator::apply`] translates a host function's code unit once,
//! runs the backend, and parks the result in the code object's extra
//! slot. The frame-eval dispatcher consults that slot on every call:
//! empty means the host's default evaluator runs; otherwise the compiled
//! entry runs inside an extended-C-frame bracket whose `catch_unwind`
//! receives the unwinder's non-local exits. A handler transfer re-enters
//! the compiled function with the resume token the unwinder recorded;
//! a raise reports null with the error indicator already set.

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;

use crate::backend::{
    CodeMapper, CodegenBackend, CodegenError, CompiledCode, ExecutableCode,
};
use crate::emit::{CompileUnit, TranslateError, Translation};
use crate::host::exc::{err_occurred, err_set_string, SYSTEM_ERROR, TYPE_ERROR};
use crate::host::frame::{frame_state, Frame};
use crate::host::func::{is_function, CodeObject, FrameEval, FunctionObject};
use crate::host::state::{state, ExtendedCFrame};
use crate::host::ObjPtr;
use crate::runtime::table::helpers_ptr;
use crate::runtime::FrameTransfer;

/// Error surfaced by [`Translator::apply`]; the code object's extra slot
/// is left empty and later calls go through the interpreter unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The argument was not a host function object.
    #[error("apply expects a function object")]
    NotAFunction,
    /// The translator refused the code unit.
    #[error(transparent)]
    Translate(#[from] TranslateError),
    /// The backend failed.
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

/// A translated-and-compiled function, owned by the process-wide registry
/// for the lifetime of its code object's extra slot.
pub struct InstalledCode {
    /// vpc → operand-stack height, consulted by the unwinder.
    pub sp_map: Vec<i32>,
    /// Raw machine code from the backend.
    pub compiled: CompiledCode,
    /// Mapped entry, when a host mapper was provided.
    pub executable: Option<ExecutableCode>,
}

// Installed code is never reclaimed: its lifetime matches the extra slot
// of a code object the registry cannot observe dying. The host's
// free-callback hook is where reclamation would attach.
static REGISTRY: Lazy<RwLock<Vec<Box<InstalledCode>>>> = Lazy::new(|| RwLock::new(Vec::new()));

static DEFAULT_EVAL: OnceCell<FrameEval> = OnceCell::new();

/// Install the host's default (interpreting) frame evaluator. The
/// dispatcher falls back to it for uncompiled code objects.
pub fn install_default_eval(eval: FrameEval) {
    let _ = DEFAULT_EVAL.set(eval);
}

/// The method-at-a-time translator.
pub struct Translator {
    backend: Box<dyn CodegenBackend>,
    mapper: Option<CodeMapper>,
}

impl Translator {
    /// Translator over a backend, without a code mapper: functions are
    /// translated and compiled but keep interpreting until the host
    /// provides executable mapping.
    pub fn new(backend: Box<dyn CodegenBackend>) -> Self {
        crate::host::func::install_frame_eval(eval_frame);
        Translator {
            backend,
            mapper: None,
        }
    }

    /// Attach the host's executable-memory mapper.
    pub fn with_mapper(mut self, mapper: CodeMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Translate a function's code unit and install the result in its
    /// code object's extra slot. Returns the function unchanged; calling
    /// it twice is indistinguishable from calling it once.
    ///
    /// # Safety
    /// `func` must be a live host object.
    pub unsafe fn apply(&self, func: ObjPtr) -> Result<ObjPtr, ApplyError> {
        if !is_function(func) {
            return Err(ApplyError::NotAFunction);
        }
        let code = (*(func as *const FunctionObject)).code as *mut CodeObject;
        if !(*code).extra.is_null() {
            return Ok(func);
        }

        let translation = CompileUnit::translate(&(*code).unit)?;
        self.dump(&translation);
        let compiled = self.backend.compile_function(&translation.ir)?;
        let executable = match self.mapper {
            Some(mapper) => Some(mapper(&compiled)?),
            None => None,
        };

        let installed = Box::new(InstalledCode {
            sp_map: translation.sp_map,
            compiled,
            executable,
        });
        (*code).extra = &*installed as *const InstalledCode as *mut ();
        REGISTRY.write().push(installed);
        Ok(func)
    }

    #[cfg(feature = "dump-ir")]
    fn dump(&self, translation: &Translation) {
        let dir = std::path::Path::new("/tmp/molten-dump");
        let _ = std::fs::create_dir_all(dir);
        let path = dir.join(format!("{}.ir", translation.ir.name));
        let _ = std::fs::write(path, translation.ir.to_string());
    }

    #[cfg(not(feature = "dump-ir"))]
    fn dump(&self, _translation: &Translation) {}
}

/// The frame evaluator the dispatcher installs: compiled entry when the
/// extra slot has one, host fallback otherwise.
///
/// # Safety
/// `frame` must be a live frame whose code object outlives the call.
pub unsafe fn eval_frame(frame: *mut Frame) -> ObjPtr {
    let code = (*frame).code;
    let extra = (*code).extra as *const InstalledCode;
    let entry = if extra.is_null() {
        None
    } else {
        (*extra).executable.as_ref().map(|e| e.entry())
    };

    let Some(entry) = entry else {
        return default_eval(frame);
    };
    let installed = &*extra;

    // Bracket the invocation with an extended C frame so the unwinder
    // can map the recorded vpc back to an operand-stack depth.
    let st = &mut *state();
    let mut cframe = ExtendedCFrame {
        previous: st.cframe,
        sp_map: installed.sp_map.as_ptr(),
        sp_map_len: installed.sp_map.len(),
    };
    st.cframe = &mut cframe;
    let prev_frame = st.frame;
    st.frame = frame;
    (*frame).resume = 0;
    (*frame).state = frame_state::EXECUTING;

    let result = loop {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            entry(helpers_ptr(), frame)
        }));
        match outcome {
            Ok(value) => break value,
            Err(payload) => {
                if !payload.is::<FrameTransfer>() {
                    std::panic::resume_unwind(payload);
                }
                if (*frame).state == frame_state::RAISED {
                    debug_assert!(err_occurred());
                    break std::ptr::null_mut();
                }
                // A handler was armed; re-enter through the entry
                // dispatch with the recorded resume token.
                debug_assert!((*frame).resume > 0);
            }
        }
    };

    st.frame = prev_frame;
    st.cframe = cframe.previous;
    result
}

unsafe fn default_eval(frame: *mut Frame) -> ObjPtr {
    match DEFAULT_EVAL.get() {
        Some(eval) => eval(frame),
        None => {
            err_set_string(
                &SYSTEM_ERROR.0,
                "no default evaluator installed for uncompiled code",
            );
            std::ptr::null_mut()
        }
    }
}

/// Convenience wrapper matching the host's `apply(fn)` entry point,
/// raising a host `TypeError` instead of returning a Rust error.
///
/// # Safety
/// `func` must be a live host object.
pub unsafe fn apply(translator: &Translator, func: ObjPtr) -> Option<ObjPtr> {
    match translator.apply(func) {
        Ok(func) => {
            crate::host::object::incref(func);
            Some(func)
        }
        Err(ApplyError::NotAFunction) => {
            err_set_string(&TYPE_ERROR.0, "bad argument type");
            None
        }
        Err(error) => {
            err_set_string(&crate::host::exc::RUNTIME_ERROR.0, &error.to_string());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use crate::host::container::dict_new;
    use crate::host::exc::err_clear;
    use crate::host::func::{code_new, function_new};
    use crate::host::number::int_new;
    use crate::host::object::decref;
    use crate::host::state::test_reset_state;
    use crate::host::str::str_new;
    use molten_bytecode::{Assembler, Opcode};

    unsafe fn make_test_function(asm: Assembler) -> ObjPtr {
        let code = code_new(asm.finish());
        let globals = dict_new();
        let builtins = dict_new();
        function_new(code, globals, builtins, str_new("test"))
    }

    fn simple_asm() -> Assembler {
        let mut asm = Assembler::new("f");
        let k = asm.const_int(1);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::ReturnValue);
        asm
    }

    #[test]
    fn apply_installs_into_the_extra_slot() {
        test_reset_state();
        unsafe {
            let translator = Translator::new(Box::new(StubBackend));
            let func = make_test_function(simple_asm());
            let code = (*(func as *const FunctionObject)).code as *mut CodeObject;
            assert!((*code).extra.is_null());

            translator.apply(func).unwrap();
            assert!(!(*code).extra.is_null());
            let installed = &*((*code).extra as *const InstalledCode);
            assert_eq!(installed.sp_map.len(), 2);
            assert!(installed.executable.is_none());
            decref(func);
        }
    }

    #[test]
    fn apply_is_idempotent() {
        test_reset_state();
        unsafe {
            let translator = Translator::new(Box::new(StubBackend));
            let func = make_test_function(simple_asm());
            let code = (*(func as *const FunctionObject)).code as *mut CodeObject;
            translator.apply(func).unwrap();
            let first = (*code).extra;
            translator.apply(func).unwrap();
            assert_eq!(first, (*code).extra);
            decref(func);
        }
    }

    #[test]
    fn apply_rejects_non_functions() {
        test_reset_state();
        unsafe {
            let translator = Translator::new(Box::new(StubBackend));
            let not_a_function = int_new(3);
            assert!(matches!(
                translator.apply(not_a_function),
                Err(ApplyError::NotAFunction)
            ));
            assert!(apply(&translator, not_a_function).is_none());
            err_clear();
            decref(not_a_function);
        }
    }

    #[test]
    fn refused_units_leave_the_slot_empty() {
        test_reset_state();
        unsafe {
            let translator = Translator::new(Box::new(StubBackend));
            let mut asm = Assembler::new("gen");
            asm.flags(molten_bytecode::CodeFlags::GENERATOR);
            asm.op(Opcode::ReturnValue);
            let func = make_test_function(asm);
            let code = (*(func as *const FunctionObject)).code as *mut CodeObject;
            assert!(matches!(
                translator.apply(func),
                Err(ApplyError::Translate(TranslateError::GeneratorCode { .. }))
            ));
            assert!((*code).extra.is_null());
            decref(func);
        }
    }

    #[test]
    fn uncompiled_frames_fall_back_to_the_default_evaluator() {
        test_reset_state();
        unsafe fn fallback(_frame: *mut Frame) -> ObjPtr {
            int_new(55)
        }
        unsafe {
            install_default_eval(fallback);
            let func = make_test_function(simple_asm());
            let f = &*(func as *const FunctionObject);
            let frame = Frame::alloc(f.code as *mut CodeObject, f.globals, f.builtins);
            let result = eval_frame(frame);
            assert_eq!(crate::host::number::int_value(result), 55);
            decref(result);
            Frame::free(frame);
            decref(func);
        }
    }
}
