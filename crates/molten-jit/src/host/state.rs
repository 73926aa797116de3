//! Thread state and the extended C frame chain
//!
//! One [`ThreadState`] per host thread carries the error indicator, the
//! active exception info, the current frame, and the chain of
//! [`ExtendedCFrame`] records that bracket each compiled invocation. The
//! model is single-threaded cooperative under the host's global lock; the
//! raw-pointer accessor mirrors the host C API's `ThreadState_GET`.

use std::cell::UnsafeCell;

use super::frame::Frame;
use super::object::ObjPtr;

/// The exception last caught and still active (the handler context).
#[derive(Debug)]
pub struct ExcInfo {
    pub exc_type: ObjPtr,
    pub exc_value: ObjPtr,
    pub exc_traceback: ObjPtr,
}

/// Per-compiled-invocation record, chained through the thread state so
/// nested calls nest cleanly. Holds the vpc→stack-height side table for
/// the frame currently executing compiled code.
#[repr(C)]
pub struct ExtendedCFrame {
    /// Enclosing record, restored when the invocation finishes.
    pub previous: *mut ExtendedCFrame,
    /// vpc→operand-stack-height table of the running compiled function.
    pub sp_map: *const i32,
    /// Length of `sp_map` in entries.
    pub sp_map_len: usize,
}

/// Per-thread interpreter state.
pub struct ThreadState {
    /// Pending-error triple: class, instance, traceback.
    pub curexc_type: ObjPtr,
    pub curexc_value: ObjPtr,
    pub curexc_traceback: ObjPtr,
    /// The exception being handled, if any.
    pub exc_info: ExcInfo,
    /// Innermost executing frame.
    pub frame: *mut Frame,
    /// Innermost extended C frame.
    pub cframe: *mut ExtendedCFrame,
}

impl ThreadState {
    fn new() -> Self {
        ThreadState {
            curexc_type: std::ptr::null_mut(),
            curexc_value: std::ptr::null_mut(),
            curexc_traceback: std::ptr::null_mut(),
            exc_info: ExcInfo {
                exc_type: std::ptr::null_mut(),
                exc_value: std::ptr::null_mut(),
                exc_traceback: std::ptr::null_mut(),
            },
            frame: std::ptr::null_mut(),
            cframe: std::ptr::null_mut(),
        }
    }
}

thread_local! {
    static TSTATE: UnsafeCell<ThreadState> = UnsafeCell::new(ThreadState::new());
}

/// The calling thread's state. Callers dereference in short scopes; the
/// host's cooperative model guarantees no concurrent access.
pub fn state() -> *mut ThreadState {
    TSTATE.with(|t| t.get())
}

/// Stack height recorded for `lasti` in the innermost compiled frame's
/// side table.
///
/// # Safety
/// A compiled invocation must be active on this thread.
pub unsafe fn recorded_stack_height(lasti: i32) -> i32 {
    let st = &*state();
    let cframe = &*st.cframe;
    debug_assert!((lasti as usize) < cframe.sp_map_len);
    *cframe.sp_map.add(lasti as usize)
}

/// Reset the thread state between tests: drops any pending error and
/// detaches frames. Test support only.
pub fn test_reset_state() {
    unsafe {
        let st = &mut *state();
        crate::host::exc::err_clear();
        super::object::xdecref(st.exc_info.exc_type);
        super::object::xdecref(st.exc_info.exc_value);
        super::object::xdecref(st.exc_info.exc_traceback);
        st.exc_info.exc_type = std::ptr::null_mut();
        st.exc_info.exc_value = std::ptr::null_mut();
        st.exc_info.exc_traceback = std::ptr::null_mut();
        st.frame = std::ptr::null_mut();
        st.cframe = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_stable_per_thread() {
        let a = state();
        let b = state();
        assert_eq!(a, b);
    }

    #[test]
    fn cframe_chain_nests() {
        test_reset_state();
        unsafe {
            let st = &mut *state();
            let map = [0i32, 1, 2];
            let mut outer = ExtendedCFrame {
                previous: std::ptr::null_mut(),
                sp_map: map.as_ptr(),
                sp_map_len: map.len(),
            };
            st.cframe = &mut outer;
            assert_eq!(recorded_stack_height(2), 2);

            let inner_map = [5i32];
            let mut inner = ExtendedCFrame {
                previous: st.cframe,
                sp_map: inner_map.as_ptr(),
                sp_map_len: inner_map.len(),
            };
            st.cframe = &mut inner;
            assert_eq!(recorded_stack_height(0), 5);
            st.cframe = inner.previous;
            assert_eq!(recorded_stack_height(1), 1);
            st.cframe = std::ptr::null_mut();
        }
    }
}
