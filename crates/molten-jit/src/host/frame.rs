//! Host frames
//!
//! The frame layout is ABI: emitted code reads the code pointer, the
//! last-instruction index, and the contiguous slot array (locals, cells,
//! frees, then the operand stack) by fixed offsets. The try-block stack is
//! managed by helpers; the `resume` field carries the handler token the
//! unwinder selects for re-entry through the entry-block dispatch.

use super::func::CodeObject;
use super::object::{xdecref, ObjPtr};

/// Try-block stack capacity, matching the host's fixed bound.
pub const MAX_TRY_BLOCKS: usize = 20;

/// Block kind: a `SetupFinally` region.
pub const BLOCK_SETUP_FINALLY: i32 = molten_bytecode::Opcode::SetupFinally as i32;
/// Block kind: an exception handler currently executing.
pub const BLOCK_EXCEPT_HANDLER: i32 = 257;

/// Frame execution states.
pub mod frame_state {
    /// Running normally.
    pub const EXECUTING: i32 = 0;
    /// The unwinder is dismantling the block stack.
    pub const UNWINDING: i32 = 2;
    /// An exception escaped the frame.
    pub const RAISED: i32 = 3;
}

/// One entry of the try-block stack.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TryBlock {
    /// [`BLOCK_SETUP_FINALLY`] or [`BLOCK_EXCEPT_HANDLER`].
    pub kind: i32,
    /// Handler token for the entry-block dispatch.
    pub handler: i32,
    /// Operand-stack depth at block entry.
    pub level: i32,
}

/// A host execution frame. Trailed by `total_slot_count` object-pointer
/// slots: locals, cells, frees, then the operand stack.
#[repr(C)]
pub struct Frame {
    /// The code object being executed.
    pub code: *mut CodeObject,
    /// Global namespace dict.
    pub globals: ObjPtr,
    /// Builtin namespace dict.
    pub builtins: ObjPtr,
    /// Local namespace dict, or null for optimized frames.
    pub locals: ObjPtr,
    /// Index of the last instruction started; written before risky calls.
    pub lasti: i32,
    /// One of [`frame_state`].
    pub state: i32,
    /// Live operand-stack depth, maintained by the unwinder.
    pub stackdepth: i32,
    /// Number of active try-blocks.
    pub iblock: i32,
    /// Handler token consumed by the entry dispatch on (re-)entry.
    pub resume: i32,
    /// The try-block stack.
    pub blockstack: [TryBlock; MAX_TRY_BLOCKS],
}

impl Frame {
    /// Byte offset of the slot array from the frame base. ABI with the
    /// emitter.
    pub const fn slots_offset() -> usize {
        std::mem::size_of::<Frame>()
    }

    /// Allocate a frame for a code object; the caller owns the result and
    /// must release it with [`Frame::free`]. Borrows (does not retain)
    /// `code`, `globals`, and `builtins` for its lifetime.
    ///
    /// # Safety
    /// `code` must stay live for the frame's lifetime; the namespaces must
    /// be live dicts.
    pub unsafe fn alloc(code: *mut CodeObject, globals: ObjPtr, builtins: ObjPtr) -> *mut Frame {
        let slot_count = (*code).unit.total_slot_count();
        let layout = Self::layout(slot_count);
        let frame = std::alloc::alloc_zeroed(layout) as *mut Frame;
        assert!(!frame.is_null(), "frame allocation failed");
        (*frame).code = code;
        (*frame).globals = globals;
        (*frame).builtins = builtins;
        (*frame).locals = std::ptr::null_mut();
        (*frame).lasti = -1;
        (*frame).state = frame_state::EXECUTING;
        frame
    }

    /// Release a frame, dropping any references left in its slots.
    ///
    /// # Safety
    /// `frame` must come from [`Frame::alloc`] and not be executing.
    pub unsafe fn free(frame: *mut Frame) {
        let unit = &(*(*frame).code).unit;
        let fixed = unit.nlocals as usize + unit.cell_and_free_count();
        let slots = (*frame).slots_ptr();
        for i in 0..fixed {
            xdecref(*slots.add(i));
        }
        let stack = (*frame).valuestack_ptr();
        for i in 0..(*frame).stackdepth as usize {
            xdecref(*stack.add(i));
        }
        let layout = Self::layout(unit.total_slot_count());
        std::alloc::dealloc(frame as *mut u8, layout);
    }

    fn layout(slot_count: usize) -> std::alloc::Layout {
        std::alloc::Layout::new::<Frame>()
            .extend(std::alloc::Layout::array::<ObjPtr>(slot_count).unwrap())
            .unwrap()
            .0
    }

    /// Base of the slot array.
    ///
    /// # Safety
    /// The frame must be live.
    pub unsafe fn slots_ptr(&self) -> *mut ObjPtr {
        (self as *const Frame as *mut u8).add(Self::slots_offset()) as *mut ObjPtr
    }

    /// The whole slot array as a slice.
    ///
    /// # Safety
    /// The frame must be live; the slice aliases the raw slot pointers.
    pub unsafe fn slots_mut(&mut self) -> &mut [ObjPtr] {
        let count = (*self.code).unit.total_slot_count();
        std::slice::from_raw_parts_mut(self.slots_ptr(), count)
    }

    /// Base of the operand stack, past locals, cells, and frees.
    ///
    /// # Safety
    /// The frame must be live.
    pub unsafe fn valuestack_ptr(&self) -> *mut ObjPtr {
        let unit = &(*self.code).unit;
        self.slots_ptr()
            .add(unit.nlocals as usize + unit.cell_and_free_count())
    }

    /// Read an operand-stack slot.
    ///
    /// # Safety
    /// The frame must be live; `index` below the live depth.
    pub unsafe fn stack_at(&self, index: usize) -> ObjPtr {
        *self.valuestack_ptr().add(index)
    }

    /// Push a try-block, the way `SetupFinally` records one.
    ///
    /// # Safety
    /// The frame must be live.
    pub unsafe fn block_setup(frame: *mut Frame, kind: i32, handler: i32, level: i32) {
        let f = &mut *frame;
        assert!(
            (f.iblock as usize) < MAX_TRY_BLOCKS,
            "try-block stack overflow"
        );
        f.blockstack[f.iblock as usize] = TryBlock {
            kind,
            handler,
            level,
        };
        f.iblock += 1;
    }

    /// Pop the innermost try-block.
    ///
    /// # Safety
    /// The frame must be live with a non-empty block stack.
    pub unsafe fn block_pop(frame: *mut Frame) -> TryBlock {
        let f = &mut *frame;
        assert!(f.iblock > 0, "try-block stack underflow");
        f.iblock -= 1;
        f.blockstack[f.iblock as usize]
    }
}
