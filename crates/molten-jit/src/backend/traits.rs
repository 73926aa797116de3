//! Backend-agnostic code generation traits
//!
//! A backend turns a finished IR function into machine-code bytes. The
//! mapping of those bytes into executable pages belongs to the host
//! embedding (it owns code-page lifetime alongside the code object's
//! extra slot); the engine accepts a host-supplied mapper and falls back
//! to interpretation when none is installed.

use crate::host::frame::Frame;
use crate::host::ObjPtr;
use crate::ir::IrFunction;
use crate::runtime::table::HelperTable;

/// Entry point signature of a compiled function: the helpers table and
/// the frame. Returns the result object or null with the error indicator
/// set (after the unwinder found no handler).
pub type CompiledFn = unsafe extern "C-unwind" fn(*const HelperTable, *mut Frame) -> ObjPtr;

/// Target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
}

/// Target information.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

/// Error during code generation.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),
}

/// Machine code produced by a backend, not yet mapped.
#[derive(Debug)]
pub struct CompiledCode {
    /// Raw machine-code bytes.
    pub code: Vec<u8>,
    /// Offset of the entry point within `code`.
    pub entry_offset: usize,
}

/// Executable code after the host mapped it; the pointer stays valid for
/// the lifetime of the owning code object's extra slot.
pub struct ExecutableCode {
    /// Base of the mapped region.
    pub code_ptr: *const u8,
    /// Region size in bytes.
    pub code_size: usize,
    /// Entry-point offset within the region.
    pub entry_offset: usize,
}

impl ExecutableCode {
    /// The callable entry point.
    ///
    /// # Safety
    /// The region must contain valid code for [`CompiledFn`]'s ABI.
    pub unsafe fn entry(&self) -> CompiledFn {
        std::mem::transmute(self.code_ptr.add(self.entry_offset))
    }
}

// Safety: the mapped region is immutable once published.
unsafe impl Send for ExecutableCode {}
unsafe impl Sync for ExecutableCode {}

/// Host-supplied mapper from code bytes to executable memory.
pub type CodeMapper = fn(&CompiledCode) -> Result<ExecutableCode, CodegenError>;

/// The code generation trait backends implement.
pub trait CodegenBackend: Send + Sync {
    /// Backend name, for diagnostics.
    fn name(&self) -> &str;

    /// Compile one IR function to machine code.
    fn compile_function(&self, func: &IrFunction) -> Result<CompiledCode, CodegenError>;

    /// Target architecture information.
    fn target_info(&self) -> TargetInfo;
}
