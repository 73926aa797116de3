//! Stub backend for exercising the pipeline without real codegen
//!
//! Produces a single trap byte so translation, registration, and
//! fallback paths run end-to-end in tests.

use super::traits::*;
use crate::ir::IrFunction;

/// Placeholder backend: INT3 on x86, a zero word elsewhere.
pub struct StubBackend;

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile_function(&self, _func: &IrFunction) -> Result<CompiledCode, CodegenError> {
        let trap_byte = match self.target_info().arch {
            TargetArch::X86_64 => 0xCC,
            TargetArch::AArch64 => 0x00,
        };
        Ok(CompiledCode {
            code: vec![trap_byte],
            entry_offset: 0,
        })
    }

    fn target_info(&self) -> TargetInfo {
        #[cfg(target_arch = "aarch64")]
        {
            TargetInfo {
                arch: TargetArch::AArch64,
                pointer_size: 8,
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            TargetInfo {
                arch: TargetArch::X86_64,
                pointer_size: 8,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrFunction;

    #[test]
    fn stub_emits_a_trap_byte() {
        let mut func = IrFunction::new("t".to_string());
        let entry = func.add_block();
        func.entry = entry;

        let stub = StubBackend;
        assert_eq!(stub.name(), "stub");
        let code = stub.compile_function(&func).unwrap();
        assert_eq!(code.code.len(), 1);
        assert_eq!(code.entry_offset, 0);
    }
}
