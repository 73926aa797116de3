//! Cranelift code generation backend
//!
//! Compiles the emitter's IR to native code for the host machine. Behind
//! the `cranelift` feature; the default build carries only the stub.

mod lowering;

use std::sync::Arc;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{ir, Context};
use cranelift_frontend::FunctionBuilderContext;
use target_lexicon::Architecture;

use crate::backend::traits::*;
use crate::ir::IrFunction;
use self::lowering::{compiled_signature, LoweringContext};

/// Cranelift-based backend.
pub struct CraneliftBackend {
    isa: Arc<dyn TargetIsa>,
}

impl CraneliftBackend {
    /// Backend targeting the host machine.
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::Backend(format!("failed to set opt_level: {e}")))?;
        flag_builder
            .set("is_pic", "true")
            .map_err(|e| CodegenError::Backend(format!("failed to set is_pic: {e}")))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::Backend(format!("failed to create ISA builder: {e}")))?
            .finish(flags)
            .map_err(|e| CodegenError::Backend(format!("failed to finish ISA: {e}")))?;

        Ok(CraneliftBackend { isa })
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn compile_function(&self, func: &IrFunction) -> Result<CompiledCode, CodegenError> {
        let mut codegen_ctx = Context::new();
        let mut fn_builder_ctx = FunctionBuilderContext::new();

        codegen_ctx.func.signature = compiled_signature(self.isa.default_call_conv());
        codegen_ctx.func.name = ir::UserFuncName::user(0, 0);

        {
            let builder = cranelift_frontend::FunctionBuilder::new(
                &mut codegen_ctx.func,
                &mut fn_builder_ctx,
            );
            LoweringContext::lower(func, builder)
                .map_err(|e| CodegenError::Backend(format!("lowering failed: {e}")))?;
        }

        let mut ctrl_plane = ControlPlane::default();
        let code = codegen_ctx
            .compile(&*self.isa, &mut ctrl_plane)
            .map_err(|e| CodegenError::Backend(format!("compilation failed: {e:?}")))?;

        Ok(CompiledCode {
            code: code.code_buffer().to_vec(),
            entry_offset: 0,
        })
    }

    fn target_info(&self) -> TargetInfo {
        let arch = match self.isa.triple().architecture {
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::X86_64,
        };
        TargetInfo {
            arch,
            pointer_size: self.isa.pointer_bytes() as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::CompileUnit;
    use molten_bytecode::{Assembler, Opcode};

    #[test]
    fn compiles_a_translated_function() {
        let mut asm = Assembler::new("f");
        let one = asm.const_int(1);
        let two = asm.const_int(2);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::LoadConst, two);
        asm.op(Opcode::BinaryAdd);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = CompileUnit::translate(&unit).unwrap();
        let backend = CraneliftBackend::host().unwrap();
        assert_eq!(backend.name(), "cranelift");
        let compiled = backend.compile_function(&translation.ir).unwrap();
        assert!(!compiled.code.is_empty());
        assert!(compiled.code.len() > 4);
    }

    #[test]
    fn compiles_loops_and_branches() {
        // while x: pass; return x — exercises block sealing and the
        // boolean fast path.
        let mut asm = Assembler::new("loopy");
        let x = asm.param("x");
        let top = asm.label();
        let out = asm.label();
        asm.bind(top);
        asm.op_arg(Opcode::LoadFast, x);
        asm.jump(Opcode::PopJumpIfFalse, out);
        asm.jump(Opcode::JumpAbsolute, top);
        asm.bind(out);
        asm.op_arg(Opcode::LoadFast, x);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = CompileUnit::translate(&unit).unwrap();
        let backend = CraneliftBackend::host().unwrap();
        let compiled = backend.compile_function(&translation.ir).unwrap();
        assert!(!compiled.code.is_empty());
    }
}
