//! Code generation backends: the trait, a stub for pipeline tests, and
//! the Cranelift implementation behind the `cranelift` feature.

#[cfg(feature = "cranelift")]
mod cranelift;
pub mod stub;
pub mod traits;

#[cfg(feature = "cranelift")]
pub use cranelift::CraneliftBackend;
pub use stub::StubBackend;
pub use traits::{
    CodeMapper, CodegenBackend, CodegenError, CompiledCode, CompiledFn, ExecutableCode,
    TargetArch, TargetInfo,
};
