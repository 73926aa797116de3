//! Molten: a method-at-a-time JIT translator for a dynamic,
//! reference-counted host interpreter
//!
//! The pipeline runs once per function: the block table partitions the
//! bytecode ([`analysis::cfg`]), a backward pass marks redundant loads
//! ([`analysis::redundancy`]), a forward pass proves locals bound
//! ([`analysis::defined`]), and the emitter ([`emit`]) lowers each opcode
//! to IR — abstract-stack bookkeeping, inlined refcounts, helper calls
//! through the fixed table ([`runtime::table`]) — which a backend
//! ([`backend`]) turns into machine code. The [`engine`] installs results
//! in code objects and dispatches frame evaluation, re-entering compiled
//! code at exception handlers through the unwinder's resume tokens.

#![warn(rust_2018_idioms)]

pub mod analysis;
pub mod backend;
pub mod bits;
pub mod emit;
pub mod engine;
pub mod host;
pub mod ir;
pub mod runtime;

pub use emit::{CompileUnit, TranslateError, Translation};
pub use engine::{apply, eval_frame, install_default_eval, ApplyError, Translator};
