//! Host bytecode definitions for the Molten JIT
//!
//! This crate models the bytecode surface of the host interpreter: the
//! opcode set, the fixed-width instruction units, `EXTENDED_ARG` folding,
//! and the immutable code-unit metadata the translator consumes. It also
//! provides a small assembler used by tests to build code units by hand.

#![warn(rust_2018_idioms)]

pub mod asm;
pub mod code;
pub mod instr;
pub mod opcode;

pub use asm::Assembler;
pub use code::{CodeFlags, CodeUnit, Const};
pub use instr::{decode, DecodeError, Instr, InstrIter};
pub use opcode::Opcode;
