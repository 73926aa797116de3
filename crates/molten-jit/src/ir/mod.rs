//! The backend-agnostic IR the emitter produces.

pub mod builder;
mod display;
pub mod instr;

pub use builder::IrBuilder;
pub use instr::{Cond, IrBlock, IrBlockId, IrFunction, IrInst, IrTerminator, IrType, Value};
