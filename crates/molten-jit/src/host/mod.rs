//! The host data model
//!
//! Everything emitted code and the runtime helpers agree on: the
//! refcounted object header, type objects with their slot tables, the
//! concrete value types, frames, and the thread state. Layouts marked ABI
//! are read by generated code through `offset_of!`-derived offsets.

pub mod container;
pub mod exc;
pub mod frame;
pub mod func;
pub mod number;
pub mod object;
pub mod state;
pub mod str;
pub mod typeobj;

pub use object::{HostObject, ObjPtr};
pub use typeobj::TypeObject;
