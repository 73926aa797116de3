//! Runtime helpers reachable from emitted code
//!
//! Every entry lives in the fixed-offset [`table::HelperTable`]; the
//! modules here implement the semantics: operator dispatch, name lookup,
//! calls, container construction, and the unwind machinery.

pub mod calls;
pub mod containers;
pub mod names;
pub mod ops;
pub mod table;
pub mod unwind;

pub use table::{helpers, helpers_ptr, HelperTable, Sym};
pub use unwind::FrameTransfer;
