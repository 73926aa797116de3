//! Preparatory analyses over a code unit: block-table construction, the
//! backward redundant-load pass, and the forward locals-definition pass.

pub mod cfg;
pub mod defined;
pub mod redundancy;

pub use cfg::{Block, BlockTable, CfgError};
pub use defined::analyze_locals_definition;
pub use redundancy::analyze_redundant_loads;
