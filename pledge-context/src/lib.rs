//! Pledge Context - Evaluation State
//!
//! The mutable state one policy run evaluates against: the namespaced,
//! scoped variable table, the set of currently-true classes with their
//! scoping and persistence rules, and the one-shot CMDB ingest that seeds
//! both at startup.

mod classes;
mod cmdb;
mod persist;
mod table;

pub use classes::*;
pub use cmdb::*;
pub use persist::*;
pub use table::*;
