//! Pledge Engine - Promise Evaluation
//!
//! The run loop: the odometer-style iteration engine that expands
//! `$(var)`/`${var}` references into concrete promises, the evaluator
//! that locks, dispatches and accounts each expansion, the advisory lock
//! store, bootstrap artifacts, and the thread-safe queue at the boundary
//! to background workers.

mod bootstrap;
mod eval;
mod iter;
mod locks;
mod queue;

pub use bootstrap::*;
pub use eval::*;
pub use iter::*;
pub use locks::*;
pub use queue::*;
