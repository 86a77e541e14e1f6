//! Pledge Core - Data Types
//!
//! Shared data structures for the Pledge convergence engine: variable
//! references, rvals, promises and their typed attribute records, promise
//! results, item lists and the per-run context. All other crates depend on
//! this one.

mod attrs;
mod error;
mod item;
mod promise;
mod result;
mod runctx;
mod rval;
mod varref;

pub use attrs::*;
pub use error::*;
pub use item::*;
pub use promise::*;
pub use result::*;
pub use runctx::*;
pub use rval::*;
pub use varref::*;

/// Replace every byte that is not alphanumeric with an underscore.
///
/// Used wherever a free-form string has to become a class identifier or a
/// filesystem-safe name fragment (backup stamps, repository file names).
pub fn canonify(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
