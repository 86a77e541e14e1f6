//! Pledge Store - Persistent State
//!
//! The embedded key/value layer: a small store abstraction with an LMDB
//! backend, a diagnose-and-repair pipeline for damaged database files
//! (including the legacy hash-file format still found on old hosts), the
//! last-seen host index built on top of it, and the per-connection remote
//! stat cache.

mod diagnose;
mod kv;
mod lastseen;
mod legacy;
mod lmdb;
mod repair;
mod statcache;

pub use diagnose::*;
pub use kv::*;
pub use lastseen::*;
pub use legacy::*;
pub use lmdb::*;
pub use repair::*;
pub use statcache::*;
