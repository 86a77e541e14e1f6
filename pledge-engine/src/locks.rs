//! Advisory promise locks
//!
//! Every actuator invocation runs under a per-promise advisory lock in
//! the locks store. Two timers govern it: `ifelapsed` skips the attempt
//! when the same lock completed too recently, and `expireafter` bounds
//! how long a held lock is honored before it is considered abandoned and
//! broken.

use pledge_core::StoreError;
use pledge_store::Kv;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The holder record behind an active lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockData {
    pub pid: u32,
    /// Epoch seconds of acquisition.
    pub time: i64,
}

/// A successfully acquired lock; release it through the store.
#[derive(Debug)]
pub struct CfLock {
    name: String,
}

impl CfLock {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(CfLock),
    /// Held elsewhere or attempted again too soon.
    Skipped,
}

fn lock_key(name: &str) -> Vec<u8> {
    format!("lock.{name}").into_bytes()
}

fn last_key(name: &str) -> Vec<u8> {
    format!("last.{name}").into_bytes()
}

fn pid_is_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// The advisory lock store.
pub struct LockStore {
    db: Box<dyn Kv>,
}

impl LockStore {
    pub fn new(db: Box<dyn Kv>) -> Self {
        LockStore { db }
    }

    /// Try to take the named lock at time `now`.
    ///
    /// Skips when the lock completed less than `ifelapsed_min` minutes
    /// ago, or when another live holder has had it for less than
    /// `expireafter_min` minutes. A lock past its expiry, or whose holder
    /// is gone, is broken and re-taken.
    pub fn acquire(
        &self,
        name: &str,
        ifelapsed_min: i64,
        expireafter_min: i64,
        now: i64,
    ) -> Result<LockOutcome, StoreError> {
        if let Some(bytes) = self.db.read(&last_key(name))? {
            if let Ok(last) = serde_json::from_slice::<i64>(&bytes) {
                if now - last < ifelapsed_min * 60 {
                    debug!(
                        lock = name,
                        elapsed = now - last,
                        "lock attempted again too soon"
                    );
                    return Ok(LockOutcome::Skipped);
                }
            }
        }

        if let Some(bytes) = self.db.read(&lock_key(name))? {
            if let Ok(holder) = serde_json::from_slice::<LockData>(&bytes) {
                let expired = now - holder.time > expireafter_min * 60;
                let own = holder.pid == std::process::id();
                if !expired && !own && pid_is_alive(holder.pid) {
                    debug!(lock = name, holder = holder.pid, "lock is held, skipping");
                    return Ok(LockOutcome::Skipped);
                }
                warn!(
                    lock = name,
                    holder = holder.pid,
                    expired,
                    "breaking abandoned lock"
                );
                self.db.delete(&lock_key(name))?;
            }
        }

        let data = LockData {
            pid: std::process::id(),
            time: now,
        };
        let value =
            serde_json::to_vec(&data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db.write(&lock_key(name), &value)?;
        debug!(lock = name, "lock acquired");
        Ok(LockOutcome::Acquired(CfLock {
            name: name.to_string(),
        }))
    }

    /// Release a held lock, stamping its completion time for the next
    /// `ifelapsed` check.
    pub fn release(&self, lock: CfLock, now: i64) -> Result<(), StoreError> {
        self.db.delete(&lock_key(&lock.name))?;
        let value =
            serde_json::to_vec(&now).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db.write(&last_key(&lock.name), &value)?;
        debug!(lock = %lock.name, "lock released");
        Ok(())
    }
}
