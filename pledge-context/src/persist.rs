//! Persistent classes
//!
//! A class may outlive the run that defined it: the persistent classes
//! store keeps `(expiry, policy, tags)` per class name. At startup every
//! unexpired entry is loaded into the live set; expired entries whose
//! policy says so are purged in the same pass.

use pledge_core::{ClassScope, StoreError};
use pledge_store::{Kv, KvCursor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ClassContext;

/// What happens to a persistent class when its timer runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistentPolicy {
    /// The entry is removed at expiry.
    Reset,
    /// The entry stays on disk, dormant, until overwritten.
    Preserve,
}

/// On-disk record of one persistent class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentClass {
    /// Epoch seconds after which the class is no longer live.
    pub expires: i64,
    pub policy: PersistentPolicy,
    pub tags: Vec<String>,
}

/// Save (or refresh) a persistent class for `minutes` from `now`.
pub fn persist_class(
    db: &dyn Kv,
    name: &str,
    minutes: i64,
    policy: PersistentPolicy,
    tags: &[&str],
    now: i64,
) -> Result<(), StoreError> {
    let record = PersistentClass {
        expires: now + minutes * 60,
        policy,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    };
    let value =
        serde_json::to_vec(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    debug!(class = name, minutes, ?policy, "persisting class");
    db.write(name.as_bytes(), &value)
}

/// Remove a persistent class outright.
pub fn unpersist_class(db: &dyn Kv, name: &str) -> Result<bool, StoreError> {
    db.delete(name.as_bytes())
}

/// Load every live persistent class into the context as a
/// namespace-scoped class; purge expired entries with the `Reset` policy.
/// Returns how many classes went live.
pub fn load_persistent_classes(
    db: &dyn Kv,
    ctx: &mut ClassContext,
    now: i64,
) -> Result<usize, StoreError> {
    let mut loaded = 0usize;
    let mut cursor: Box<dyn KvCursor> = db.cursor()?;

    while let Some((key, value)) = cursor.advance()? {
        let name = String::from_utf8_lossy(&key).into_owned();
        let record: PersistentClass = match serde_json::from_slice(&value) {
            Ok(r) => r,
            Err(_) => {
                // Unreadable records are treated as expired garbage.
                cursor.delete_current();
                continue;
            }
        };

        if record.expires > now {
            let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
            let (ns, bare) = match name.split_once(':') {
                Some((ns, bare)) => (Some(ns), bare),
                None => (None, name.as_str()),
            };
            ctx.define(ns, bare, ClassScope::Namespace, &tags);
            loaded += 1;
        } else if record.policy == PersistentPolicy::Reset {
            debug!(class = %name, "purging expired persistent class");
            cursor.delete_current();
        }
    }

    info!(loaded, "persistent classes loaded");
    Ok(loaded)
}
