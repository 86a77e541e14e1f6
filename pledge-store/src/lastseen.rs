//! Last-seen host index
//!
//! Tracks which peers this host has exchanged keys with, in both
//! directions, with a quality-of-connection estimate per direction.
//!
//! Schema, one shared store:
//!
//! * `k<hostkey>` → address (forward)
//! * `a<address>` → hostkey (reverse, auxiliary)
//! * `q<direction><hostkey>` → quality entry, direction `i` or `o`
//!
//! String values are written NUL-terminated; quality entries are the
//! fixed-width host-endian `(lastseen, q)` pair. The forward mapping is
//! authoritative: a reverse entry that disagrees with it is purged lazily
//! by whichever reader notices.

use pledge_core::StoreError;
use tracing::{debug, warn};

use crate::Kv;

/// Weight of the newest observation in the quality average.
pub const LASTSEEN_EWMA_ALPHA: f64 = 0.4;

/// Direction of the recorded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    fn key_char(&self) -> u8 {
        match self {
            Direction::Incoming => b'i',
            Direction::Outgoing => b'o',
        }
    }
}

/// Quality-of-connection record for one (direction, hostkey).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityEntry {
    /// Epoch seconds of the most recent sighting.
    pub lastseen: i64,
    /// Exponentially weighted average of the gap between sightings.
    pub q: f64,
}

impl QualityEntry {
    const ENCODED_LEN: usize = 16;

    fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.lastseen.to_ne_bytes());
        out[8..].copy_from_slice(&self.q.to_ne_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(QualityEntry {
            lastseen: i64::from_ne_bytes(bytes[..8].try_into().ok()?),
            q: f64::from_ne_bytes(bytes[8..].try_into().ok()?),
        })
    }
}

fn hostkey_key(hostkey: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + hostkey.len());
    key.push(b'k');
    key.extend_from_slice(hostkey.as_bytes());
    key
}

fn address_key(address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + address.len());
    key.push(b'a');
    key.extend_from_slice(address.as_bytes());
    key
}

fn quality_key(direction: Direction, hostkey: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + hostkey.len());
    key.push(b'q');
    key.push(direction.key_char());
    key.extend_from_slice(hostkey.as_bytes());
    key
}

fn encode_str(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    out
}

fn decode_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// The bidirectional hostkey/address index.
pub struct LastSeen {
    db: Box<dyn Kv>,
    /// Digest of this host's own public key; localhost lookups
    /// short-circuit to it.
    local_digest: Option<String>,
    /// Addresses considered to be this host.
    local_addresses: Vec<String>,
}

impl LastSeen {
    pub fn new(db: Box<dyn Kv>) -> Self {
        LastSeen {
            db,
            local_digest: None,
            local_addresses: Vec::new(),
        }
    }

    /// Register the local identity used by the localhost short-circuit.
    pub fn with_local_identity(
        mut self,
        digest: impl Into<String>,
        addresses: Vec<String>,
    ) -> Self {
        self.local_digest = Some(digest.into());
        self.local_addresses = addresses;
        self
    }

    /// Record one sighting of a peer, updating all three index families.
    /// The quality average folds the gap since the previous sighting with
    /// weight [`LASTSEEN_EWMA_ALPHA`]; a first sighting starts from the
    /// definite zero estimate.
    pub fn record_sighting(
        &self,
        hostkey: &str,
        address: &str,
        direction: Direction,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        if address.is_empty() {
            warn!(hostkey, "ignoring sighting with empty address");
            return Ok(());
        }

        let qkey = quality_key(direction, hostkey);
        let previous = self
            .db
            .read(&qkey)?
            .and_then(|bytes| QualityEntry::decode(&bytes));

        let q = match previous {
            Some(prev) => {
                let gap = (timestamp - prev.lastseen) as f64;
                LASTSEEN_EWMA_ALPHA * gap + (1.0 - LASTSEEN_EWMA_ALPHA) * prev.q
            }
            None => 0.0,
        };
        let entry = QualityEntry {
            lastseen: timestamp,
            q,
        };
        self.db.write(&qkey, &entry.encode())?;

        self.db.write(&hostkey_key(hostkey), &encode_str(address))?;
        self.db.write(&address_key(address), &encode_str(hostkey))?;

        debug!(hostkey, address, ?direction, q, "sighting recorded");
        Ok(())
    }

    /// Reverse lookup with lazy self-healing: when the forward mapping is
    /// missing or disagrees, the reverse entry is purged and the lookup
    /// reports not-found rather than an error.
    pub fn address_to_hostkey(&self, address: &str) -> Result<Option<String>, StoreError> {
        if address == "127.0.0.1"
            || address == "::1"
            || self.local_addresses.iter().any(|a| a == address)
        {
            return Ok(self.local_digest.clone());
        }

        let akey = address_key(address);
        let hostkey = match self.db.read(&akey)? {
            Some(bytes) => decode_str(&bytes),
            None => return Ok(None),
        };

        match self.db.read(&hostkey_key(&hostkey))? {
            Some(bytes) if decode_str(&bytes) == address => Ok(Some(hostkey)),
            _ => {
                // Forward mapping gone or pointing elsewhere; drop the
                // stale reverse entry.
                self.db.delete(&akey)?;
                Ok(None)
            }
        }
    }

    /// Forward lookup.
    pub fn hostkey_to_address(&self, hostkey: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .read(&hostkey_key(hostkey))?
            .map(|bytes| decode_str(&bytes)))
    }

    /// Remove a host entirely: forward entry, consistent reverse entry and
    /// both quality entries.
    pub fn remove_host(&self, hostkey: &str) -> Result<bool, StoreError> {
        let fkey = hostkey_key(hostkey);

        if let Some(bytes) = self.db.read(&fkey)? {
            let address = decode_str(&bytes);
            self.db.delete(&address_key(&address))?;
        }

        self.db.delete(&quality_key(Direction::Incoming, hostkey))?;
        self.db.delete(&quality_key(Direction::Outgoing, hostkey))?;
        self.db.delete(&fkey)
    }

    /// Walk every known host, invoking the callback once per direction
    /// that has a quality entry. The callback returning `false` stops the
    /// scan. Iteration order is unspecified but stable within a run.
    pub fn scan<F>(&self, mut callback: F) -> Result<(), StoreError>
    where
        F: FnMut(&str, &str, Direction, &QualityEntry) -> bool,
    {
        let mut cursor = self.db.cursor()?;
        'outer: while let Some((key, value)) = cursor.advance()? {
            if key.first() != Some(&b'k') {
                continue;
            }
            let hostkey = String::from_utf8_lossy(&key[1..]).into_owned();
            let address = decode_str(&value);

            for direction in [Direction::Incoming, Direction::Outgoing] {
                let qkey = quality_key(direction, &hostkey);
                if let Some(bytes) = self.db.read(&qkey)? {
                    if let Some(entry) = QualityEntry::decode(&bytes) {
                        if !callback(&hostkey, &address, direction, &entry) {
                            break 'outer;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of distinct hostkeys.
    pub fn count(&self) -> Result<usize, StoreError> {
        let mut cursor = self.db.cursor()?;
        let mut count = 0;
        while let Some((key, value)) = cursor.advance()? {
            if key.first() == Some(&b'k') && !value.is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }
}
