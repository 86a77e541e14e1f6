//! Bootstrap artifacts
//!
//! The small on-disk files that record how this host relates to its
//! policy source: the policy-server address, the policy-hub marker, a
//! random bootstrap id, the random seed file, and the key-file paths the
//! secure transport identifies peers by.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Policy-server address file under the workdir.
pub const POLICY_SERVER_FILE: &str = "policy_server.dat";
/// Marker file under the state directory; presence means this host is a
/// policy hub.
pub const AM_POLICY_HUB_FILE: &str = "am_policy_hub";
/// Bootstrap id file under the workdir.
pub const BOOTSTRAP_ID_FILE: &str = "bootstrap_id.dat";
/// Random seed file under the state directory.
pub const RANDSEED_FILE: &str = "randseed";

/// 240 random bits: divisible by six, so the base64 form needs no
/// padding.
const BOOTSTRAP_ID_RANDOM_BYTES: usize = 240 / 8;
/// Size of the random seed file.
const RANDSEED_BYTES: usize = 1024;

// ============================================================================
// POLICY SERVER
// ============================================================================

/// Read the configured policy server (`host` or `host:port`), trimmed.
/// `None` when the file is missing or empty.
pub fn read_policy_server(workdir: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(workdir.join(POLICY_SERVER_FILE)).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Write the policy server address, with a trailing newline.
pub fn write_policy_server(workdir: &Path, address: &str) -> std::io::Result<()> {
    let path = workdir.join(POLICY_SERVER_FILE);
    std::fs::create_dir_all(workdir)?;
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "{address}")?;
    info!(path = %path.display(), address, "policy server recorded");
    Ok(())
}

/// Remove the policy server file; absent is fine.
pub fn remove_policy_server(workdir: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(workdir.join(POLICY_SERVER_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Split a `host[:port]` string. A lone colon-free string is all host;
/// a bracketed IPv6 literal keeps its brackets out of the host part.
pub fn split_host_port(address: &str) -> (String, Option<u16>) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok());
            return (host.to_string(), port);
        }
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (address.to_string(), None),
        },
        // More than one colon and no brackets: a bare IPv6 address.
        _ => (address.to_string(), None),
    }
}

// ============================================================================
// POLICY HUB MARKER
// ============================================================================

/// Whether the zero-byte hub marker exists.
pub fn am_policy_hub(state_dir: &Path) -> bool {
    state_dir.join(AM_POLICY_HUB_FILE).exists()
}

/// Create or remove the hub marker.
pub fn write_am_policy_hub(state_dir: &Path, is_hub: bool) -> std::io::Result<()> {
    let path = state_dir.join(AM_POLICY_HUB_FILE);
    if is_hub {
        std::fs::create_dir_all(state_dir)?;
        std::fs::File::create(&path)?;
        debug!(path = %path.display(), "hub marker created");
    } else {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ============================================================================
// BOOTSTRAP ID AND RANDOM SEED
// ============================================================================

/// Return the host's bootstrap id, generating and persisting one on
/// first use: 240 random bits, base64 without padding (40 characters),
/// newline-terminated on disk.
pub fn bootstrap_id(workdir: &Path) -> std::io::Result<String> {
    let path = workdir.join(BOOTSTRAP_ID_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let mut random = [0u8; BOOTSTRAP_ID_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut random);
    let id = STANDARD_NO_PAD.encode(random);

    std::fs::create_dir_all(workdir)?;
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "{id}")?;
    info!(path = %path.display(), "bootstrap id generated");
    Ok(id)
}

/// Regenerate the random seed file: 1024 random bytes, mode 0600.
pub fn write_randseed(state_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join(RANDSEED_FILE);

    let mut seed = vec![0u8; RANDSEED_BYTES];
    rand::thread_rng().fill_bytes(&mut seed);

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(&seed)?;
    Ok(path)
}

// ============================================================================
// KEY PATHS AND DIGESTS
// ============================================================================

/// This host's public key file.
pub fn public_key_path(workdir: &Path) -> PathBuf {
    workdir.join("ppkeys").join("localhost.pub")
}

/// This host's private key file.
pub fn private_key_path(workdir: &Path) -> PathBuf {
    workdir.join("ppkeys").join("localhost.priv")
}

/// A remote peer's public key file, named by its digest.
pub fn remote_key_path(workdir: &Path, digest: &str) -> PathBuf {
    workdir.join("ppkeys").join(format!("root-{digest}.pub"))
}

/// The printable digest identifying a public key: `SHA=` plus the hex
/// digest of the key bytes. This is the hostkey the last-seen index and
/// the trust store are keyed by.
pub fn hostkey_digest(pubkey: &[u8]) -> String {
    let digest = Sha256::digest(pubkey);
    format!("SHA={}", hex::encode(digest))
}
