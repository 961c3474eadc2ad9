//! Key encoding utilities for `RocksDB`.
//!
//! Keys are laid out so that every per-state listing is a single prefix scan.

use fleetscale_core::ServerName;

/// Encode a server key (the name bytes).
#[must_use]
pub fn server_key(name: &ServerName) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// Encode a state index key: `state || name`.
#[must_use]
pub fn state_server_key(state: u8, name: &ServerName) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.as_bytes().len());
    key.push(state);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Encode a state prefix for scanning all servers in a state.
#[must_use]
pub fn state_prefix(state: u8) -> Vec<u8> {
    vec![state]
}

/// Extract the server name from a state index key.
///
/// Returns `None` if the key is too short or the name is not valid.
#[must_use]
pub fn extract_name_from_state_key(key: &[u8]) -> Option<ServerName> {
    let raw = std::str::from_utf8(key.get(1..)?).ok()?;
    ServerName::parse(raw).ok()
}
