//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary server records, keyed by server name.
    pub const SERVERS: &str = "servers";

    /// Index: servers by state, keyed by `state || name`.
    pub const SERVERS_BY_STATE: &str = "servers_by_state";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::SERVERS, cf::SERVERS_BY_STATE]
}
