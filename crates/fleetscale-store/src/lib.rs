//! `RocksDB` storage layer for fleetscale.
//!
//! This crate persists [`Server`] records, the durable unit of work of the
//! control plane, using `RocksDB` with column families for per-state indexing.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `servers`: Primary server records, keyed by server name
//! - `servers_by_state`: Index for listing servers by lifecycle state
//!
//! # Example
//!
//! ```no_run
//! use fleetscale_store::{RocksStore, ServerState, Store};
//!
//! # fn main() -> fleetscale_store::Result<()> {
//! let store = RocksStore::open("/tmp/fleetscale-db")?;
//!
//! // List servers waiting for the allocator
//! let pending = store.list_state(ServerState::Pending)?;
//! # let _ = pending;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{Server, ServerState};

use chrono::{DateTime, Utc};
use fleetscale_core::ServerName;

/// The storage trait defining all server persistence operations.
///
/// Implementations own the `created` and `updated` timestamps; callers never
/// set them directly.
pub trait Store: Send + Sync {
    /// Get a server by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find(&self, name: &ServerName) -> Result<Option<Server>>;

    /// List every server in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list(&self) -> Result<Vec<Server>>;

    /// List all servers in a given state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_state(&self, state: ServerState) -> Result<Vec<Server>>;

    /// Insert a new server, stamping `created` and `updated`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the name is taken.
    fn create(&self, server: &mut Server) -> Result<()>;

    /// Replace an existing server, stamping `updated`.
    ///
    /// This also maintains the state index atomically.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the server doesn't exist.
    fn update(&self, server: &mut Server) -> Result<()>;

    /// Replace an existing server only if its stored state is still
    /// `expected`.
    ///
    /// Every lifecycle transition goes through this write, so a writer
    /// holding a stale copy loses instead of overwriting a newer state.
    /// `last_busy` keeps the later of the stored and the written value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the stored state is not `expected`,
    /// or `StoreError::NotFound` if the server doesn't exist.
    fn transition(&self, server: &mut Server, expected: ServerState) -> Result<()>;

    /// Record that the server was observed running a build.
    ///
    /// Sets `last_busy` and `updated` without touching the state.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the server doesn't exist.
    fn busy(&self, server: &mut Server) -> Result<()>;

    /// Delete a server by name.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the server doesn't exist.
    fn delete(&self, name: &ServerName) -> Result<()>;

    /// Delete `stopped` servers last updated before `before`.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn purge(&self, before: DateTime<Utc>) -> Result<usize>;
}
