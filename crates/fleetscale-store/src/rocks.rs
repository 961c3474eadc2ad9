//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetscale_core::ServerName;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{Server, ServerState};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// Serializes read-modify-write cycles so the state index never drifts.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Write a record, moving its index entry from `previous` if the state changed.
    fn write(&self, server: &Server, previous: Option<ServerState>) -> Result<()> {
        let cf_servers = self.cf(cf::SERVERS)?;
        let cf_by_state = self.cf(cf::SERVERS_BY_STATE)?;

        let value = Self::serialize(server)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_servers, keys::server_key(&server.name), &value);
        if let Some(old) = previous {
            if old != server.state {
                batch.delete_cf(
                    &cf_by_state,
                    keys::state_server_key(old.as_u8(), &server.name),
                );
            }
        }
        batch.put_cf(
            &cf_by_state,
            keys::state_server_key(server.state.as_u8(), &server.name),
            [],
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Load the stored copy of a server or fail with `NotFound`.
    fn existing(&self, name: &ServerName) -> Result<Server> {
        self.find(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

impl Store for RocksStore {
    fn find(&self, name: &ServerName) -> Result<Option<Server>> {
        let cf = self.cf(cf::SERVERS)?;

        self.db
            .get_cf(&cf, keys::server_key(name))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list(&self) -> Result<Vec<Server>> {
        let cf = self.cf(cf::SERVERS)?;

        let mut servers = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            servers.push(Self::deserialize(&value)?);
        }

        Ok(servers)
    }

    fn list_state(&self, state: ServerState) -> Result<Vec<Server>> {
        let cf_by_state = self.cf(cf::SERVERS_BY_STATE)?;
        let prefix = keys::state_prefix(state.as_u8());

        let mut servers = Vec::new();
        let iter = self.db.iterator_cf(
            &cf_by_state,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            if !key.starts_with(&prefix) {
                break;
            }

            let Some(name) = keys::extract_name_from_state_key(&key) else {
                tracing::warn!(state = %state, "skipping malformed state index key");
                continue;
            };
            if let Some(server) = self.find(&name)? {
                servers.push(server);
            }
        }

        Ok(servers)
    }

    fn create(&self, server: &mut Server) -> Result<()> {
        let _guard = self.write_lock.lock();

        if self.find(&server.name)?.is_some() {
            return Err(StoreError::AlreadyExists(server.name.to_string()));
        }

        let now = Utc::now();
        server.created = now;
        server.updated = now;
        self.write(server, None)
    }

    fn update(&self, server: &mut Server) -> Result<()> {
        let _guard = self.write_lock.lock();

        let stored = self.existing(&server.name)?;
        server.updated = Utc::now();
        self.write(server, Some(stored.state))
    }

    fn transition(&self, server: &mut Server, expected: ServerState) -> Result<()> {
        let _guard = self.write_lock.lock();

        let stored = self.existing(&server.name)?;
        if stored.state != expected {
            return Err(StoreError::Conflict {
                server: server.name.to_string(),
                expected,
                actual: stored.state,
            });
        }

        server.last_busy = server.last_busy.max(stored.last_busy);
        server.updated = Utc::now();
        self.write(server, Some(stored.state))
    }

    fn busy(&self, server: &mut Server) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut stored = self.existing(&server.name)?;
        let now = Utc::now();
        stored.last_busy = Some(now);
        stored.updated = now;
        let previous = stored.state;
        self.write(&stored, Some(previous))?;

        server.last_busy = stored.last_busy;
        server.updated = stored.updated;
        Ok(())
    }

    fn delete(&self, name: &ServerName) -> Result<()> {
        let _guard = self.write_lock.lock();

        let cf_servers = self.cf(cf::SERVERS)?;
        let cf_by_state = self.cf(cf::SERVERS_BY_STATE)?;

        let server = self.existing(name)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_servers, keys::server_key(name));
        batch.delete_cf(
            &cf_by_state,
            keys::state_server_key(server.state.as_u8(), name),
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn purge(&self, before: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<ServerName> = self
            .list_state(ServerState::Stopped)?
            .into_iter()
            .filter(|server| server.updated < before)
            .map(|server| server.name)
            .collect();

        let mut purged = 0;
        for name in &expired {
            match self.delete(name) {
                Ok(()) => purged += 1,
                // Raced with another purge.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if purged > 0 {
            tracing::debug!(count = purged, "purged stopped servers");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleetscale_core::ProviderKind;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn create_test_server(name: &str) -> Server {
        Server::new_pending(
            ServerName::parse(name).unwrap(),
            ProviderKind::Mock,
            2,
            "secret".to_string(),
        )
    }

    #[test]
    fn server_crud() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-crud");

        // Create
        store.create(&mut server).unwrap();

        // Read
        let retrieved = store.find(&server.name).unwrap().unwrap();
        assert_eq!(retrieved.capacity, 2);
        assert_eq!(retrieved.state, ServerState::Pending);

        // Update
        server.state = ServerState::Creating;
        store.update(&mut server).unwrap();
        let updated = store.find(&server.name).unwrap().unwrap();
        assert_eq!(updated.state, ServerState::Creating);
        assert!(updated.updated >= updated.created);

        // Delete
        store.delete(&server.name).unwrap();
        assert!(store.find(&server.name).unwrap().is_none());
        assert!(matches!(
            store.delete(&server.name),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn create_rejects_duplicates() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-dup");
        store.create(&mut server).unwrap();

        let mut again = create_test_server("agent-dup");
        assert!(matches!(
            store.create(&mut again),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn create_stamps_timestamps() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-stamp");
        server.created = Utc::now() - Duration::days(30);

        let before = Utc::now();
        store.create(&mut server).unwrap();
        assert!(server.created >= before);
        assert_eq!(server.created, server.updated);
    }

    #[test]
    fn update_missing_server_fails() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-ghost");
        assert!(matches!(
            store.update(&mut server),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_keeps_created() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-old");
        store.create(&mut server).unwrap();

        let backdated = Utc::now() - Duration::hours(5);
        server.created = backdated;
        store.update(&mut server).unwrap();

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.created, backdated);
        assert!(stored.updated > backdated);
    }

    #[test]
    fn list_by_state() {
        let (store, _dir) = create_test_store();

        let mut a = create_test_server("agent-a");
        let mut b = create_test_server("agent-b");
        let mut c = create_test_server("agent-c");
        store.create(&mut a).unwrap();
        store.create(&mut b).unwrap();
        store.create(&mut c).unwrap();

        c.state = ServerState::Running;
        store.update(&mut c).unwrap();

        assert_eq!(store.list_state(ServerState::Pending).unwrap().len(), 2);
        let running = store.list_state(ServerState::Running).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, c.name);
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[test]
    fn state_index_updated_on_change() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-index");
        store.create(&mut server).unwrap();

        for state in [
            ServerState::Creating,
            ServerState::Created,
            ServerState::Error,
        ] {
            server.state = state;
            store.update(&mut server).unwrap();
        }

        for state in ServerState::ALL {
            let expected = usize::from(state == ServerState::Error);
            assert_eq!(store.list_state(state).unwrap().len(), expected, "{state}");
        }
    }

    #[test]
    fn transition_requires_expected_state() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-cas");
        store.create(&mut server).unwrap();

        let mut stale = server.clone();

        server.state = ServerState::Creating;
        store.transition(&mut server, ServerState::Pending).unwrap();

        // The stale copy still believes the server is pending.
        stale.state = ServerState::Creating;
        stale.error = Some("late writer".into());
        match store.transition(&mut stale, ServerState::Pending) {
            Err(StoreError::Conflict { expected, actual, .. }) => {
                assert_eq!(expected, ServerState::Pending);
                assert_eq!(actual, ServerState::Creating);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Creating);
        assert!(stored.error.is_none());
        assert_eq!(store.list_state(ServerState::Creating).unwrap().len(), 1);
        assert!(store.list_state(ServerState::Pending).unwrap().is_empty());
    }

    #[test]
    fn transition_keeps_recorded_activity() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-active");
        store.create(&mut server).unwrap();

        let mut copy = server.clone();
        store.busy(&mut server).unwrap();

        copy.state = ServerState::Creating;
        store.transition(&mut copy, ServerState::Pending).unwrap();

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.last_busy, server.last_busy);
        assert!(stored.last_busy.is_some());
    }

    #[test]
    fn transition_missing_server_fails() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-none");
        assert!(matches!(
            store.transition(&mut server, ServerState::Pending),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn busy_touches_timestamps_only() {
        let (store, _dir) = create_test_store();
        let mut server = create_test_server("agent-busy");
        store.create(&mut server).unwrap();
        server.state = ServerState::Running;
        store.update(&mut server).unwrap();

        // A stale copy must not roll back the stored state.
        let mut stale = server.clone();
        stale.state = ServerState::Pending;
        store.busy(&mut stale).unwrap();

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Running);
        assert!(stored.last_busy.is_some());
        assert_eq!(stale.last_busy, stored.last_busy);
        assert_eq!(store.list_state(ServerState::Running).unwrap().len(), 1);
    }

    #[test]
    fn purge_removes_only_old_stopped() {
        let (store, _dir) = create_test_store();

        let mut stopped = create_test_server("agent-stopped");
        let mut running = create_test_server("agent-running");
        store.create(&mut stopped).unwrap();
        store.create(&mut running).unwrap();

        stopped.state = ServerState::Stopped;
        store.update(&mut stopped).unwrap();
        running.state = ServerState::Running;
        store.update(&mut running).unwrap();

        // Nothing is old enough yet.
        let cutoff = Utc::now() - Duration::hours(1);
        assert_eq!(store.purge(cutoff).unwrap(), 0);

        let cutoff = Utc::now() + Duration::seconds(1);
        assert_eq!(store.purge(cutoff).unwrap(), 1);
        assert!(store.find(&stopped.name).unwrap().is_none());
        assert!(store.find(&running.name).unwrap().is_some());
        assert!(store.list_state(ServerState::Stopped).unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        let name = {
            let store = RocksStore::open(dir.path()).unwrap();
            let mut server = create_test_server("agent-durable");
            store.create(&mut server).unwrap();
            server.name
        };

        let store = RocksStore::open(dir.path()).unwrap();
        assert!(store.find(&name).unwrap().is_some());
        assert_eq!(store.list_state(ServerState::Pending).unwrap().len(), 1);
    }
}
