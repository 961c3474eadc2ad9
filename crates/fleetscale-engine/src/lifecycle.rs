//! Server lifecycle state machine.
//!
//! Every write a reconciler makes goes through [`advance`], which validates
//! the transition against this table before persisting.
//!
//! # State Machine
//!
//! ```text
//! pending ─▶ creating ─▶ created ─▶ staging ─▶ running ─▶ shutdown ─▶ stopping ─▶ stopped
//!               │                      │          │                       │          ▲
//!               └──────────────────────┴──────────┴──────▶ error ◀────────┘          │
//!                                                            └─────── (reaper) ──────┘
//! ```
//!
//! Besides the main line:
//!
//! - `created`, `staging` and `running` can be retired to `shutdown`
//! - crash recovery resets `staging` to `created` and `stopping` to `shutdown`
//! - crash recovery moves `creating` to `error`

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetscale_core::ServerName;
use fleetscale_store::{Server, ServerState, Store, StoreError};

use crate::error::{EngineError, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `EngineError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(
    server: &ServerName,
    from: ServerState,
    to: ServerState,
) -> Result<ServerState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(EngineError::InvalidTransition {
            server: server.clone(),
            from,
            to,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: ServerState, to: ServerState) -> bool {
    use ServerState::{
        Created, Creating, Error, Pending, Running, Shutdown, Staging, Stopped, Stopping,
    };

    matches!(
        (from, to),
        // Allocator claims and finishes
        (Pending, Creating)
            | (Creating, Created | Error)
            // Installer claims and finishes; recovery resets staging
            | (Created, Staging)
            | (Staging, Running | Error | Created)
            // Planner retires, zombie detector and pinger flag
            | (Created | Staging | Running, Shutdown)
            | (Running, Error)
            // Collector claims and finishes; recovery resets stopping
            | (Shutdown, Stopping)
            | (Stopping, Stopped | Error | Shutdown)
            // Reaper drains errors
            | (Error, Stopped)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: ServerState) -> Vec<ServerState> {
    ServerState::ALL
        .into_iter()
        .filter(|to| is_valid_transition(state, *to))
        .collect()
}

/// Returns true if the server has reached the end of its life.
#[must_use]
pub const fn is_terminal(state: ServerState) -> bool {
    matches!(state, ServerState::Stopped)
}

/// Returns true if the server's capacity counts toward the pool.
#[must_use]
pub const fn counts_toward_pool(state: ServerState) -> bool {
    !is_terminal(state)
}

/// Whether at least `min` has passed between `since` and `now`.
///
/// A timestamp in the future counts as zero elapsed time.
#[must_use]
pub fn age_at_least(since: DateTime<Utc>, now: DateTime<Utc>, min: Duration) -> bool {
    (now - since).to_std().map_or(min.is_zero(), |age| age >= min)
}

/// Validate and persist a transition of `server` to `to`.
///
/// The write only lands if the stored state still matches `server.state`.
/// On failure `server` keeps its previous state.
///
/// # Errors
///
/// Returns `EngineError::InvalidTransition` without writing if the move is not
/// allowed, a `StoreError::Conflict` if another reconciler moved the server
/// first, or a store error if the write fails.
pub fn advance(store: &dyn Store, server: &mut Server, to: ServerState) -> Result<()> {
    let from = server.state;
    server.state = validate_transition(&server.name, from, to)?;
    if let Err(e) = store.transition(server, from) {
        server.state = from;
        return Err(e.into());
    }
    Ok(())
}

/// [`advance`] for sweeps claiming a server they just listed.
///
/// Returns `false` if the server moved on since it was listed; the sweep
/// skips it.
///
/// # Errors
///
/// Returns any error from [`advance`] other than a conflict.
pub fn claim(store: &dyn Store, server: &mut Server, to: ServerState) -> Result<bool> {
    match advance(store, server, to) {
        Ok(()) => Ok(true),
        Err(EngineError::Store(StoreError::Conflict { actual, .. })) => {
            tracing::debug!(
                server = %server.name,
                state = %actual,
                "Server moved on before it was claimed"
            );
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// [`advance`] for background tasks, which have no caller to report to.
///
/// A failed write is logged and the server keeps its last persisted state.
/// Losing to another reconciler is expected and drops the write.
pub fn settle(store: &dyn Store, server: &mut Server, to: ServerState) {
    match advance(store, server, to) {
        Ok(()) => {}
        Err(EngineError::Store(StoreError::Conflict { actual, .. })) => {
            tracing::warn!(
                server = %server.name,
                state = %actual,
                wanted = %to,
                "Server moved on; dropping stale transition"
            );
        }
        Err(e) => {
            tracing::error!(
                server = %server.name,
                state = %to,
                error = %e,
                "Failed to persist server state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetscale_core::ProviderKind;
    use fleetscale_store::RocksStore;

    #[test]
    fn valid_transitions() {
        use ServerState::*;

        // Happy path
        assert!(is_valid_transition(Pending, Creating));
        assert!(is_valid_transition(Creating, Created));
        assert!(is_valid_transition(Created, Staging));
        assert!(is_valid_transition(Staging, Running));
        assert!(is_valid_transition(Running, Shutdown));
        assert!(is_valid_transition(Shutdown, Stopping));
        assert!(is_valid_transition(Stopping, Stopped));
        // Failures and recovery
        assert!(is_valid_transition(Creating, Error));
        assert!(is_valid_transition(Staging, Created));
        assert!(is_valid_transition(Stopping, Shutdown));
        assert!(is_valid_transition(Error, Stopped));
    }

    #[test]
    fn invalid_transitions() {
        use ServerState::*;

        // No skipping the allocator
        assert!(!is_valid_transition(Pending, Created));
        // Stopped is final
        for to in ServerState::ALL {
            assert!(!is_valid_transition(Stopped, to));
        }
        // Error only drains to stopped
        assert!(!is_valid_transition(Error, Running));
        assert!(!is_valid_transition(Error, Shutdown));
        // Nothing claims a server that is already being torn down
        assert!(!is_valid_transition(Stopping, Running));
        assert!(!is_valid_transition(Pending, Shutdown));
    }

    #[test]
    fn every_state_but_stopped_can_reach_stopped() {
        for from in ServerState::ALL {
            if from == ServerState::Stopped {
                continue;
            }
            let mut frontier = vec![from];
            let mut seen = vec![from];
            while let Some(state) = frontier.pop() {
                for next in valid_transitions_from(state) {
                    if !seen.contains(&next) {
                        seen.push(next);
                        frontier.push(next);
                    }
                }
            }
            assert!(seen.contains(&ServerState::Stopped), "{from} is stuck");
        }
    }

    #[test]
    fn validate_transition_err() {
        let name = ServerName::parse("agent-bad").unwrap();
        let result = validate_transition(&name, ServerState::Stopped, ServerState::Running);

        match result {
            Err(EngineError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, ServerState::Stopped);
                assert_eq!(to, ServerState::Running);
            }
            _ => panic!("expected InvalidTransition error"),
        }
    }

    #[test]
    fn advance_persists_only_valid_moves() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let mut server = Server::new_pending(ServerName::generate(), ProviderKind::Mock, 1, "s".into());
        store.create(&mut server).unwrap();

        assert!(advance(&store, &mut server, ServerState::Running).is_err());
        assert_eq!(server.state, ServerState::Pending);

        advance(&store, &mut server, ServerState::Creating).unwrap();
        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Creating);
    }

    #[test]
    fn stale_copy_cannot_overwrite_a_newer_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let mut server = Server::new_pending(ServerName::generate(), ProviderKind::Mock, 1, "s".into());
        store.create(&mut server).unwrap();
        advance(&store, &mut server, ServerState::Creating).unwrap();
        advance(&store, &mut server, ServerState::Created).unwrap();
        advance(&store, &mut server, ServerState::Staging).unwrap();

        // Another reconciler retires the server under the installer's feet.
        let mut installing = server.clone();
        advance(&store, &mut server, ServerState::Shutdown).unwrap();

        let err = advance(&store, &mut installing, ServerState::Running).unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Conflict { .. })));
        assert_eq!(err.http_status_code(), 409);
        assert_eq!(installing.state, ServerState::Staging);

        settle(&store, &mut installing, ServerState::Error);
        assert_eq!(store.find(&server.name).unwrap().unwrap().state, ServerState::Shutdown);
    }

    #[test]
    fn claim_skips_servers_that_moved_on() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let mut server = Server::new_pending(ServerName::generate(), ProviderKind::Mock, 1, "s".into());
        store.create(&mut server).unwrap();

        let mut listed = server.clone();
        assert!(claim(&store, &mut server, ServerState::Creating).unwrap());
        assert!(!claim(&store, &mut listed, ServerState::Creating).unwrap());

        // Invalid moves are still errors.
        assert!(claim(&store, &mut server, ServerState::Stopped).is_err());
    }

    #[test]
    fn age_checks() {
        let now = Utc::now();
        let hour = Duration::from_secs(3600);
        assert!(age_at_least(now - chrono::Duration::hours(2), now, hour));
        assert!(!age_at_least(now - chrono::Duration::minutes(5), now, hour));
        assert!(!age_at_least(now + chrono::Duration::hours(1), now, hour));
        assert!(age_at_least(now + chrono::Duration::hours(1), now, Duration::ZERO));
    }

    #[test]
    fn pool_membership() {
        assert!(counts_toward_pool(ServerState::Error));
        assert!(counts_toward_pool(ServerState::Pending));
        assert!(!counts_toward_pool(ServerState::Stopped));
    }
}
