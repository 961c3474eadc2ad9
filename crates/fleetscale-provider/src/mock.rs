//! Mock provider for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use fleetscale_core::{Instance, ProviderKind, ServerName};
use parking_lot::Mutex;

use crate::error::{ProviderError, Result};
use crate::{CreateOpts, Provider};

/// How the mock answers destroy calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DestroyBehavior {
    /// Remove the instance, or report not-found if it is unknown.
    #[default]
    Ok,
    /// Always report the instance as already gone.
    NotFound,
    /// Fail with an API error carrying this message.
    Fail(String),
}

/// An in-memory provider that records instances.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    instances: HashMap<String, Instance>,
    next_id: u64,
    create_error: Option<String>,
    destroy: DestroyBehavior,
    address: Option<String>,
    create_calls: usize,
    destroy_calls: usize,
}

impl MockProvider {
    /// Create a new mock provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent create fail with the given message.
    pub fn fail_create(&self, message: impl Into<String>) {
        self.state.lock().create_error = Some(message.into());
    }

    /// Set how destroy calls are answered.
    pub fn set_destroy(&self, behavior: DestroyBehavior) {
        self.state.lock().destroy = behavior;
    }

    /// Address reported for new instances (default `127.0.0.1`).
    pub fn set_address(&self, address: impl Into<String>) {
        self.state.lock().address = Some(address.into());
    }

    /// Number of live instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// Number of create calls seen.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    /// Names of the live instances, sorted.
    #[must_use]
    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .instances
            .values()
            .map(|i| i.name.to_string())
            .collect();
        names.sort();
        names
    }

    /// Number of destroy calls seen.
    #[must_use]
    pub fn destroy_calls(&self) -> usize {
        self.state.lock().destroy_calls
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn create(&self, opts: &CreateOpts) -> Result<Instance> {
        let mut state = self.state.lock();
        state.create_calls += 1;

        if let Some(message) = &state.create_error {
            return Err(ProviderError::Api {
                status: 500,
                message: message.clone(),
            });
        }

        state.next_id += 1;
        let instance = Instance {
            provider: ProviderKind::Mock,
            id: format!("mock-{}", state.next_id),
            name: opts.name.clone(),
            address: state
                .address
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            region: "mock-region".to_string(),
            image: "mock-image".to_string(),
            size: "mock-size".to_string(),
        };
        state.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn destroy(&self, instance: &Instance) -> Result<()> {
        let mut state = self.state.lock();
        state.destroy_calls += 1;

        match state.destroy.clone() {
            DestroyBehavior::Ok => state
                .instances
                .remove(&instance.id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::InstanceNotFound(instance.id.clone())),
            DestroyBehavior::NotFound => {
                state.instances.remove(&instance.id);
                Err(ProviderError::InstanceNotFound(instance.id.clone()))
            }
            DestroyBehavior::Fail(message) => Err(ProviderError::Api {
                status: 500,
                message,
            }),
        }
    }

    async fn find(&self, name: &ServerName) -> Result<Option<Instance>> {
        Ok(self
            .state
            .lock()
            .instances
            .values()
            .find(|i| &i.name == name)
            .cloned())
    }
}
