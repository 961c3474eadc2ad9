//! Provisions machines for `pending` servers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetscale_core::{Instance, TlsMaterial};
use fleetscale_provider::{CreateOpts, Provider};
use fleetscale_remote::certs;
use fleetscale_store::{Server, ServerState, Store};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::lifecycle;
use crate::tasks::{self, Fanout};

/// Moves servers from `pending` through `creating` to `created` or `error`.
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    cancel: CancellationToken,
    timeout: Duration,
    fanout: Fanout,
}

impl Allocator {
    /// Create an allocator whose provider calls are bounded by `timeout`.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        cancel: CancellationToken,
        timeout: Duration,
        limit: usize,
    ) -> Self {
        Self {
            store,
            provider,
            cancel,
            timeout,
            fanout: Fanout::new("allocator", limit),
        }
    }

    /// Claim every `pending` server and start provisioning it.
    ///
    /// Returns the number of servers claimed. Provisioning continues in the
    /// background; see [`Allocator::fanout`].
    ///
    /// # Errors
    ///
    /// Returns an error if the servers cannot be listed or claimed. Servers
    /// claimed before the failure are still provisioned.
    pub fn allocate(&self) -> Result<usize> {
        let servers = self.store.list_state(ServerState::Pending)?;
        let mut claimed = 0;

        for mut server in servers {
            if !lifecycle::claim(self.store.as_ref(), &mut server, ServerState::Creating)? {
                continue;
            }
            tracing::debug!(server = %server.name, "Claimed server for provisioning");

            let this = self.clone();
            self.fanout
                .spawn(server.name.clone(), async move { this.provision(server).await });
            claimed += 1;
        }

        Ok(claimed)
    }

    /// In-flight provisioning tasks.
    #[must_use]
    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    async fn provision(&self, mut server: Server) {
        if self.cancel.is_cancelled() {
            tracing::debug!(server = %server.name, "Provisioning interrupted");
            return;
        }

        // A create that has been issued runs to completion so its instance is
        // recorded and can be destroyed later.
        let result = tasks::timed(self.timeout, self.create_instance(&server)).await;

        match result {
            Ok((instance, tls)) => {
                server.apply_instance(&instance);
                server.tls = Some(tls);
                server.started = Some(Utc::now());
                server.error = None;
                lifecycle::settle(self.store.as_ref(), &mut server, ServerState::Created);
                tracing::info!(
                    server = %server.name,
                    id = %instance.id,
                    address = %instance.address,
                    "Provisioned server"
                );
            }
            Err(e) => {
                tracing::error!(server = %server.name, error = %e, "Failed to provision server");
                server.error = Some(e.to_string());
                lifecycle::settle(self.store.as_ref(), &mut server, ServerState::Error);
            }
        }
    }

    async fn create_instance(&self, server: &Server) -> Result<(Instance, TlsMaterial)> {
        let tls = certs::generate(&server.name)?;
        let opts = CreateOpts {
            name: server.name.clone(),
            tls: tls.clone(),
        };
        let instance = self.provider.create(&opts).await?;
        Ok((instance, tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed, store};
    use fleetscale_provider::MockProvider;

    fn allocator(store: Arc<dyn Store>, provider: Arc<MockProvider>) -> Allocator {
        Allocator::new(
            store,
            provider,
            CancellationToken::new(),
            Duration::from_secs(60),
            0,
        )
    }

    #[tokio::test]
    async fn successful_create_fills_in_the_instance() {
        let (_dir, store) = store();
        let provider = Arc::new(MockProvider::new());
        provider.set_address("203.0.113.7");
        let server = seed(store.as_ref(), ServerState::Pending);

        let allocator = allocator(store.clone(), provider.clone());
        assert_eq!(allocator.allocate().unwrap(), 1);
        allocator.fanout().drain().await;

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Created);
        assert_eq!(stored.id.as_deref(), Some("mock-1"));
        assert_eq!(stored.address.as_deref(), Some("203.0.113.7"));
        assert_eq!(stored.image.as_deref(), Some("mock-image"));
        assert_eq!(stored.region.as_deref(), Some("mock-region"));
        assert_eq!(stored.size.as_deref(), Some("mock-size"));
        assert!(stored.started.is_some());
        assert!(stored.error.is_none());
        let tls = stored.tls.unwrap();
        assert!(tls.ca_cert.contains("BEGIN CERTIFICATE"));
        assert!(tls.tls_key.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn failed_create_records_the_error() {
        let (_dir, store) = store();
        let provider = Arc::new(MockProvider::new());
        provider.fail_create("quota exceeded");
        let server = seed(store.as_ref(), ServerState::Pending);

        let allocator = allocator(store.clone(), provider);
        allocator.allocate().unwrap();
        allocator.fanout().drain().await;

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Error);
        assert!(stored.error.unwrap().contains("quota exceeded"));
        assert!(stored.id.is_none());
    }

    #[tokio::test]
    async fn only_pending_servers_are_claimed() {
        let (_dir, store) = store();
        let provider = Arc::new(MockProvider::new());
        seed(store.as_ref(), ServerState::Running);
        seed(store.as_ref(), ServerState::Error);

        let allocator = allocator(store.clone(), provider.clone());
        assert_eq!(allocator.allocate().unwrap(), 0);
        allocator.fanout().drain().await;
        assert_eq!(provider.create_calls(), 0);
    }

    /// Fires the shutdown token the moment the machine has been booted.
    struct CancelAfterCreate {
        inner: MockProvider,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl Provider for CancelAfterCreate {
        fn kind(&self) -> fleetscale_core::ProviderKind {
            self.inner.kind()
        }

        async fn create(&self, opts: &CreateOpts) -> fleetscale_provider::Result<Instance> {
            let instance = self.inner.create(opts).await?;
            self.cancel.cancel();
            Ok(instance)
        }

        async fn destroy(&self, instance: &Instance) -> fleetscale_provider::Result<()> {
            self.inner.destroy(instance).await
        }

        async fn find(
            &self,
            name: &fleetscale_core::ServerName,
        ) -> fleetscale_provider::Result<Option<Instance>> {
            self.inner.find(name).await
        }
    }

    #[tokio::test]
    async fn shutdown_during_create_still_records_the_instance() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        let provider = Arc::new(CancelAfterCreate {
            inner: MockProvider::new(),
            cancel: cancel.clone(),
        });
        let server = seed(store.as_ref(), ServerState::Pending);

        let allocator = Allocator::new(
            store.clone(),
            provider.clone(),
            cancel.clone(),
            Duration::from_secs(60),
            0,
        );
        allocator.allocate().unwrap();
        allocator.fanout().drain().await;

        assert!(cancel.is_cancelled());
        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Created);
        assert_eq!(stored.id.as_deref(), Some("mock-1"));
        assert_eq!(provider.inner.instance_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_leaves_server_creating() {
        let (_dir, store) = store();
        let provider = Arc::new(MockProvider::new());
        let server = seed(store.as_ref(), ServerState::Pending);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let allocator = Allocator::new(store.clone(), provider, cancel, Duration::from_secs(60), 0);
        allocator.allocate().unwrap();
        allocator.fanout().drain().await;

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Creating);
    }
}
