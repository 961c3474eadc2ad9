//! Client for the CI server's build queue.
//!
//! The planner reads the queue once per cycle to count pending and running
//! stages that this pool could serve.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Queue status of a stage waiting for an agent.
pub const STATUS_PENDING: &str = "pending";

/// Queue status of a stage an agent is executing.
pub const STATUS_RUNNING: &str = "running";

/// One entry of the CI queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage {
    /// `pending`, `running`, or a terminal status.
    pub status: String,
    /// Required operating system.
    pub os: String,
    /// Required architecture.
    pub arch: String,
    /// Required kernel.
    pub kernel: String,
    /// Required OS variant.
    pub variant: String,
    /// Required agent labels.
    pub labels: HashMap<String, String>,
    /// Name of the agent executing the stage, once claimed.
    pub machine: String,
}

/// Trait for reading the CI queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Fetch every stage currently queued or executing.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Queue` if the CI server cannot be reached or
    /// answers with an error.
    async fn queue(&self) -> Result<Vec<Stage>>;
}

/// HTTP client for the CI server's `/api/queue` endpoint.
#[derive(Clone)]
pub struct HttpQueueClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpQueueClient {
    /// Create a new queue client.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, base_url, token))
    }

    /// Create a queue client with a custom reqwest client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Get the base URL of the CI server.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl std::fmt::Debug for HttpQueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQueueClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    async fn queue(&self) -> Result<Vec<Stage>> {
        let url = format!("{}/api/queue", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| EngineError::Queue(format!("queue request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = %status, url = %url, "CI server rejected queue request");
            return Err(EngineError::Queue(format!("CI server returned status {status}")));
        }

        response
            .json::<Vec<Stage>>()
            .await
            .map_err(|e| EngineError::Queue(format!("failed to parse queue: {e}")))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockQueue;

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use parking_lot::Mutex;

    use super::{async_trait, EngineError, QueueClient, Result, Stage};

    /// A queue whose contents are set by the test.
    #[derive(Default)]
    pub struct MockQueue {
        stages: Mutex<Vec<Stage>>,
        error: Mutex<Option<String>>,
    }

    impl MockQueue {
        /// Create an empty queue.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Replace the queue contents.
        pub fn set_stages(&self, stages: Vec<Stage>) {
            *self.stages.lock() = stages;
        }

        /// Make every read fail with the given message.
        pub fn fail(&self, message: impl Into<String>) {
            *self.error.lock() = Some(message.into());
        }
    }

    #[async_trait]
    impl QueueClient for MockQueue {
        async fn queue(&self) -> Result<Vec<Stage>> {
            if let Some(message) = self.error.lock().clone() {
                return Err(EngineError::Queue(message));
            }
            Ok(self.stages.lock().clone())
        }
    }
}
