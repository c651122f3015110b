//! Client context: the shared entry point for sessions, tables and
//! scanners.
//!
//! One client per process is the common shape. Clients are sandboxed
//! from each other (no shared state), and a client never batches writes
//! from different sessions into the same request, so latency-sensitive
//! and throughput-oriented traffic can safely share one client through
//! separate sessions.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{ClientError, Result};
use crate::location::Locator;
use crate::session::Session;
use crate::table::Table;
use crate::transport::Transport;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ERROR_BUFFER_CAPACITY: usize = 1000;

pub(crate) struct ClientInner {
    pub(crate) locator: Arc<dyn Locator>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) default_timeout: Duration,
    pub(crate) error_buffer_capacity: usize,
}

/// Builds a [`Client`]. Setters accumulate; validation failures are
/// deferred and [`ClientBuilder::build`] reports the first one.
pub struct ClientBuilder {
    locator: Option<Arc<dyn Locator>>,
    transport: Option<Arc<dyn Transport>>,
    default_timeout: Duration,
    error_buffer_capacity: usize,
    first_error: Option<ClientError>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            locator: None,
            transport: None,
            default_timeout: DEFAULT_TIMEOUT,
            error_buffer_capacity: DEFAULT_ERROR_BUFFER_CAPACITY,
            first_error: None,
        }
    }

    /// Location service resolving tables and keys to tablets. Required.
    pub fn locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Transport delivering requests to replicas. Required.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Default per-request deadline for sessions and scanners.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            self.record_error(ClientError::InvalidArgument(
                "default timeout must be non-zero".into(),
            ));
        } else {
            self.default_timeout = timeout;
        }
        self
    }

    /// Capacity of each session's error collector. Fixed per session at
    /// creation.
    pub fn error_buffer_capacity(mut self, capacity: usize) -> Self {
        if capacity == 0 {
            self.record_error(ClientError::InvalidArgument(
                "error buffer capacity must be non-zero".into(),
            ));
        } else {
            self.error_buffer_capacity = capacity;
        }
        self
    }

    /// Create the client, or report the first configuration error.
    pub fn build(self) -> Result<Client> {
        if let Some(err) = self.first_error {
            return Err(err);
        }
        let locator = self
            .locator
            .ok_or_else(|| ClientError::InvalidArgument("locator is required".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| ClientError::InvalidArgument("transport is required".into()))?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                locator,
                transport,
                default_timeout: self.default_timeout,
                error_buffer_capacity: self.error_buffer_capacity,
            }),
        })
    }

    fn record_error(&mut self, err: ClientError) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, thread-safe cluster handle. Sessions, tables and scanners all
/// hold a reference to it; the client holds none back, so dropping the
/// handles releases everything.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("default_timeout", &self.inner.default_timeout)
            .field("error_buffer_capacity", &self.inner.error_buffer_capacity)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Create a session. A fully local operation: no RPCs, no blocking.
    pub fn new_session(&self) -> Session {
        Session::new(Arc::clone(&self.inner))
    }

    /// Open a table, fetching its schema from the cluster metadata.
    pub async fn open_table(&self, name: &str) -> Result<Table> {
        let schema = self.inner.locator.table_schema(name).await?;
        debug!(table = name, columns = schema.columns().len(), "opened table");
        Ok(Table::new(
            Arc::from(name),
            Arc::new(schema),
            Arc::clone(&self.inner),
        ))
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemCluster;

    #[test]
    fn builder_requires_locator_and_transport() {
        let err = ClientBuilder::new().build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let cluster = Arc::new(MemCluster::new(1));
        let err = ClientBuilder::new()
            .locator(cluster.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        assert!(ClientBuilder::new()
            .locator(cluster.clone())
            .transport(cluster)
            .build()
            .is_ok());
    }

    #[test]
    fn builder_reports_the_first_validation_error() {
        let cluster = Arc::new(MemCluster::new(1));
        let err = ClientBuilder::new()
            .locator(cluster.clone())
            .transport(cluster)
            .default_timeout(Duration::ZERO)
            .error_buffer_capacity(0)
            .build()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("timeout"), "got: {message}");
    }
}
