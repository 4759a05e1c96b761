//! Named transport clients and explicit client handles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::client::{HttpClient, HttpClientBuilder};
use crate::error::Result;

/// Name used for the default client.
pub const DEFAULT_CLIENT_NAME: &str = "default";

/// A transport client plus an optional action run once after dispatch.
pub struct ClientHandle {
    client: HttpClient,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ClientHandle {
    /// Wrap a client with nothing to release.
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            release: None,
        }
    }

    /// Wrap a client with a release action.
    pub fn with_release<F>(client: HttpClient, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            client,
            release: Some(Box::new(release)),
        }
    }

    /// The client.
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Run the release action, if any.
    pub(crate) fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("client", &self.client)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// Supplies a client for one request; `None` is a configuration error.
pub type ClientProvider = Arc<dyn Fn() -> Option<ClientHandle> + Send + Sync>;

/// Source of named transport clients.
///
/// Builders are registered by name. A request that opts into pooling reuses
/// one cached client per name; otherwise a fresh client is built for the call
/// and dropped afterwards.
pub struct HttpClientPool {
    user_agent: String,
    builders: RwLock<HashMap<String, HttpClientBuilder>>,
    clients: Mutex<HashMap<String, HttpClient>>,
}

impl HttpClientPool {
    /// Create a pool that applies `user_agent` to clients lacking one.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            builders: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register the builder for a named client, replacing any cached client.
    pub fn register(&self, name: impl Into<String>, builder: HttpClientBuilder) {
        let name = name.into();
        self.clients.lock().remove(&name);
        self.builders.write().insert(name, builder);
    }

    /// Register the builder for the default client.
    pub fn register_default(&self, builder: HttpClientBuilder) {
        self.register(DEFAULT_CLIENT_NAME, builder);
    }

    /// Get the client for `name` (or the default client).
    ///
    /// Unregistered names are built from the default builder.
    pub fn get_or_create(&self, name: Option<&str>, pooled: bool) -> Result<HttpClient> {
        let name = name.unwrap_or(DEFAULT_CLIENT_NAME);

        if pooled && let Some(client) = self.clients.lock().get(name) {
            return Ok(client.clone());
        }

        let client = self.create(name)?;
        if pooled {
            // Another dispatch may have raced us; keep whichever landed first.
            let mut clients = self.clients.lock();
            let cached = clients.entry(name.to_string()).or_insert(client);
            return Ok(cached.clone());
        }
        Ok(client)
    }

    /// Drop the cached client for `name`.
    ///
    /// Returns `true` if a client was cached.
    pub fn release(&self, name: Option<&str>) -> bool {
        self.clients
            .lock()
            .remove(name.unwrap_or(DEFAULT_CLIENT_NAME))
            .is_some()
    }

    /// Number of cached clients.
    pub fn cached_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn create(&self, name: &str) -> Result<HttpClient> {
        let builder = {
            let builders = self.builders.read();
            builders
                .get(name)
                .or_else(|| builders.get(DEFAULT_CLIENT_NAME))
                .cloned()
                .unwrap_or_default()
        };

        let builder = if builder.config().user_agent.is_none() {
            builder.user_agent(self.user_agent.clone())
        } else {
            builder
        };

        tracing::debug!(target: "horizon_lattice_remote::pool", client = name, "Creating client");
        builder.build()
    }
}

impl std::fmt::Debug for HttpClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientPool")
            .field("registered", &self.builders.read().len())
            .field("cached", &self.cached_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_pooled_clients_are_reused() {
        let pool = HttpClientPool::new("Tests/1.0");
        let a = pool.get_or_create(None, true).unwrap();
        let b = pool.get_or_create(None, true).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(pool.cached_count(), 1);
        assert!(pool.release(None));
        assert_eq!(pool.cached_count(), 0);
    }

    #[test]
    fn test_unpooled_clients_are_fresh() {
        let pool = HttpClientPool::new("Tests/1.0");
        let a = pool.get_or_create(None, false).unwrap();
        let b = pool.get_or_create(None, false).unwrap();
        assert!(!a.ptr_eq(&b));
        assert_eq!(pool.cached_count(), 0);
    }

    #[test]
    fn test_default_user_agent_applied_once() {
        let pool = HttpClientPool::new("Tests/1.0");
        pool.register("custom", HttpClientBuilder::new().user_agent("Custom/2.0"));
        let default = pool.get_or_create(None, false).unwrap();
        let custom = pool.get_or_create(Some("custom"), false).unwrap();
        assert_eq!(default.config().user_agent.as_deref(), Some("Tests/1.0"));
        assert_eq!(custom.config().user_agent.as_deref(), Some("Custom/2.0"));
    }

    #[test]
    fn test_named_builder() {
        let pool = HttpClientPool::new("Tests/1.0");
        pool.register("slow", HttpClientBuilder::new().timeout(Duration::from_secs(5)));
        let client = pool.get_or_create(Some("slow"), false).unwrap();
        assert_eq!(client.config().timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_handle_release_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let client = HttpClient::builder().build().unwrap();
        let handle = ClientHandle::with_release(client, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
