use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::{Backend, StoreConfig};
use crate::error::StoreError;
use crate::store::Store;

/// Builds a store for a backend from a list of endpoints.
pub type Initializer = Arc<
    dyn Fn(Vec<String>, Option<StoreConfig>) -> BoxFuture<'static, Result<Arc<dyn Store>, StoreError>>
        + Send
        + Sync,
>;

/// Maps backends to the initializers that were registered for them.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    initializers: HashMap<Backend, Initializer>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the initializer for `backend`.
    pub fn add_store(&mut self, backend: Backend, init: Initializer) {
        self.initializers.insert(backend, init);
    }

    pub fn is_registered(&self, backend: Backend) -> bool {
        self.initializers.contains_key(&backend)
    }

    /// Registered backends, sorted.
    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.initializers.keys().copied().collect();
        backends.sort();
        backends
    }

    /// Create a store for `backend`.
    pub async fn new_store(
        &self,
        backend: Backend,
        endpoints: Vec<String>,
        config: Option<StoreConfig>,
    ) -> Result<Arc<dyn Store>, StoreError> {
        match self.initializers.get(&backend) {
            Some(init) => init(endpoints, config).await,
            None => {
                let supported = self
                    .backends()
                    .iter()
                    .map(|b| b.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(StoreError::BackendNotSupported(supported))
            }
        }
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
