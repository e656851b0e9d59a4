use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{ProxError, Result};
use crate::routes::Route;

/// In-memory route store keyed by route name. Writers install new `Arc`d
/// values, readers receive snapshots; a stored route is never mutated.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new route. Fails with `AlreadyExists` if the name is taken.
    pub async fn create(&self, route: Arc<Route>) -> Result<()> {
        let mut routes = self.routes.write().await;
        if routes.contains_key(route.name()) {
            return Err(ProxError::AlreadyExists);
        }
        routes.insert(route.name().to_owned(), route);
        Ok(())
    }

    /// Replace a stored route. Fails with `NotFound` if the name is unknown.
    pub async fn update(&self, route: Arc<Route>) -> Result<()> {
        let mut routes = self.routes.write().await;
        if !routes.contains_key(route.name()) {
            return Err(ProxError::NotFound);
        }
        routes.insert(route.name().to_owned(), route);
        Ok(())
    }

    /// Remove a stored route by name. Fails with `NotFound` if absent.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut routes = self.routes.write().await;
        if routes.remove(name).is_none() {
            return Err(ProxError::NotFound);
        }
        Ok(())
    }

    /// Snapshot of all stored routes. Iteration order is unspecified.
    pub async fn list(&self) -> Vec<Arc<Route>> {
        let routes = self.routes.read().await;
        routes.values().cloned().collect()
    }
}
