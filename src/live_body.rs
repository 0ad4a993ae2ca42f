//! Approval-waiting body registry: while a request is paused for
//! approval, its current (possibly `UPDATE-REQUEST`-mutated) body is held
//! here so the control surface can stream the live value instead of
//! waiting for the transaction to finish and land in the body store.
//! Grounded on `original_source/proxy/control.go`'s body-serving routes,
//! which consult the in-flight request table before falling back to
//! persisted storage.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct LiveBodies {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl LiveBodies {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, id: &str, body: Vec<u8>) {
        self.inner.write().await.insert(id.to_string(), body);
    }

    pub async fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn clear(&self, id: &str) {
        self.inner.write().await.remove(id);
    }
}
