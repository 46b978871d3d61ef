//! Atomically swappable writable-store handle
//!
//! Readers grab the current target; the controller swaps it on
//! promotion/demotion. The outgoing store is dropped once the last reader
//! releases its clone, so in-flight operations finish against the old
//! target and the next tick picks up the new one.

use std::sync::{Arc, RwLock};

use crate::KvStore;

/// Handle to the store all writes must go through
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<Arc<dyn KvStore>>>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Current writable store
    pub fn current(&self) -> Arc<dyn KvStore> {
        self.inner.read().unwrap().clone()
    }

    /// Rebind the handle onto a new writable store
    pub fn swap(&self, store: Arc<dyn KvStore>) {
        *self.inner.write().unwrap() = store;
    }
}
