//! Keyed de-duplication of concurrent async work.
//!
//! The first caller for a key starts the work; everyone arriving while it
//! runs awaits the same shared future. The entry is cleared as soon as the
//! work settles, whether it succeeded or failed, so a later call starts
//! fresh.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};

pub struct InFlight<K, V> {
    pending: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Default for InFlight<K, V> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start()` for `key` unless the same key is already running, in
    /// which case wait for that run's result instead.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending
                .entry(key.clone())
                .or_insert_with(|| start().boxed().shared())
                .clone()
        };

        let value = shared.clone().await;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.get(&key).is_some_and(|current| current.ptr_eq(&shared)) {
            pending.remove(&key);
        }
        value
    }

    /// Number of keys currently running.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
