//! Suppression of duplicate concurrent work.

use futures::{
    future::{BoxFuture, Shared},
    FutureExt, TryFutureExt,
};
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, hash::Hash, sync::Arc};
use tokio::sync::oneshot::{self, error::RecvError};

/// A `tokio::sync::oneshot::Receiver` that can be awaited from many tasks.
type SharedReceiver<V> = Shared<BoxFuture<'static, Result<V, Arc<RecvError>>>>;

/// Coalesces concurrent executions of the same work, identified by key.
///
/// The first caller for a key becomes the leader: its future runs to
/// completion on the runtime (in a spawned task, so cancelling the caller
/// does not cancel the work) and every concurrent caller for the same key
/// receives a clone of the leader's result. The in-flight table entry is
/// removed before the result is broadcast, so a later call starts fresh
/// work.
pub struct SingleFlight<K, V> {
    inflight: Arc<Mutex<HashMap<K, SharedReceiver<V>>>>,
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty flight table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under the flight table entry for `key`.
    ///
    /// If an execution for `key` is already in flight, `work` is dropped and
    /// the in-flight result is awaited instead. `work` is never polled while
    /// the table lock is held.
    pub fn run<F>(&self, key: K, work: F) -> impl Future<Output = V>
    where
        F: Future<Output = V> + Send + 'static,
    {
        let receiver = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(receiver) => receiver.clone(),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let receiver: SharedReceiver<V> = rx.map_err(Arc::new).boxed().shared();

                    let table = Arc::clone(&self.inflight);
                    let key_captured = key.clone();
                    tokio::spawn(async move {
                        let value = work.await;
                        // Clear the entry first so waiters woken by the
                        // broadcast observe a table without it.
                        table.lock().remove(&key_captured);
                        // Receiver side may be gone; nobody left to care.
                        tx.send(value).ok();
                    });

                    inflight.insert(key, receiver.clone());
                    receiver
                }
            }
        };

        receiver.unwrap_or_else(|_| panic!("in-flight work panicked"))
    }

    /// Number of keys currently in flight.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inflight.lock().len()
    }
}
