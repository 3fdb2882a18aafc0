//! Per-key in-flight deduplication.
//!
//! The first caller for a key spawns the computation on the runtime and
//! stores a shared handle to it. Callers arriving while it runs await the
//! same handle and receive a clone of its output. The spawned driver keeps
//! the computation going when every caller has been cancelled.
//!
//! The table entry is removed as the computation finishes, before its
//! output becomes visible, so a caller arriving afterwards starts afresh.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Computation<V> = Shared<BoxFuture<'static, V>>;
type Slot<K> = (K, TypeId);
type Table<K> = Arc<Mutex<HashMap<Slot<K>, Flight>>>;

struct Flight {
    id: u64,
    computation: Box<dyn Any + Send + Sync>,
}

/// Deduplicates concurrent computations that share a key.
pub struct SingleFlight<K> {
    inflight: Table<K>,
    next_id: AtomicU64,
}

impl<K> SingleFlight<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Slot<K>, Flight>> {
        // The map stays consistent even if a holder panicked.
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of computations currently running.
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.table().keys().any(|(k, _)| k == key)
    }

    /// Run `op` unless a computation for `key` producing `V` is already
    /// running, in which case its result is awaited instead.
    ///
    /// A panic inside the computation is re-raised in every waiter.
    pub async fn execute<V, F, Fut>(&self, key: &K, op: F) -> V
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        self.join_or_start(key, op).await
    }

    fn join_or_start<V, F, Fut>(&self, key: &K, op: F) -> Computation<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let slot = (key.clone(), TypeId::of::<V>());
        let mut table = self.table();
        if let Some(running) = table
            .get(&slot)
            .and_then(|flight| flight.computation.downcast_ref::<Computation<V>>())
        {
            return running.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = || Ticket {
            table: Arc::clone(&self.inflight),
            slot: slot.clone(),
            id,
        };
        let finished = ticket();
        let work = op();
        let computation: Computation<V> = async move {
            let output = work.await;
            drop(finished);
            output
        }
        .boxed()
        .shared();
        table.insert(
            slot.clone(),
            Flight {
                id,
                computation: Box::new(computation.clone()),
            },
        );
        drop(table);

        // Backstop for a computation that panics.
        let abandoned = ticket();
        let driver = computation.clone();
        tokio::spawn(async move {
            let _abandoned = abandoned;
            driver.await;
        });
        computation
    }
}

impl<K> Default for SingleFlight<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its own table entry when dropped. A newer entry for the same
/// slot is left alone.
struct Ticket<K: Eq + Hash> {
    table: Table<K>,
    slot: Slot<K>,
    id: u64,
}

impl<K: Eq + Hash> Drop for Ticket<K> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(&self.slot).is_some_and(|flight| flight.id == self.id) {
            table.remove(&self.slot);
        }
    }
}
