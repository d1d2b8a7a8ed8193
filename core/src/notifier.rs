//! Listener registry with optional coalescing of notifications
//!
//! In coalescing mode [`Listeners::call`] only records the value in a pending
//! set; [`Listeners::flush`] takes the set atomically and delivers each
//! distinct value once to every listener. The owner decides when to flush,
//! normally from a periodic tick.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier returned by [`Listeners::add`], used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A set of callbacks notified with values of type `T`
pub struct Listeners<T> {
    callbacks: Mutex<Vec<(ListenerId, Callback<T>)>>,
    pending: Mutex<BTreeSet<T>>,
    coalesce: bool,
    next_id: AtomicU64,
}

impl<T: Ord + Clone> Listeners<T> {
    /// Listeners that are called synchronously from [`Listeners::call`]
    pub fn immediate() -> Self {
        Self::with_mode(false)
    }

    /// Listeners that are only called from [`Listeners::flush`]
    pub fn coalescing() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(coalesce: bool) -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            pending: Mutex::new(BTreeSet::new()),
            coalesce,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    /// Unregister a callback; returns whether it was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    /// Unregister every callback and drop pending values
    pub fn clear(&self) {
        self.callbacks.lock().clear();
        self.pending.lock().clear();
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Whether no callback is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notify listeners of `value`, now or at the next flush
    pub fn call(&self, value: T) {
        if self.coalesce {
            self.pending.lock().insert(value);
        } else {
            self.deliver(&value);
        }
    }

    /// Deliver pending values; returns how many distinct values were delivered
    pub fn flush(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        for value in &pending {
            self.deliver(value);
        }
        pending.len()
    }

    fn deliver(&self, value: &T) {
        // callbacks may register or call again, so never hold the lock while calling
        let callbacks: Vec<Callback<T>> =
            self.callbacks.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(value);
        }
    }
}

impl<T> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("callbacks", &self.callbacks.lock().len())
            .field("coalesce", &self.coalesce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct ValueAndCount {
        value: i32,
        count: usize,
    }

    fn recorder(listeners: &Listeners<i32>) -> (Arc<Mutex<ValueAndCount>>, ListenerId) {
        let seen = Arc::new(Mutex::new(ValueAndCount::default()));
        let seen2 = seen.clone();
        let id = listeners.add(move |v| {
            let mut s = seen2.lock();
            s.value = *v;
            s.count += 1;
        });
        (seen, id)
    }

    #[test]
    fn test_immediate_calls_every_time() {
        let listeners = Listeners::immediate();
        let (seen, id) = recorder(&listeners);
        for _ in 0..10 {
            listeners.call(123);
        }
        assert_eq!(seen.lock().value, 123);
        assert_eq!(seen.lock().count, 10);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.call(1);
        assert_eq!(seen.lock().count, 10);
    }

    #[test]
    fn test_coalescing_collapses_repeated_values() {
        let listeners = Listeners::coalescing();
        let (seen, _) = recorder(&listeners);

        for _ in 0..10 {
            listeners.call(123);
        }
        assert_eq!(seen.lock().count, 0);
        assert_eq!(listeners.flush(), 1);
        assert_eq!(seen.lock().value, 123);
        assert_eq!(seen.lock().count, 1);

        *seen.lock() = ValueAndCount::default();
        for v in [123, 123, 123, 456, 456, 456] {
            listeners.call(v);
        }
        assert_eq!(listeners.flush(), 2);
        assert_eq!(seen.lock().value, 456);
        assert_eq!(seen.lock().count, 2);
        assert_eq!(listeners.flush(), 0);
    }

    #[test]
    fn test_callback_may_call_again_during_flush() {
        let listeners = Arc::new(Listeners::coalescing());
        let inner = listeners.clone();
        listeners.add(move |v: &i32| {
            if *v < 3 {
                inner.call(v + 1);
            }
        });
        listeners.call(1);
        assert_eq!(listeners.flush(), 1);
        assert_eq!(listeners.flush(), 1);
        assert_eq!(listeners.flush(), 1);
        assert_eq!(listeners.flush(), 0);
    }
}
