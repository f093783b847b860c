//! Resource Pool
//!
//! A pool of expensive, reusable render contexts. Idle resources sit in a
//! lock-free bounded queue; acquisition never blocks and allocates on demand
//! when the queue is empty. A resource is owned by exactly one [`Pooled`]
//! handle at a time and goes back to the queue when the handle is released or
//! dropped. Resources that do not fit back in the queue are disposed.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::error::Error;

type Factory<T> = Box<dyn Fn() -> Result<T, Error> + Send + Sync>;
type Disposer<T> = Box<dyn Fn(T) + Send + Sync>;

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub disposed: u64,
    pub idle: usize,
}

pub struct Pool<T> {
    idle: ArrayQueue<T>,
    factory: Factory<T>,
    dispose: Option<Disposer<T>>,
    created: AtomicU64,
    reused: AtomicU64,
    disposed: AtomicU64,
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool keeping at most `capacity` idle resources.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> Result<T, Error> + Send + Sync + 'static,
    {
        Self {
            idle: ArrayQueue::new(capacity.max(1)),
            factory: Box::new(factory),
            dispose: None,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        }
    }

    /// Run `dispose` on every resource evicted from the pool.
    pub fn with_dispose<D>(mut self, dispose: D) -> Self
    where
        D: Fn(T) + Send + Sync + 'static,
    {
        self.dispose = Some(Box::new(dispose));
        self
    }

    /// Take an idle resource or build a new one.
    pub fn acquire(self: &Arc<Self>) -> Result<Pooled<T>, Error> {
        let value = match self.idle.pop() {
            Some(value) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                let value = (self.factory)()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                value
            }
        };

        Ok(Pooled {
            value: Some(value),
            pool: Arc::clone(self),
        })
    }

    /// Return a resource explicitly. Dropping the handle has the same effect.
    pub fn release(&self, mut handle: Pooled<T>) {
        if let Some(value) = handle.value.take() {
            self.put_back(value);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            idle: self.idle.len(),
        }
    }

    fn put_back(&self, value: T) {
        if let Err(evicted) = self.idle.push(value) {
            self.disposed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event = "pool_disposed", idle = self.idle.len());
            if let Some(dispose) = &self.dispose {
                dispose(evicted);
            }
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.idle.capacity())
            .field("idle", &self.idle.len())
            .finish()
    }
}

/// Exclusive handle to a pooled resource.
pub struct Pooled<T: Send + 'static> {
    value: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value is present until release")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value is present until release")
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put_back(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn counting_pool(capacity: usize) -> Arc<Pool<usize>> {
        let next = AtomicUsize::new(0);
        Arc::new(Pool::new(capacity, move || {
            Ok(next.fetch_add(1, Ordering::SeqCst))
        }))
    }

    #[test]
    fn test_allocates_on_demand_and_reuses() {
        let pool = counting_pool(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(*a, *b);
        let first = *a;
        pool.release(a);
        let c = pool.acquire().unwrap();
        assert_eq!(*c, first);
        drop(b);
        drop(c);
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.idle, 2);
    }

    #[test]
    fn test_overflow_is_disposed() {
        let disposed = Arc::new(Mutex::new(Vec::new()));
        let sink = disposed.clone();
        let next = AtomicUsize::new(0);
        let pool = Arc::new(
            Pool::new(1, move || Ok(next.fetch_add(1, Ordering::SeqCst)))
                .with_dispose(move |v| sink.lock().unwrap().push(v)),
        );

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);

        assert_eq!(*disposed.lock().unwrap(), vec![1]);
        assert_eq!(pool.stats().disposed, 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_factory_error_propagates() {
        let pool: Arc<Pool<u8>> = Arc::new(Pool::new(1, || Err(Error::bad_request("no"))));
        assert!(pool.acquire().is_err());
        assert_eq!(pool.stats().created, 0);
    }

    #[test]
    fn test_concurrent_holders_never_share() {
        let pool = counting_pool(2);
        let in_use = Mutex::new(HashSet::new());

        crossbeam::scope(|s| {
            for _ in 0..16 {
                s.spawn(|_| {
                    for _ in 0..50 {
                        let handle = pool.acquire().unwrap();
                        assert!(in_use.lock().unwrap().insert(*handle), "handle shared");
                        std::thread::sleep(Duration::from_micros(50));
                        assert!(in_use.lock().unwrap().remove(&*handle));
                        drop(handle);
                    }
                });
            }
        })
        .unwrap();

        assert!(in_use.lock().unwrap().is_empty());
    }
}
