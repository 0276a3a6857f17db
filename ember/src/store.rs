// src/store.rs
//! Credential store abstraction plus the semaphore-gated handle pool.
//!
//! The engine only needs two operations from a backing database: dump the
//! user table at startup and insert a new user. A real driver lives
//! outside the engine; `MemoryStore` is the in-process backend used by the
//! demo binary and the tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{EmberError, EmberResult};
use crate::sync::{lock_or_recover, Semaphore};

pub trait UserStore: Send {
    /// Full `(username, passwd)` dump used to seed the in-memory cache.
    fn load_users(&mut self) -> EmberResult<Vec<(String, String)>>;

    /// Insert a new user. `Ok(false)` means the name was already taken.
    fn insert_user(&mut self, username: &str, passwd: &str) -> EmberResult<bool>;
}

/// Hash-map store. Cloned instances built over the same shared map behave
/// like pooled connections to one database.
pub struct MemoryStore {
    users: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::shared(Arc::new(Mutex::new(HashMap::new())))
    }

    pub fn shared(users: Arc<Mutex<HashMap<String, String>>>) -> Self {
        Self { users }
    }

    pub fn with_users<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::shared(Arc::new(Mutex::new(entries.into_iter().collect())))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for MemoryStore {
    fn load_users(&mut self) -> EmberResult<Vec<(String, String)>> {
        let users = lock_or_recover(&self.users);
        Ok(users.iter().map(|(u, p)| (u.clone(), p.clone())).collect())
    }

    fn insert_user(&mut self, username: &str, passwd: &str) -> EmberResult<bool> {
        let mut users = lock_or_recover(&self.users);
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_string(), passwd.to_string());
        Ok(true)
    }
}

/// Pre-opened pool of store handles. A semaphore with initial value N
/// gates checkout; the free list itself is a mutex-guarded stack.
pub struct StorePool {
    free: Mutex<Vec<Box<dyn UserStore>>>,
    slots: Semaphore,
    size: usize,
}

impl StorePool {
    pub fn open<F>(size: usize, mut factory: F) -> EmberResult<Arc<Self>>
    where
        F: FnMut() -> EmberResult<Box<dyn UserStore>>,
    {
        if size == 0 {
            return Err(EmberError::Config(
                "store pool size must be positive".to_string(),
            ));
        }
        let mut free = Vec::with_capacity(size);
        for i in 0..size {
            let store = factory().map_err(|e| {
                EmberError::Store(format!("failed to open store handle {} of {}: {}", i + 1, size, e))
            })?;
            free.push(store);
        }
        Ok(Arc::new(Self {
            free: Mutex::new(free),
            slots: Semaphore::new(size),
            size,
        }))
    }

    /// Blocks until a handle is free, then checks it out. The guard
    /// returns the handle on drop.
    pub fn acquire(&self) -> StoreGuard<'_> {
        self.slots.wait();
        let store = lock_or_recover(&self.free)
            .pop()
            .expect("semaphore admitted a checkout with an empty free list");
        StoreGuard {
            pool: self,
            store: Some(store),
        }
    }

    fn release(&self, store: Box<dyn UserStore>) {
        lock_or_recover(&self.free).push(store);
        self.slots.post();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_count(&self) -> usize {
        lock_or_recover(&self.free).len()
    }
}

pub struct StoreGuard<'a> {
    pool: &'a StorePool,
    store: Option<Box<dyn UserStore>>,
}

impl StoreGuard<'_> {
    pub fn store(&mut self) -> &mut dyn UserStore {
        self.store
            .as_mut()
            .expect("store guard used after release")
            .as_mut()
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            self.pool.release(store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> Arc<StorePool> {
        StorePool::open(n, || Ok(Box::new(MemoryStore::new()) as Box<dyn UserStore>)).unwrap()
    }

    #[test]
    fn zero_size_pool_is_a_config_error() {
        let result = StorePool::open(0, || {
            Ok(Box::new(MemoryStore::new()) as Box<dyn UserStore>)
        });
        assert!(matches!(result, Err(EmberError::Config(_))));
    }

    #[test]
    fn failing_handle_open_is_a_store_error() {
        let result = StorePool::open(2, || {
            Err(EmberError::Config("backend unreachable".to_string()))
        });
        assert!(matches!(result, Err(EmberError::Store(_))));
    }

    #[test]
    fn guard_returns_handle_on_drop() {
        let pool = pool_of(2);
        assert_eq!(pool.free_count(), 2);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(pool.free_count(), 0);
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn checked_out_plus_free_is_constant() {
        let pool = pool_of(3);
        let a = pool.acquire();
        assert_eq!(pool.free_count() + 1, pool.size());
        let b = pool.acquire();
        assert_eq!(pool.free_count() + 2, pool.size());
        drop(a);
        drop(b);
        assert_eq!(pool.free_count(), pool.size());
    }

    #[test]
    fn memory_store_login_and_register() {
        let mut store = MemoryStore::with_users(vec![("a".to_string(), "b".to_string())]);
        let users: HashMap<_, _> = store.load_users().unwrap().into_iter().collect();
        assert_eq!(users.get("a").map(String::as_str), Some("b"));

        assert!(store.insert_user("new", "pw").unwrap());
        assert!(!store.insert_user("new", "other").unwrap());
    }

    #[test]
    fn shared_stores_see_each_other() {
        let map = Arc::new(Mutex::new(HashMap::new()));
        let mut first = MemoryStore::shared(Arc::clone(&map));
        let mut second = MemoryStore::shared(map);
        assert!(first.insert_user("u", "p").unwrap());
        assert!(!second.insert_user("u", "q").unwrap());
    }
}
