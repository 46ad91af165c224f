use once_cell::sync::Lazy;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-key cache with per-entry TTL, shared by every upstream source.
///
/// Entries are immutable once stored and expiry is absolute, so a single
/// process-wide instance is safe under concurrent access. Concurrent misses
/// on the same key may invoke the fill function more than once; the contract
/// is eventual consistency, not single-flight.
pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    /// `None` means the entry never expires.
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

static DISABLED: AtomicBool = AtomicBool::new(false);
static SHARED: Lazy<Cache> = Lazy::new(Cache::new);

/// The process-wide cache instance.
pub fn shared() -> &'static Cache {
    &SHARED
}

/// Process-wide kill switch: when set, `get_or_set` always calls the fill
/// function and nothing is memoized.
pub fn set_disabled(disabled: bool) {
    DISABLED.store(disabled, Ordering::Relaxed);
}

pub fn disabled() -> bool {
    DISABLED.load(Ordering::Relaxed)
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value, evicting it lazily if its TTL elapsed.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let expired = entries
            .get(key)
            .map(|entry| entry.expired(Instant::now()))?;
        if expired {
            entries.remove(key);
            return None;
        }
        entries
            .get(key)
            .and_then(|entry| Arc::clone(&entry.value).downcast::<T>().ok())
    }

    pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T, ttl: Option<Duration>) {
        self.set_arc(key, Arc::new(value), ttl);
    }

    fn set_arc<T: Send + Sync + 'static>(&self, key: &str, value: Arc<T>, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .insert(key.to_string(), entry);
    }

    /// Returns the cached value or memoizes the result of `fill`.
    ///
    /// `fill` runs outside the map lock and its result is stored only when
    /// it is `Some`; a `None` result is returned but never cached.
    pub fn get_or_set<T, F>(&self, key: &str, ttl: Option<Duration>, fill: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Option<T>,
    {
        if disabled() {
            return fill().map(Arc::new);
        }
        if let Some(hit) = self.get::<T>(key) {
            return Some(hit);
        }
        let value = Arc::new(fill()?);
        self.set_arc(key, Arc::clone(&value), ttl);
        Some(value)
    }

    pub fn delete(&self, key: &str) {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache mutex poisoned").clear();
    }
}

impl Default for Cache {
    fn default() -> Self {
        Cache::new()
    }
}
