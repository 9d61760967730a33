//! In-process key/value cache with per-entry time-to-live.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// TTL cache used for negative lookups.
#[derive(Default)]
pub struct TtlCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry; expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` under `key` for `ttl`.
    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        lock(&self.entries).insert(
            key.to_string(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every expired entry.
    pub fn purge(&self) {
        let now = Instant::now();
        lock(&self.entries).retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
