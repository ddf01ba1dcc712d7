use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ChronosError, Result};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    /// New value for `Put`, last value for `Delete` and `Expire`
    pub value: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory coordination store with TTL keys, atomic create and
/// compare-and-swap, and prefix watches.
///
/// All operations are linearizable: they run under one lock and publish
/// their watch events before releasing it. Expired keys are removed lazily by
/// the next operation and periodically by the reaper.
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a store and start its reaper.
    pub fn with_reaper(period: Duration) -> Arc<Self> {
        let store = Self::new();
        store.spawn_reaper(period);
        store
    }

    /// Periodically expire keys so watchers see `Expire` events without
    /// further traffic. Stops once the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.reap_expired();
            }
        });
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        debug!(available, "Store availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ChronosError::StoreUnavailable)
        }
    }

    fn publish(&self, key: &str, value: String, kind: EventKind) {
        // No subscribers is fine
        let _ = self.events.send(WatchEvent {
            key: key.to_string(),
            value,
            kind,
        });
    }

    fn expire_locked(&self, entries: &mut BTreeMap<String, Entry>) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = entries.remove(key) {
                debug!(key = %key, "Key expired");
                self.publish(key, entry.value, EventKind::Expire);
            }
        }
        expired.len()
    }

    pub fn reap_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries)
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }

    /// Create `key` only if it is absent. Returns whether it was created.
    pub fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries);

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::deadline(ttl),
            },
        );
        self.publish(key, value.to_string(), EventKind::Put);
        Ok(true)
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries);

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::deadline(ttl),
            },
        );
        self.publish(key, value.to_string(), EventKind::Put);
        Ok(())
    }

    /// Replace the value of `key` if it currently holds `expected`; the TTL
    /// starts over. Returns false when the key is absent or holds something else.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries);

        match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.value = value.to_string();
                entry.expires_at = Self::deadline(ttl);
                self.publish(key, value.to_string(), EventKind::Put);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete `key` if it currently holds `expected`.
    pub fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries);

        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                if let Some(entry) = entries.remove(key) {
                    self.publish(key, entry.value, EventKind::Delete);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries);
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    /// Delete `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries);

        match entries.remove(key) {
            Some(entry) => {
                self.publish(key, entry.value, EventKind::Delete);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every live key under `prefix`, in key order.
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries);

        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    /// Events for keys under `prefix` from now on.
    pub fn watch(&self, prefix: &str) -> StoreWatch {
        StoreWatch {
            prefix: prefix.to_string(),
            events: self.events.subscribe(),
        }
    }
}

pub struct StoreWatch {
    prefix: String,
    events: broadcast::Receiver<WatchEvent>,
}

impl StoreWatch {
    /// Next event under the prefix, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "Watch fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
