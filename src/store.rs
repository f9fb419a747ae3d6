//! The external KV store binding.
//!
//! This module only defines the trait boundary the Voter and Watcher are built against — a
//! concrete production binding (etcd, Consul, Zookeeper, ...) lives outside this crate, the way
//! `kube_client::Api<K>` lives outside `kube-runtime` and is merely consumed by it. The store is
//! assumed strongly consistent, to offer compare-and-swap writes with optional TTL, and to expose
//! index-ordered change notifications.
//!
//! An empty-string value is the store's tombstone convention: callers of [`KvStore::watch`]
//! silently skip it rather than treating it as a real value.
use std::time::Instant;

use crate::error::StoreError;

/// The response to a successful [`KvStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    /// The value currently stored at the key.
    pub value: String,
    /// The key's own modified-index: bumped on every write to this specific key.
    pub mod_index: u64,
    /// The store-wide index at the moment this value was observed — the recommended anchor for a
    /// subsequent [`KvStore::watch`] call, since it postdates the read and so cannot itself be
    /// replayed.
    pub store_index: u64,
    /// The absolute expiry of this key's lease, if any.
    pub expires_at: Option<Instant>,
}

/// A single change delivered by a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// The new value. The empty string is the tombstone convention.
    pub value: String,
    /// The value immediately prior to this change, if the key existed before it.
    pub prev_value: Option<String>,
    /// The key's modified-index as of this change.
    pub mod_index: u64,
}

/// The compare-and-swap precondition for [`KvStore::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetCondition {
    /// Succeed only if the key does not currently exist.
    PrevAbsent,
    /// Succeed only if the key's current value and modified-index both match exactly.
    Prev { value: String, mod_index: u64 },
}

/// Options for [`KvStore::set`].
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Lease duration. Never less than one second.
    pub ttl: std::time::Duration,
    /// The compare-and-swap precondition the write must satisfy.
    pub condition: SetCondition,
}

/// The strongly-consistent KV store this crate is layered over.
///
/// Implementations must be safe for concurrent use: the Voter and every registered Watcher hold
/// the same `Arc<dyn KvStore>` and call into it from independent tasks.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Read the current value of `key`.
    ///
    /// Returns `Err` with [`StoreError::is_not_found`] true when the key does not exist — this is
    /// not itself a failure the caller should log as an error.
    async fn get(&self, key: &str) -> Result<GetResponse, StoreError>;

    /// Conditionally write `value` to `key`, subject to `opts.condition` and bound to `opts.ttl`.
    ///
    /// Returns `Err` with [`StoreError::is_cas_conflict`] true when the precondition does not
    /// hold — this is an ordinary "lost this round" outcome, not an error to log.
    async fn set(&self, key: &str, value: String, opts: SetOptions) -> Result<(), StoreError>;

    /// Open a change subscription on `key`, starting immediately after the store-wide index
    /// `after_index` (i.e. the first event delivered, if any, has a store-wide index strictly
    /// greater than `after_index`).
    fn watch(&self, key: &str, after_index: u64) -> Box<dyn Subscription>;
}

/// An open change subscription returned by [`KvStore::watch`].
#[async_trait::async_trait]
pub trait Subscription: Send {
    /// Await the next change.
    ///
    /// Returns `Err` with [`StoreError::is_history_lost`] true when the store can no longer
    /// replay from the requested index, and `Err` with [`StoreError::is_cancelled`] true when the
    /// subscription was torn down from underneath the caller.
    async fn next(&mut self) -> Result<WatchEvent, StoreError>;
}

/// An in-memory [`KvStore`] test double with real CAS/TTL/index-history semantics.
///
/// Not a distributed store — it exists so the Voter, Watcher, and Client test suites can drive
/// real election and recovery behavior deterministically (paired with `tokio::time::pause`)
/// without standing up an external process, the way `kube-runtime::reflector::test_utils`
/// hand-rolls a minimal test double rather than reaching for a mocking framework.
pub mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use tokio::sync::broadcast;

    use super::{GetResponse, KvStore, SetCondition, SetOptions, Subscription, WatchEvent};
    use crate::error::StoreError;

    /// How many past change events the store retains for watch replay before a watcher that
    /// falls behind observes a "history lost" error.
    const HISTORY_CAPACITY: usize = 64;

    #[derive(Clone)]
    struct Record {
        value: String,
        mod_index: u64,
        expires_at: Option<Instant>,
    }

    #[derive(Clone)]
    struct HistoryEntry {
        store_index: u64,
        key: String,
        value: String,
        prev_value: Option<String>,
        mod_index: u64,
    }

    struct Inner {
        entries: HashMap<String, Record>,
        history: VecDeque<HistoryEntry>,
        next_store_index: u64,
        events: broadcast::Sender<HistoryEntry>,
    }

    impl Inner {
        fn push_history(
            &mut self,
            key: &str,
            value: String,
            prev_value: Option<String>,
            mod_index: u64,
        ) {
            let store_index = self.next_store_index;
            self.next_store_index += 1;
            let entry = HistoryEntry {
                store_index,
                key: key.to_string(),
                value,
                prev_value,
                mod_index,
            };
            self.history.push_back(entry.clone());
            if self.history.len() > HISTORY_CAPACITY {
                self.history.pop_front();
            }
            // No active subscriber is not an error: the entry stays in `history` for late joiners.
            let _ = self.events.send(entry);
        }

        fn expire_if_due(&mut self, key: &str) {
            let due = matches!(
                self.entries.get(key),
                Some(rec) if rec.expires_at.is_some_and(|at| at <= Instant::now())
            );
            if due {
                let rec = self.entries.remove(key).expect("checked above");
                self.push_history(key, String::new(), Some(rec.value), rec.mod_index + 1);
            }
        }
    }

    /// An in-memory [`KvStore`]. See the module documentation.
    #[derive(Clone)]
    pub struct MemoryStore {
        inner: Arc<Mutex<Inner>>,
    }

    impl Default for MemoryStore {
        fn default() -> Self {
            let (events, _) = broadcast::channel(256);
            Self {
                inner: Arc::new(Mutex::new(Inner {
                    entries: HashMap::new(),
                    history: VecDeque::new(),
                    next_store_index: 1,
                    events,
                })),
            }
        }
    }

    impl MemoryStore {
        /// A fresh, empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Force a key's lease to have already expired, without waiting out the real TTL.
        ///
        /// Useful for exercising takeover/step-down scenarios under `tokio::time::pause` without
        /// also having to advance the clock past the TTL.
        pub fn expire_now(&self, key: &str) {
            let mut inner = self.inner.lock();
            if let Some(rec) = inner.entries.get_mut(key) {
                rec.expires_at = Some(Instant::now() - Duration::from_millis(1));
            }
        }
    }

    #[async_trait::async_trait]
    impl KvStore for MemoryStore {
        async fn get(&self, key: &str) -> Result<GetResponse, StoreError> {
            let mut inner = self.inner.lock();
            inner.expire_if_due(key);
            let store_index = inner.next_store_index.saturating_sub(1);
            match inner.entries.get(key) {
                Some(rec) => Ok(GetResponse {
                    value: rec.value.clone(),
                    mod_index: rec.mod_index,
                    store_index,
                    expires_at: rec.expires_at,
                }),
                None => Err(StoreError::not_found(key)),
            }
        }

        async fn set(&self, key: &str, value: String, opts: SetOptions) -> Result<(), StoreError> {
            let mut inner = self.inner.lock();
            inner.expire_if_due(key);

            let current = inner.entries.get(key).cloned();
            match (&opts.condition, &current) {
                (SetCondition::PrevAbsent, Some(_)) => return Err(StoreError::cas_conflict(key)),
                (SetCondition::PrevAbsent, None) => {}
                (SetCondition::Prev { .. }, None) => return Err(StoreError::cas_conflict(key)),
                (SetCondition::Prev { value: want_value, mod_index: want_index }, Some(rec)) => {
                    if &rec.value != want_value || rec.mod_index != *want_index {
                        return Err(StoreError::cas_conflict(key));
                    }
                }
            }

            let prev_value = current.as_ref().map(|rec| rec.value.clone());
            let mod_index = current.as_ref().map_or(1, |rec| rec.mod_index + 1);
            let expires_at = Some(Instant::now() + opts.ttl);
            inner.entries.insert(
                key.to_string(),
                Record { value: value.clone(), mod_index, expires_at },
            );
            inner.push_history(key, value, prev_value, mod_index);
            Ok(())
        }

        fn watch(&self, key: &str, after_index: u64) -> Box<dyn Subscription> {
            let (oldest_retained, receiver) = {
                let inner = self.inner.lock();
                (inner.history.front().map(|e| e.store_index), inner.events.subscribe())
            };
            Box::new(MemorySubscription {
                store: self.clone(),
                key: key.to_string(),
                after_index,
                oldest_retained_at_subscribe: oldest_retained,
                pending: VecDeque::new(),
                checked_backlog: false,
                receiver,
            })
        }
    }

    struct MemorySubscription {
        store: MemoryStore,
        key: String,
        after_index: u64,
        oldest_retained_at_subscribe: Option<u64>,
        pending: VecDeque<HistoryEntry>,
        checked_backlog: bool,
        receiver: broadcast::Receiver<HistoryEntry>,
    }

    #[async_trait::async_trait]
    impl Subscription for MemorySubscription {
        async fn next(&mut self) -> Result<WatchEvent, StoreError> {
            if !self.checked_backlog {
                self.checked_backlog = true;
                if let Some(oldest) = self.oldest_retained_at_subscribe {
                    if self.after_index + 1 < oldest {
                        return Err(StoreError::history_lost(&self.key));
                    }
                }
                let inner = self.store.inner.lock();
                self.pending = inner
                    .history
                    .iter()
                    .filter(|e| e.key == self.key && e.store_index > self.after_index)
                    .cloned()
                    .collect();
            }
            if let Some(entry) = self.pending.pop_front() {
                self.after_index = entry.store_index;
                return Ok(WatchEvent {
                    value: entry.value,
                    prev_value: entry.prev_value,
                    mod_index: entry.mod_index,
                });
            }
            loop {
                match self.receiver.recv().await {
                    Ok(entry) if entry.store_index <= self.after_index => continue,
                    Ok(entry) if entry.key != self.key => {
                        self.after_index = entry.store_index;
                    }
                    Ok(entry) => {
                        self.after_index = entry.store_index;
                        return Ok(WatchEvent {
                            value: entry.value,
                            prev_value: entry.prev_value,
                            mod_index: entry.mod_index,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Err(StoreError::history_lost(&self.key))
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StoreError::cancelled())
                    }
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn replays_buffered_history_before_falling_back_to_live_events() {
            let store = MemoryStore::new();
            store
                .set("/k", "a".to_string(), SetOptions { ttl: Duration::from_secs(5), condition: SetCondition::PrevAbsent })
                .await
                .unwrap();
            store
                .set(
                    "/k",
                    "b".to_string(),
                    SetOptions { ttl: Duration::from_secs(5), condition: SetCondition::Prev { value: "a".to_string(), mod_index: 1 } },
                )
                .await
                .unwrap();
            store
                .set(
                    "/k",
                    "c".to_string(),
                    SetOptions { ttl: Duration::from_secs(5), condition: SetCondition::Prev { value: "b".to_string(), mod_index: 2 } },
                )
                .await
                .unwrap();

            let mut sub = store.watch("/k", 0);
            assert_eq!(sub.next().await.unwrap().value, "a");
            assert_eq!(sub.next().await.unwrap().value, "b");
            assert_eq!(sub.next().await.unwrap().value, "c");
        }

        #[tokio::test]
        async fn reports_history_lost_when_the_anchor_predates_the_retained_window() {
            let store = MemoryStore::new();
            store
                .set("/k", "v0".to_string(), SetOptions { ttl: Duration::from_secs(30), condition: SetCondition::PrevAbsent })
                .await
                .unwrap();
            for i in 0..(HISTORY_CAPACITY + 10) {
                let prev = if i == 0 { "v0".to_string() } else { format!("v{i}") };
                store
                    .set(
                        "/k",
                        format!("v{}", i + 1),
                        SetOptions {
                            ttl: Duration::from_secs(30),
                            condition: SetCondition::Prev { value: prev, mod_index: (i + 1) as u64 },
                        },
                    )
                    .await
                    .unwrap();
            }

            // Anchored at the very first write, long since rotated out of the retained window.
            let mut sub = store.watch("/k", 1);
            let err = sub.next().await.unwrap_err();
            assert!(err.is_history_lost());
        }

        #[tokio::test]
        async fn expires_a_lease_once_its_ttl_elapses() {
            let store = MemoryStore::new();
            store
                .set("/lease", "a".to_string(), SetOptions { ttl: Duration::from_millis(10), condition: SetCondition::PrevAbsent })
                .await
                .unwrap();
            store.expire_now("/lease");
            let err = store.get("/lease").await.unwrap_err();
            assert!(err.is_not_found());
        }
    }
}
