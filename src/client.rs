//! Client lifecycle and shutdown.
//!
//! The shutdown signal is a [`tokio_util::sync::CancellationToken`] rather than a hand-rolled
//! broadcast primitive — it's already the "write-once, close-once, many selectable waiters" idiom,
//! and it's already a `kube-runtime` workspace dependency. An explicit `AtomicBool` still guards
//! the idempotent-close invariant directly (rather than relying on `CancellationToken::cancel`'s
//! own internal idempotency), so [`Client::close`] is a single, unambiguous compare-and-swap.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::dispatcher;
use crate::error::{Error, Result};
use crate::store::KvStore;
use crate::voter::VoterHandle;
use crate::watcher;

/// The minimum allowed lease term.
const MIN_TERM: Duration = Duration::from_secs(1);

/// Configuration for [`Client::new`].
///
/// `store` is required; `new` rejects construction with [`Error::Configuration`] if it's absent.
/// A non-optional constructor parameter would make this a compile-time property instead, but the
/// builder shape is kept because callers that assemble configuration dynamically (e.g. from a
/// plugin registry) need the runtime rejection path too.
#[derive(Default)]
pub struct ClientConfig {
    store: Option<Arc<dyn KvStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ClientConfig {
    /// Start building a configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the required KV store binding.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the clock used to judge lease remaining-time. Defaults to [`SystemClock`] if unset.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// A process-wide handle over one KV store binding.
pub struct Client {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    voter: Mutex<Option<VoterHandle>>,
}

impl Client {
    /// Construct a new client. Rejects construction with [`Error::Configuration`] when the KV
    /// store binding is absent.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let store = config
            .store
            .ok_or_else(|| Error::Configuration("KV store binding is required".to_string()))?;
        let clock = config.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(Self {
            store,
            clock,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            voter: Mutex::new(None),
        })
    }

    /// Idempotently shut down every long-lived task owned by this client.
    ///
    /// Never blocks on in-flight operations — it only signals. The single `compare_exchange` is
    /// the "at most once" gate: only the winner actually fires the cancellation token.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!("closing client");
            self.shutdown.cancel();
        }
    }

    /// Whether [`Client::close`] has already run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a sink that receives the current value of `key`, then every distinct subsequent
    /// value, until `close()`. Never blocks; spawns and returns.
    ///
    /// A no-op once the client is closed: no watcher task is spawned, and so no KV store
    /// operation is issued, matching the "no subsequent store operation after `close()`"
    /// invariant.
    pub fn add_watch(&self, key: impl Into<String>, retry: Duration, sink: mpsc::Sender<String>) {
        if self.is_closed() {
            return;
        }
        watcher::spawn(self.store.clone(), key.into(), retry, sink, self.shutdown.clone());
    }

    /// Register `callback(key, previous, new)` to be invoked on every distinct value, including
    /// the bootstrap value. Never blocks; spawns and returns.
    ///
    /// A no-op once the client is closed, for the same reason as [`Client::add_watch`].
    pub fn add_watch_callback<F>(&self, key: impl Into<String>, retry: Duration, callback: F)
    where
        F: Fn(&str, &str, &str) + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        dispatcher::spawn(self.store.clone(), key.into(), retry, callback, self.shutdown.clone());
    }

    /// Start (on first call) or re-enable (on later calls) voting for `key` with `value`, renewed
    /// under `term`.
    ///
    /// Idempotent across repeated calls with the *same* key/value/term. A later call with
    /// different arguments is rejected with [`Error::VoterAlreadyStarted`] rather than silently
    /// ignoring the new arguments, since acting on them would silently change what a running voter
    /// is contending for.
    pub async fn add_voter(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        term: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if term < MIN_TERM {
            return Err(Error::Configuration("term must be at least one second".to_string()));
        }
        let key = key.into();
        let value = value.into();

        let control_tx = {
            let mut slot = self.voter.lock();
            match slot.as_ref() {
                Some(handle) => {
                    if !handle.matches(&key, &value, term) {
                        return Err(Error::VoterAlreadyStarted);
                    }
                    handle.control_sender()
                }
                None => {
                    let handle = VoterHandle::spawn(
                        self.store.clone(),
                        self.clock.clone(),
                        key.clone(),
                        value.clone(),
                        term,
                        self.shutdown.clone(),
                    );
                    let control_tx = handle.control_sender();
                    *slot = Some(handle);
                    control_tx
                }
            }
        };

        tokio::select! {
            res = control_tx.send(true) => res.map_err(|_| Error::Closed),
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Disable voting without tearing down the loop. A no-op if no voter loop has ever been
    /// started.
    pub async fn remove_voter(&self, cancel: &CancellationToken) -> Result<()> {
        let control_tx = {
            let slot = self.voter.lock();
            slot.as_ref().map(VoterHandle::control_sender)
        };
        let Some(control_tx) = control_tx else {
            return Ok(());
        };
        tokio::select! {
            res = control_tx.send(false) => res.map_err(|_| Error::Closed),
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Transiently step down: the voter pauses for `term * 2` before resuming on its own. A no-op
    /// if no voter loop has ever been started.
    ///
    /// Non-blocking: a dropped pulse is preferred over blocking forever when the voter loop isn't
    /// running.
    pub fn step_down(&self) {
        let slot = self.voter.lock();
        if let Some(handle) = slot.as_ref() {
            handle.step_down();
        }
    }
}
