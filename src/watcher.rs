//! The key watcher.
//!
//! Structured as a trampolined state machine the way `kube-runtime::watcher::step_trampolined` is
//! (`Empty` → `InitListed` → `Watching`, falling back to a full re-list on desync) — here,
//! Bootstrap → arm → steady state, falling back to Bootstrap again on history loss or after too
//! many consecutive transient errors. Backoff-on-error / reset-on-success follows
//! `kube-runtime::utils::stream_backoff::StreamBackoff`, but built on the `backoff` crate (already
//! used for retry policies in `kube-runtime::controller`) rather than a hand-rolled iterator, since
//! this loop needs the "give up and restart from scratch" behavior that `StreamBackoff`'s
//! "give up entirely" shape doesn't offer.
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoffBuilder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{GetResponse, KvStore};

/// After this many consecutive non-fatal errors in steady state, force a full re-bootstrap
/// instead of continuing to retry the same (possibly wedged) subscription.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Fallback delay used if the backoff policy is ever exhausted (it isn't, in practice, since it's
/// configured with no elapsed-time limit — this only guards against a future change to that
/// configuration silently making the loop spin).
const FALLBACK_BACKOFF: Duration = Duration::from_secs(30);

/// Spawn a watch for `key`. Never blocks the caller.
pub(crate) fn spawn(
    store: Arc<dyn KvStore>,
    key: String,
    retry: Duration,
    sink: mpsc::Sender<String>,
    shutdown: CancellationToken,
) {
    tokio::spawn(run(store, key, retry, sink, shutdown));
}

async fn run(
    store: Arc<dyn KvStore>,
    key: String,
    retry: Duration,
    sink: mpsc::Sender<String>,
    shutdown: CancellationToken,
) {
    let mut last_node_value: Option<String> = None;
    let mut emitted_any = false;

    'bootstrap: loop {
        let bootstrap = match bootstrap(store.as_ref(), &key, retry, &shutdown).await {
            Some(resp) => resp,
            None => return, // shutdown fired while waiting for the key to appear
        };

        if !deliver(&sink, &mut last_node_value, &mut emitted_any, bootstrap.value.clone(), &shutdown).await {
            return;
        }

        let mut sub = store.watch(&key, bootstrap.store_index);
        let mut backoff = ExponentialBackoffBuilder::new().with_max_elapsed_time(None).build();
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => return,

                event = sub.next() => match event {
                    Ok(event) => {
                        if event.value.is_empty() {
                            // The store's tombstone convention; not a real value.
                            tracing::debug!(%key, "skipping empty-string tombstone event");
                            continue;
                        }
                        backoff.reset();
                        consecutive_errors = 0;
                        if !deliver(&sink, &mut last_node_value, &mut emitted_any, event.value, &shutdown).await {
                            return;
                        }
                    }
                    Err(err) if err.is_cancelled() => {
                        tracing::debug!(%key, "watch cancelled");
                        return;
                    }
                    Err(err) if err.is_history_lost() => {
                        tracing::info!(%key, "watch history lost; re-bootstrapping");
                        continue 'bootstrap;
                    }
                    Err(err) => {
                        consecutive_errors += 1;
                        tracing::warn!(%key, error = %err, consecutive_errors, "watch error; backing off");
                        let delay = backoff.next_backoff().unwrap_or(FALLBACK_BACKOFF);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            () = shutdown.cancelled() => return,
                        }
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            tracing::info!(%key, "too many consecutive errors; forcing full re-bootstrap");
                            continue 'bootstrap;
                        }
                    }
                },
            }
        }
    }
}

/// Repeatedly read the current value of `key` until it exists or shutdown fires.
///
/// Polls the shutdown signal *before* the first attempt and *between* later ones, rather than
/// selecting it against the read itself, so a read already in flight is allowed to finish instead
/// of being torn down mid-call — while still guaranteeing no store operation is issued once
/// shutdown has already fired.
async fn bootstrap(
    store: &dyn KvStore,
    key: &str,
    retry: Duration,
    shutdown: &CancellationToken,
) -> Option<GetResponse> {
    loop {
        if shutdown.is_cancelled() {
            return None;
        }
        match store.get(key).await {
            Ok(resp) => return Some(resp),
            Err(err) if err.is_not_found() => {
                tracing::debug!(%key, "key not present yet, retrying bootstrap");
            }
            Err(err) => {
                tracing::debug!(%key, error = %err, "bootstrap read failed, retrying");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            () = shutdown.cancelled() => return None,
        }
    }
}

/// Apply duplicate suppression and, if the value survives it, send it on the sink. Returns
/// `false` if the watch should terminate (sink closed or shutdown fired).
async fn deliver(
    sink: &mpsc::Sender<String>,
    last_node_value: &mut Option<String>,
    emitted_any: &mut bool,
    value: String,
    shutdown: &CancellationToken,
) -> bool {
    let suppress = *emitted_any && last_node_value.as_deref() == Some(value.as_str());
    *last_node_value = Some(value.clone());
    if suppress {
        return true;
    }
    let delivered = tokio::select! {
        res = sink.send(value) => res.is_ok(),
        () = shutdown.cancelled() => false,
    };
    if delivered {
        *emitted_any = true;
    }
    delivered
}
