//! The election voter.
//!
//! Modeled on `kube-runtime::coordination::LeaderElector`: a single spawned task driven by
//! `tokio::select!` over a ticker, a control channel, a pause channel, and the client's shutdown
//! token, logging lifecycle edges at `info` and per-attempt detail at `debug`/`warn` the way
//! `coordination.rs`'s `run()` does.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{KvStore, SetCondition, SetOptions};

/// A handle to the spawned voter task, held by [`crate::Client`] behind its one-shot latch.
///
/// Control/pause sends use a bounded channel of capacity 1 — the closest practical tokio
/// equivalent of an unbuffered handshake channel, since `tokio::sync::mpsc` has no true
/// zero-capacity variant.
pub(crate) struct VoterHandle {
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) term: Duration,
    control_tx: mpsc::Sender<bool>,
    pause_tx: mpsc::Sender<()>,
}

impl VoterHandle {
    /// Spawn the voter loop and return a handle to it. Performs no election attempt itself — that
    /// happens inside [`run`] before the loop's first `select!`.
    pub(crate) fn spawn(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        key: String,
        value: String,
        term: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(1);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let task_key = key.clone();
        let task_value = value.clone();
        tokio::spawn(run(store, clock, task_key, task_value, term, shutdown, control_rx, pause_rx));
        Self { key, value, term, control_tx, pause_tx }
    }

    /// Whether a later `AddVoter` call agrees with the triple this loop was started with.
    pub(crate) fn matches(&self, key: &str, value: &str, term: Duration) -> bool {
        self.key == key && self.value == value && self.term == term
    }

    /// A clone of the control sender, for sending `true`/`false` pulses without holding the
    /// client's voter-slot lock across an `.await` (the lock is a `parking_lot::Mutex`, which is
    /// not designed to be held across suspension points).
    pub(crate) fn control_sender(&self) -> mpsc::Sender<bool> {
        self.control_tx.clone()
    }

    /// Non-blocking: silently dropped if the voter loop isn't reading. Stepping down is advisory,
    /// not a handshake a caller should ever have to wait on.
    pub(crate) fn step_down(&self) {
        let _ = self.pause_tx.try_send(());
    }
}

/// One election attempt for `key`/`value`/`term`.
pub(crate) async fn elect(
    store: &dyn KvStore,
    clock: &dyn Clock,
    key: &str,
    value: &str,
    term: Duration,
) -> Result<(), StoreError> {
    match store.get(key).await {
        Err(err) if err.is_not_found() => {
            let opts = SetOptions { ttl: term, condition: SetCondition::PrevAbsent };
            match store.set(key, value.to_string(), opts).await {
                Ok(()) => Ok(()),
                // Another participant won this round; not an error.
                Err(err) if err.is_cas_conflict() => Ok(()),
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
        Ok(current) => {
            if current.value != value {
                // Another participant is leader. Nothing to do.
                return Ok(());
            }
            if let Some(expires_at) = current.expires_at {
                let remaining = expires_at.saturating_duration_since(clock.now());
                if remaining > term / 2 {
                    // Lease still healthy; avoid an unnecessary write.
                    return Ok(());
                }
            }
            let opts = SetOptions {
                ttl: term,
                condition: SetCondition::Prev { value: value.to_string(), mod_index: current.mod_index },
            };
            store.set(key, value.to_string(), opts).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    key: String,
    value: String,
    term: Duration,
    shutdown: CancellationToken,
    mut control_rx: mpsc::Receiver<bool>,
    mut pause_rx: mpsc::Receiver<()>,
) {
    tracing::info!(%key, ?term, "voter loop started");

    // One attempt before entering the select, so a freshly-created voter doesn't wait a full
    // tick for its first attempt.
    if let Err(err) = elect(store.as_ref(), clock.as_ref(), &key, &value, term).await {
        tracing::warn!(%key, error = %err, "election attempt failed");
    }

    let period = term / 5;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick; we already attempted above.

    let mut enabled = true;

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                tracing::info!(%key, "voter loop terminating on shutdown");
                return;
            }

            pulse = control_rx.recv() => {
                match pulse {
                    Some(true) => {
                        if !enabled {
                            tracing::debug!(%key, "voter re-armed");
                            enabled = true;
                            ticker.reset();
                        }
                    }
                    Some(false) => {
                        tracing::debug!(%key, "voter disarmed");
                        enabled = false;
                    }
                    None => {
                        tracing::debug!(%key, "voter control channel dropped");
                        return;
                    }
                }
            }

            pulse = pause_rx.recv() => {
                if pulse.is_none() {
                    continue;
                }
                let cooldown = term * 2;
                tracing::info!(%key, ?cooldown, "stepping down");
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    () = shutdown.cancelled() => {
                        tracing::info!(%key, "voter loop terminating on shutdown during step-down");
                        return;
                    }
                }
            }

            _ = ticker.tick(), if enabled => {
                if let Err(err) = elect(store.as_ref(), clock.as_ref(), &key, &value, term).await {
                    tracing::warn!(%key, error = %err, "election attempt failed");
                }
            }
        }
    }
}
