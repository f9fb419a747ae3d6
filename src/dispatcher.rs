//! The callback dispatcher: a thin adapter turning a watch stream into edge-triggered callback
//! invocations, the way `kube-runtime::reflector::dispatcher::Dispatcher`
//! is a thin fan-out wrapper in front of a single underlying stream rather than a second
//! implementation of it.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::KvStore;
use crate::watcher;

/// Spawn a watch plus a private task that invokes `callback(key, previous, new)` on every distinct
/// value, including the bootstrap value (on which `previous == new`).
pub(crate) fn spawn<F>(
    store: Arc<dyn KvStore>,
    key: String,
    retry: Duration,
    callback: F,
    shutdown: CancellationToken,
) where
    F: Fn(&str, &str, &str) + Send + 'static,
{
    let (sink, mut values) = mpsc::channel(1);
    watcher::spawn(store, key.clone(), retry, sink, shutdown.clone());

    tokio::spawn(async move {
        let mut previous: Option<String> = None;
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => return,

                value = values.recv() => {
                    let Some(new_value) = value else { return };
                    let prev_value = previous.clone().unwrap_or_else(|| new_value.clone());
                    callback(&key, &prev_value, &new_value);
                    previous = Some(new_value);
                }
            }
        }
    });
}
