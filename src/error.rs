use std::fmt;

/// Errors surfaced synchronously to callers of the public API.
///
/// Background-task failures (voter renewal retries, watch reconnects) are never wrapped in this
/// type — they are logged via `tracing` and recovered from internally, per the propagation policy
/// in the design notes: callers observe liveness only through watch events or the store itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required collaborator was missing, or a configuration value failed validation.
    #[error("bad parameter: {0}")]
    Configuration(String),

    /// `AddVoter` was called a second time for a key/value/term triple that differs from the one
    /// the voter loop was originally started with.
    #[error("voter already started for a different key/value/term")]
    VoterAlreadyStarted,

    /// The caller's cancellation token fired before the control-channel send completed.
    #[error("operation cancelled before it could take effect")]
    Cancelled,

    /// The client was already closed.
    #[error("client is closed")]
    Closed,

    /// An error surfaced from the underlying KV store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for the public API.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error returned by a [`KvStore`](crate::store::KvStore) implementation.
///
/// Classified through `is_*` predicate methods on the error type itself, the way
/// `std::io::Error::kind()` or `kube_client::Error::is_not_found()` classify errors, rather than
/// free functions taking a `&dyn Error`.
#[derive(Debug)]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreErrorKind {
    NotFound,
    CasConflict,
    HistoryLost,
    Cancelled,
    Other,
}

impl StoreError {
    /// Build a generic, non-classified store error (a transient I/O failure, timeout, etc).
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Other,
            message: message.into(),
        }
    }

    /// Build a "key not found" error.
    pub fn not_found(key: &str) -> Self {
        Self {
            kind: StoreErrorKind::NotFound,
            message: format!("key {key:?} not found"),
        }
    }

    /// Build a "compare-and-swap conflict" error — another writer won the race.
    pub fn cas_conflict(key: &str) -> Self {
        Self {
            kind: StoreErrorKind::CasConflict,
            message: format!("compare-and-swap conflict on key {key:?}"),
        }
    }

    /// Build a "watch history lost" error — the store's history window no longer covers the
    /// requested index.
    pub fn history_lost(key: &str) -> Self {
        Self {
            kind: StoreErrorKind::HistoryLost,
            message: format!("watch history lost for key {key:?}"),
        }
    }

    /// Build a "cancelled" error — the in-flight operation was cancelled by the caller or by
    /// client shutdown.
    pub fn cancelled() -> Self {
        Self {
            kind: StoreErrorKind::Cancelled,
            message: "operation cancelled".to_string(),
        }
    }

    /// Whether this error means "the key does not exist".
    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }

    /// Whether this error means "another writer's compare-and-swap predicate won the race".
    pub fn is_cas_conflict(&self) -> bool {
        self.kind == StoreErrorKind::CasConflict
    }

    /// Whether this error means "the watch's history window no longer covers the requested index".
    pub fn is_history_lost(&self) -> bool {
        self.kind == StoreErrorKind::HistoryLost
    }

    /// Whether this error means "the operation was cancelled", directly or because its first
    /// underlying cause was cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == StoreErrorKind::Cancelled
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StoreError {}
