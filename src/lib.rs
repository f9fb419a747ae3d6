//! A leader-election and key-watch client layered over an external, strongly-consistent KV store
//! that offers compare-and-swap writes, TTL expiration, and index-ordered change notifications.
//!
//! Two capabilities, built on the same [`Client`]:
//!
//! - **Voting** ([`Client::add_voter`]): continuously attempt to claim a key with a caller-supplied
//!   value bound to a TTL lease, renewing it for as long as the caller remains a candidate.
//!   Whichever participant holds the key is the leader for it.
//! - **Watching** ([`Client::add_watch`], [`Client::add_watch_callback`]): deliver the current value
//!   of a key, and every subsequent distinct value, to subscribers — surviving store restarts,
//!   watch-history misses, and transient errors.
//!
//! This crate does not implement consensus (that is delegated to the KV store), does not order
//! notifications across distinct keys, and does not fence stale leaders beyond the store's TTL.
//! The KV store itself, its authentication/transport, and any CLI or config-file surface around
//! this client are out of scope — see [`store::KvStore`] for the consumed interface.
#![forbid(unsafe_code)]

mod client;
mod clock;
mod dispatcher;
mod error;
pub mod store;
mod voter;
mod watcher;

pub use client::{Client, ClientConfig};
pub use clock::{Clock, SystemClock};
pub use error::{Error, Result, StoreError};
