//! `acserver` -- a distributed build-artifact cache server.
//!
//! Clients submit content-addressed binary artifacts; other clients fetch
//! them instead of redoing the work that produced them. Servers chain
//! pairwise upstream: a miss is forwarded to a configured remote, streamed
//! back to the asking clients, and populates the local store for next time.
//!
//! The three subsystems that matter:
//! - [`cache_db`] -- the on-disk content-addressed store (two-tier cache,
//!   LRU eviction, snapshot persistence).
//! - [`server_logics`] -- per-connection chunked upload/download
//!   multiplexing, multi-client fan-out, upstream fan-in.
//! - [`remote_controller`] -- picks one reachable upstream out of an
//!   ordered candidate list and drives connect/verify/reattempt.
//!
//! [`server_actor`] wires those three (plus the protocol endpoints and the
//! shared-directory client) into a running tokio server; [`main`](../bin)
//! is a thin CLI shell around it.

pub mod cache_db;
pub mod chunking;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod protocol;
pub mod remote_controller;
pub mod server_actor;
pub mod server_logics;
pub mod shared_directory;
pub mod value;

pub use cache_db::CacheDb;
pub use config::Config;
pub use error::{CacheServerError, CacheServerResult};
pub use fingerprint::Fingerprint;
pub use value::CachedItemValue;
