//! fdfs is a pooled client for FastDFS-style distributed file stores.
//!
//! It uses the following terminology:
//! * Trackers are coordinator nodes. Given an operation, they pick the
//!   storage server which should handle it.
//! * Storage servers hold file contents. Servers holding the same files form
//!   a group.
//! * A remote file id (`group/remote_filename`) names a stored file.
//!
//! # Usage
//!
//! * The main interface for this crate is [client::Client].
//! * A client holds a [pool::Pool] of tracker connections, and shares a
//!   [registry::Registry] which owns one [pool::Pool] per storage server.
//!   Storage pools are created on first use, exactly once per address, and
//!   live until the registry is terminated.
//!
//! ```no_run
//! use fdfs::client::Client;
//! use fdfs::config::ClientConfig;
//!
//! # async {
//! let config = ClientConfig::new(["10.0.1.70:22122", "10.0.1.69:22122"]);
//! let client = Client::new(config).await.unwrap();
//!
//! let uploaded = client.upload_by_buffer(b"hello", "txt").await.unwrap();
//! let downloaded = client
//!     .download_to_buffer(&uploaded.remote_file_id, 0, 0)
//!     .await
//!     .unwrap();
//! assert_eq!(downloaded.buffer(), Some(&b"hello"[..]));
//!
//! client.close().await;
//! # };
//! ```
//!
//! # DTrace probes
//!
//! fdfs contains a number of DTrace USDT probes, which fire as pools manage
//! their connections and the registry creates pools. The full list of probes
//! is:
//!
//! - `claim-start`: Fires before attempting to take a claim from a pool.
//! - `claim-done`: Fires before returning a successful claim to the client.
//! - `claim-failed`: Fires on failure to take a claim from a pool.
//! - `connect-start`: Fires before attempting a connection to an endpoint.
//! - `connect-done`: Fires after successfully connecting to an endpoint.
//! - `connect-failed`: Fires after failing to connect to an endpoint.
//! - `pool-claim-start`: Fires when the pool worker receives a claim request.
//! - `pool-claim-done`: Fires when the pool worker hands out a connection.
//! - `pool-claim-failed`: Fires when the pool worker fails a claim request.
//! - `handle-returned`: Fires when a handle is returned to its pool, after it
//!   is dropped.
//! - `registry-lookup-start`: Fires when the registry receives a lookup.
//! - `registry-lookup-done`: Fires when a lookup is answered with a pool.
//! - `registry-lookup-failed`: Fires when a lookup is answered with an error.
//! - `registry-pool-created`: Fires when the registry records a new pool.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly enabled,
//! by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Probes are registered the first time a pool is created. Registration is
//! technically fallible; a failure is logged and the pool works regardless.

// Public API
pub mod backend;
pub mod claim;
pub mod client;
pub mod config;
pub mod file_id;
pub mod policy;
pub mod pool;
pub mod proto;
pub mod registry;
pub mod storage;
pub mod tracker;

// Necessary for implementation
mod join;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;

use std::sync::atomic::{AtomicU64, Ordering};

/// Uniquely identifies a claim
#[derive(Copy, Clone, Debug)]
pub(crate) struct ClaimId(pub u64);

impl ClaimId {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn register_probes() {
    #[cfg(feature = "probes")]
    {
        static REGISTERED: std::sync::Once = std::sync::Once::new();
        REGISTERED.call_once(|| {
            if let Err(err) = usdt::register_probes() {
                tracing::warn!(err = %err, "Failed to register USDT probes");
            }
        });
    }
}

/// USDT probes for tracing how fdfs makes pools and hands out claims.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "fdfs")]
mod probes {
    /// Fires right before attempting to acquire a claim from the pool.
    fn claim__start(pool: &str, claim_id: u64) {}

    /// Fires when a claim is successfully acquired from the pool.
    ///
    /// Also identifies the underlying connection which is being used.
    fn claim__done(pool: &str, claim_id: u64, conn_id: u64) {}

    /// Fires when we _fail_ to acquire a claim from the pool, with a string
    /// identifying the reason.
    fn claim__failed(pool: &str, claim_id: u64, reason: &str) {}

    /// Fires right before attempting to make a connection, with the address
    /// we're connecting to.
    fn connect__start(pool: &str, addr: &str) {}

    /// Fires just after successfully making a connection.
    fn connect__done(pool: &str, addr: &str) {}

    /// Fires just after failing to make a connection, with a string
    /// identifying the reason.
    fn connect__failed(pool: &str, addr: &str, reason: &str) {}

    /// Fires when the pool worker receives a claim request.
    ///
    /// This is similar to "claim__start", but it follows the pool worker
    /// task, which may queue the request until a connection frees up.
    fn pool__claim__start(pool: &str, claim_id: u64) {}

    /// Fires when the pool worker hands a connection to a claim.
    fn pool__claim__done(pool: &str, claim_id: u64, conn_id: u64) {}

    /// Fires when the pool worker fails a claim.
    fn pool__claim__failed(pool: &str, claim_id: u64) {}

    /// Fires when a handle is returned to its pool, usually when it is
    /// dropped.
    fn handle__returned(addr: &str, conn_id: u64) {}

    /// Fires when the registry receives a lookup for a storage address.
    fn registry__lookup__start(addr: &str) {}

    /// Fires when the registry answers a lookup with a pool.
    fn registry__lookup__done(addr: &str) {}

    /// Fires when the registry answers a lookup with an error.
    fn registry__lookup__failed(addr: &str, reason: &str) {}

    /// Fires when the registry records a newly created pool.
    fn registry__pool__created(addr: &str) {}
}
