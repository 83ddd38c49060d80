//! Utilities to help with testing the pool and the registry

use crate::backend::{self, Connector, Endpoint};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn localhost(port: u16) -> Endpoint {
    Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub struct TestConnection {
    pub id: usize,
    pub endpoint: Endpoint,
}

/// A connector which always succeeds (unless told to refuse an endpoint),
/// and counts how many connections it has made.
pub struct TestConnector {
    next_id: AtomicUsize,
    refused: Mutex<HashSet<Endpoint>>,
}

impl TestConnector {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            refused: Mutex::new(HashSet::new()),
        }
    }

    /// Every future connection to this endpoint fails.
    pub fn refuse(&self, endpoint: Endpoint) {
        self.refused.lock().unwrap().insert(endpoint);
    }

    /// Accept connections to this endpoint again.
    pub fn accept(&self, endpoint: Endpoint) {
        self.refused.lock().unwrap().remove(&endpoint);
    }

    /// The number of connections successfully made so far.
    pub fn connects(&self) -> usize {
        self.next_id.load(Ordering::SeqCst) - 1
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, backend::Error> {
        if self.refused.lock().unwrap().contains(endpoint) {
            return Err(backend::Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(TestConnection {
            id,
            endpoint: *endpoint,
        })
    }
}

/// A connector which can be told to fail connections or health checks.
pub struct FaultyConnector {
    failing: AtomicBool,
    fail_next_check: AtomicBool,
    checks: AtomicUsize,
}

impl FaultyConnector {
    pub fn new() -> Self {
        Self {
            failing: AtomicBool::new(false),
            fail_next_check: AtomicBool::new(false),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn start_failing(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn stop_failing(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn fail_next_check(&self) {
        self.fail_next_check.store(true, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FaultyConnector {
    type Connection = ();

    async fn connect(&self, _endpoint: &Endpoint) -> Result<Self::Connection, backend::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(backend::Error::Other(anyhow::anyhow!("Failed")));
        }
        Ok(())
    }

    async fn is_valid(&self, _: &mut Self::Connection) -> Result<(), backend::Error> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_check.swap(false, Ordering::SeqCst) {
            return Err(backend::Error::Other(anyhow::anyhow!("Unhealthy")));
        }
        Ok(())
    }
}

/// A test-only connector which can slow down connection access
/// to mimic high-latency connection issues.
pub struct SlowConnector {
    delay_ms: AtomicU64,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl SlowConnector {
    /// Creates a new connector, which only takes 1ms per operation
    pub fn new() -> Self {
        Self {
            delay_ms: AtomicU64::new(1),
            failing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// Stalls all new operations through the connector, forcing them to
    /// take an unrealistically long time.
    pub fn stall(&self) {
        self.delay_ms.store(9999999, Ordering::SeqCst);
    }

    /// After the delay, connection attempts fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The number of connection attempts made, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SlowConnector {
    type Connection = Endpoint;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, backend::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(backend::Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        Ok(*endpoint)
    }
}
