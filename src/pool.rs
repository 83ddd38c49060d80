//! A bounded pool of connections to a fixed set of [backend::Endpoint]s,
//! which vends out [claim]s.

use crate::backend::{self, Connection, Endpoint};
use crate::claim;
use crate::join::propagate_panics;
use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::ClaimId;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Duration, Instant};
use tracing::{event, instrument, Level};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("No endpoints were provided to the pool")]
    NoEndpoints,

    #[error("Invalid pool policy: {0}")]
    InvalidPolicy(&'static str),

    #[error("Unable to connect to any of [{endpoints}]: {reason}")]
    Unreachable { endpoints: String, reason: String },

    #[error("Failed to open a connection: {0}")]
    Connect(String),

    #[error("Endpoints exist, but none are online")]
    NoEndpointsOnline,

    #[error("Endpoints are online, but all connections are in use")]
    AllClaimsUsed,

    #[error("Pool terminated")]
    Terminated,
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    const fn as_str(&self) -> &'static str {
        match self {
            Error::NoEndpoints => "NoEndpoints",
            Error::InvalidPolicy(_) => "InvalidPolicy",
            Error::Unreachable { .. } => "Unreachable",
            Error::Connect(_) => "Connect",
            Error::NoEndpointsOnline => "NoEndpointsOnline",
            Error::AllClaimsUsed => "AllClaimsUsed",
            Error::Terminated => "Terminated",
        }
    }
}

enum Request<Conn: Connection> {
    Claim {
        id: ClaimId,
        tx: oneshot::Sender<Result<claim::Handle<Conn>, Error>>,
    },
    Terminate,
}

/// A wrapper around a connection that gives the pool enough context
/// to take it back when the client is done with it.
#[derive_where(Debug)]
pub(crate) struct BorrowedConnection<Conn: Connection> {
    pub(crate) conn: DebugIgnore<Conn>,
    pub(crate) id: u64,
    pub(crate) endpoint: Endpoint,
    pub(crate) last_used: Instant,
    pub(crate) broken: bool,
}

/// Point-in-time counts describing the connections within a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Connections which are open and waiting to be claimed.
    pub idle: usize,
    /// Connections currently checked out by callers.
    pub claimed: usize,
    /// Connection attempts which have not yet completed.
    pub connecting: usize,
    /// Claims waiting for a connection.
    pub waiting: usize,
    /// The number of connections ever opened by this pool.
    pub connections_opened: usize,
    /// The number of claims handed out by this pool.
    pub claims: usize,
}

impl Stats {
    /// Connections which count against [Policy::max_connections].
    pub fn active(&self) -> usize {
        self.idle + self.claimed + self.connecting
    }
}

// A claim request that could not complete immediately
struct ClaimRequest<Conn: Connection> {
    id: ClaimId,
    tx: oneshot::Sender<Result<claim::Handle<Conn>, Error>>,
    deadline: Instant,
}

type ConnectResult<Conn> = Result<(Endpoint, Conn), backend::Error>;

// Tries each endpoint in turn, starting at "start", until one accepts a
// connection.
async fn connect_any<Conn: Connection>(
    name: &str,
    connector: &backend::SharedConnector<Conn>,
    endpoints: &[Endpoint],
    start: usize,
    timeout: Duration,
) -> ConnectResult<Conn> {
    let mut last_err = None;
    for i in 0..endpoints.len() {
        let endpoint = endpoints[(start + i) % endpoints.len()];

        #[cfg(feature = "probes")]
        probes::connect__start!(|| (name, endpoint.to_string()));

        let result = match tokio::time::timeout(timeout, connector.connect(&endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(backend::Error::Timeout(endpoint)),
        };
        match result {
            Ok(conn) => {
                #[cfg(feature = "probes")]
                probes::connect__done!(|| (name, endpoint.to_string()));
                return Ok((endpoint, conn));
            }
            Err(err) => {
                event!(Level::WARN, pool = name, endpoint = %endpoint, err = ?err, "Failed to connect");
                #[cfg(feature = "probes")]
                probes::connect__failed!(|| (name, endpoint.to_string(), err.to_string()));
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| backend::Error::Other(anyhow::anyhow!("no endpoints"))))
}

fn describe(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

struct PoolInner<Conn: Connection> {
    name: Arc<str>,
    endpoints: Arc<[Endpoint]>,
    connector: backend::SharedConnector<Conn>,
    policy: Policy,

    idle: VecDeque<BorrowedConnection<Conn>>,
    claimed: usize,
    connecting: JoinSet<ConnectResult<Conn>>,
    next_connection_id: u64,
    next_endpoint: usize,

    request_queue: VecDeque<ClaimRequest<Conn>>,

    // Sender and receiver for returning borrowed connections.
    //
    // The channel is sized to "max_connections", and every claim::Handle
    // holds a permit, so returning a connection can never fail or block.
    return_tx: mpsc::Sender<BorrowedConnection<Conn>>,
    return_rx: mpsc::Receiver<BorrowedConnection<Conn>>,

    // Must be kept in lockstep with the fields above.
    stats: Arc<Mutex<Stats>>,

    rx: mpsc::Receiver<Request<Conn>>,
}

impl<Conn: Connection> PoolInner<Conn> {
    fn new(
        name: Arc<str>,
        endpoints: Arc<[Endpoint]>,
        connector: backend::SharedConnector<Conn>,
        policy: Policy,
        warm: Vec<(Endpoint, Conn)>,
        stats: Arc<Mutex<Stats>>,
        rx: mpsc::Receiver<Request<Conn>>,
    ) -> Self {
        let (return_tx, return_rx) = mpsc::channel(policy.max_connections);
        let next_endpoint = rand::rng().random_range(0..endpoints.len());
        let mut inner = Self {
            name,
            endpoints,
            connector,
            policy,
            idle: VecDeque::new(),
            claimed: 0,
            connecting: JoinSet::new(),
            next_connection_id: 0,
            next_endpoint,
            request_queue: VecDeque::new(),
            return_tx,
            return_rx,
            stats,
            rx,
        };
        for (endpoint, conn) in warm {
            let conn = inner.wrap(endpoint, conn);
            inner.idle.push_back(conn);
        }
        inner.publish_stats();
        inner
    }

    fn wrap(&mut self, endpoint: Endpoint, conn: Conn) -> BorrowedConnection<Conn> {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.stats.lock().unwrap().connections_opened += 1;
        BorrowedConnection {
            conn: DebugIgnore(conn),
            id,
            endpoint,
            last_used: Instant::now(),
            broken: false,
        }
    }

    fn active(&self) -> usize {
        self.idle.len() + self.claimed + self.connecting.len()
    }

    fn publish_stats(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.idle = self.idle.len();
        stats.claimed = self.claimed;
        stats.connecting = self.connecting.len();
        stats.waiting = self.request_queue.len();
    }

    async fn run(mut self) {
        loop {
            // Either get the next request timeout, or wait forever.
            let next_request_timeout = async {
                match self.request_queue.front() {
                    Some(oldest_request) => tokio::time::sleep_until(oldest_request.deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                // Handle requests from clients
                request = self.rx.recv() => {
                    match request {
                        Some(Request::Claim { id, tx }) => self.claim_or_enqueue(id, tx),
                        // Either the caller asked us to stop, or every
                        // Pool handle is gone. Either way, nobody can
                        // reach us anymore.
                        Some(Request::Terminate) | None => {
                            self.terminate().await;
                            return;
                        }
                    }
                }
                // Take back connections from dropped claim::Handles
                Some(borrowed) = self.return_rx.recv() => self.recycle(borrowed),
                // Finish background connection attempts
                Some(result) = self.connecting.join_next(), if !self.connecting.is_empty() => {
                    self.handle_connect_result(result);
                }
                // Timeout old requests from clients
                _ = next_request_timeout => self.fail_claim(),
            }
            self.publish_stats();
        }
    }

    fn claim_or_enqueue(
        &mut self,
        id: ClaimId,
        tx: oneshot::Sender<Result<claim::Handle<Conn>, Error>>,
    ) {
        #[cfg(feature = "probes")]
        probes::pool__claim__start!(|| (&*self.name, id.0));

        if self.request_queue.is_empty() {
            if let Some(handle) = self.take_idle() {
                self.send_claim(id, tx, handle);
                return;
            }
        }

        // Nothing is ready: wait for a recycled connection, or a new one.
        self.request_queue.push_back(ClaimRequest {
            id,
            tx,
            deadline: Instant::now() + self.policy.claim_timeout,
        });
        self.grow();
    }

    // Borrows the most recently used idle connection, if any.
    fn take_idle(&mut self) -> Option<claim::Handle<Conn>> {
        // Before we vend out the connection to a client, make sure that
        // we have space to take it back once they're done with it.
        let Ok(permit) = self.return_tx.clone().try_reserve_owned() else {
            event!(Level::WARN, pool = &*self.name, "Could not reserve return permit");
            return None;
        };
        let borrowed = self.idle.pop_back()?;
        self.claimed += 1;
        Some(claim::Handle::new(borrowed, permit))
    }

    fn send_claim(
        &mut self,
        id: ClaimId,
        tx: oneshot::Sender<Result<claim::Handle<Conn>, Error>>,
        handle: claim::Handle<Conn>,
    ) {
        #[cfg(feature = "probes")]
        probes::pool__claim__done!(|| (&*self.name, id.0, handle.id()));
        #[cfg(not(feature = "probes"))]
        let _ = id;

        self.stats.lock().unwrap().claims += 1;
        // If the caller went away, the handle is dropped here and its
        // connection comes back through "return_rx".
        let _ = tx.send(Ok(handle));
    }

    // Hands idle connections to waiting requests, oldest first.
    fn serve_queue(&mut self) {
        while !self.idle.is_empty() {
            let Some(request) = self.request_queue.pop_front() else {
                return;
            };
            if request.tx.is_closed() {
                continue;
            }
            let Some(handle) = self.take_idle() else {
                self.request_queue.push_front(request);
                return;
            };
            self.send_claim(request.id, request.tx, handle);
        }
    }

    // Opens connections for waiting requests, up to the policy's ceiling.
    fn grow(&mut self) {
        while self.request_queue.len() > self.connecting.len()
            && self.active() < self.policy.max_connections
        {
            self.spawn_connect();
        }
    }

    fn spawn_connect(&mut self) {
        let name = self.name.clone();
        let connector = self.connector.clone();
        let endpoints = self.endpoints.clone();
        let start = self.next_endpoint;
        let timeout = self.policy.connect_timeout;
        self.next_endpoint = (self.next_endpoint + 1) % self.endpoints.len();

        event!(Level::DEBUG, pool = &*self.name, "Opening connection");
        self.connecting.spawn(async move {
            connect_any(&name, &connector, &endpoints, start, timeout).await
        });
    }

    fn handle_connect_result(&mut self, result: Result<ConnectResult<Conn>, JoinError>) {
        let Some(result) = propagate_panics(result) else {
            return;
        };
        match result {
            Ok((endpoint, conn)) => {
                event!(Level::DEBUG, pool = &*self.name, endpoint = %endpoint, "Connection opened");
                let borrowed = self.wrap(endpoint, conn);
                self.idle.push_back(borrowed);
                self.serve_queue();
            }
            Err(err) => {
                // Fail a waiter only if no other attempt in flight could
                // still serve it.
                if self.request_queue.len() > self.connecting.len() {
                    if let Some(request) = self.request_queue.pop_front() {
                        #[cfg(feature = "probes")]
                        probes::pool__claim__failed!(|| (&*self.name, request.id.0));
                        let _ = request.tx.send(Err(Error::Connect(err.to_string())));
                    }
                }
            }
        }
    }

    #[instrument(level = "trace", skip(self, borrowed), fields(pool = &*self.name, id = borrowed.id))]
    fn recycle(&mut self, mut borrowed: BorrowedConnection<Conn>) {
        self.claimed -= 1;
        if borrowed.broken {
            event!(Level::DEBUG, endpoint = %borrowed.endpoint, "Discarding broken connection");
            drop(borrowed);
            self.grow();
            return;
        }
        borrowed.last_used = Instant::now();
        self.idle.push_back(borrowed);
        self.serve_queue();
    }

    // Forcefully fail the next client claim request.
    fn fail_claim(&mut self) {
        let Some(request) = self.request_queue.pop_front() else {
            return;
        };
        // Identify "why haven't we succeeded" to help the client diagnose
        // what's happening.
        let err = if self.idle.is_empty() && self.claimed == 0 {
            Error::NoEndpointsOnline
        } else {
            Error::AllClaimsUsed
        };
        event!(Level::DEBUG, pool = &*self.name, err = %err, "Claim timed out");

        #[cfg(feature = "probes")]
        probes::pool__claim__failed!(|| (&*self.name, request.id.0));

        let _ = request.tx.send(Err(err));
    }

    #[instrument(skip(self), fields(pool = &*self.name), name = "PoolInner::terminate")]
    async fn terminate(&mut self) {
        self.connecting.shutdown().await;
        self.idle.clear();
        self.request_queue.clear();
        self.publish_stats();
    }
}

/// Manages a bounded set of connections to one or more endpoints.
///
/// When several endpoints are supplied (e.g. every member of a tracker
/// cluster), each new connection starts at the next endpoint in turn and
/// fails over to the others when it cannot connect.
pub struct Pool<Conn: Connection> {
    name: Arc<str>,
    endpoints: Arc<[Endpoint]>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    connector: backend::SharedConnector<Conn>,
    policy: Policy,
    tx: mpsc::Sender<Request<Conn>>,
    stats: Arc<Mutex<Stats>>,
}

impl<Conn: Connection> Pool<Conn> {
    /// Creates a new connection pool.
    ///
    /// - name: The name of this pool, for instrumentation.
    /// - endpoints: The servers to connect to.
    /// - connector: Describes how connections to an endpoint should be made.
    /// - policy: Sizing and timeouts.
    ///
    /// Opens [Policy::min_connections] connections before returning (at
    /// least one, even if the minimum is zero). Fails if not a single one
    /// could be established.
    #[instrument(skip(connector, policy), err, name = "Pool::new")]
    pub async fn new(
        name: String,
        endpoints: Vec<Endpoint>,
        connector: backend::SharedConnector<Conn>,
        policy: Policy,
    ) -> Result<Self, Error> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        if policy.max_connections == 0 {
            return Err(Error::InvalidPolicy("max_connections must be non-zero"));
        }
        if policy.min_connections > policy.max_connections {
            return Err(Error::InvalidPolicy(
                "min_connections must not exceed max_connections",
            ));
        }
        crate::register_probes();

        let name: Arc<str> = name.into();
        let endpoints: Arc<[Endpoint]> = endpoints.into();

        let start = rand::rng().random_range(0..endpoints.len());
        let attempts = (0..policy.min_connections.max(1)).map(|i| {
            connect_any(
                &name,
                &connector,
                &endpoints,
                (start + i) % endpoints.len(),
                policy.connect_timeout,
            )
        });
        let mut warm = vec![];
        let mut last_err = None;
        for result in futures::future::join_all(attempts).await {
            match result {
                Ok(conn) => warm.push(conn),
                Err(err) => last_err = Some(err),
            }
        }
        if warm.is_empty() {
            let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
            return Err(Error::Unreachable {
                endpoints: describe(&endpoints),
                reason,
            });
        }
        event!(
            Level::INFO,
            pool = &*name,
            warm = warm.len(),
            wanted = policy.min_connections,
            "Pool created"
        );

        let (tx, rx) = mpsc::channel(1);
        let stats = Arc::new(Mutex::new(Stats::default()));
        let worker = PoolInner::new(
            name.clone(),
            endpoints.clone(),
            connector.clone(),
            policy.clone(),
            warm,
            stats.clone(),
            rx,
        );
        let handle = tokio::task::spawn(worker.run());

        Ok(Self {
            name,
            endpoints,
            handle: Mutex::new(Some(handle)),
            connector,
            policy,
            tx,
            stats,
        })
    }

    /// The name given to this pool at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The endpoints this pool connects to.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Samples the pool's connection counts at a single point-in-time.
    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap().clone()
    }

    /// Terminates the connection pool.
    ///
    /// Idle connections are closed immediately; outstanding handles close
    /// their connections when dropped.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.tx
            .send(Request::Terminate)
            .await
            .map_err(|_| Error::Terminated)?;
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return Ok(());
        };
        handle.await.map_err(|_| Error::Terminated)
    }

    /// Acquires a handle to a connection within the connection pool.
    ///
    /// Waits at most [Policy::claim_timeout] for a connection to be
    /// released or opened.
    #[instrument(level = "debug", skip(self), fields(pool = &*self.name), err, name = "Pool::claim")]
    pub async fn claim(&self) -> Result<claim::Handle<Conn>, Error> {
        let id = ClaimId::new();
        #[cfg(feature = "probes")]
        probes::claim__start!(|| (&*self.name, id.0));
        let res = self.do_claim(id).await;
        #[cfg(feature = "probes")]
        match &res {
            Ok(handle) => probes::claim__done!(|| (&*self.name, id.0, handle.id())),
            Err(e) => probes::claim__failed!(|| (&*self.name, id.0, e.as_str())),
        }
        res
    }

    // Acquiring a claim has two phases:
    //
    // 1. A request is made to the pool worker, which hands out an idle
    //    connection or opens a new one.
    // 2. Back in this calling task, connections which sat idle for too long
    //    are checked with "Connector::is_valid".
    //
    // The check happens here so that a slow health check does not stall
    // other claim requests in the pool.
    async fn do_claim(&self, id: ClaimId) -> Result<claim::Handle<Conn>, Error> {
        loop {
            let (tx, rx) = oneshot::channel();
            self.tx
                .send(Request::Claim { id, tx })
                .await
                .map_err(|_| Error::Terminated)?;
            let mut claim = rx.await.map_err(|_| Error::Terminated)??;

            if claim.idle_for() < self.policy.validate_idle_after {
                return Ok(claim);
            }

            let result = tokio::time::timeout(
                self.policy.health_check_timeout,
                self.connector.is_valid(&mut claim),
            )
            .await;
            match result {
                Ok(Ok(())) => return Ok(claim),
                Ok(Err(err)) => {
                    event!(Level::DEBUG, err = ?err, "Idle connection failed health check");
                }
                Err(_) => {
                    event!(Level::DEBUG, "Timeout checking idle connection");
                }
            }
            // Throw this one away and try again.
            claim.mark_broken();
        }
    }
}

impl<Conn: Connection> Drop for Pool<Conn> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_utils::{localhost, setup_tracing_subscriber, FaultyConnector, TestConnector};
    use std::sync::Arc;

    fn small_policy() -> Policy {
        Policy {
            min_connections: 1,
            max_connections: 3,
            claim_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    // Tests that a claim can be made to a single endpoint.
    #[tokio::test]
    async fn test_get_claim_from_one_endpoint() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new());
        let endpoint = localhost(8080);

        let pool = Pool::new(
            "my-pool".to_string(),
            vec![endpoint],
            connector,
            Policy::default(),
        )
        .await
        .unwrap();
        let handle = pool.claim().await.expect("Failed to get claim");

        assert_eq!(handle.endpoint, endpoint);
        assert_eq!(handle.endpoint(), endpoint);
    }

    #[tokio::test]
    async fn test_min_connections_warmed() {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector.clone(),
            Policy {
                min_connections: 4,
                max_connections: 8,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(connector.connects(), 4);
        let stats = pool.stats();
        assert_eq!(stats.idle, 4);
        assert_eq!(stats.connections_opened, 4);
    }

    #[tokio::test]
    async fn test_construction_fails_when_unreachable() {
        let connector = Arc::new(FaultyConnector::new());
        connector.start_failing();

        let err = Pool::<()>::new(
            "my-pool".to_string(),
            vec![localhost(8080), localhost(8081)],
            connector,
            small_policy(),
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }), "Unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_rejects_bad_policy() {
        let connector = Arc::new(TestConnector::new());
        let err = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector.clone(),
            Policy {
                min_connections: 5,
                max_connections: 2,
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPolicy(_)));

        let err = Pool::new("my-pool".to_string(), vec![], connector.clone(), Policy::default())
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, Error::NoEndpoints);
        assert_eq!(connector.connects(), 0);
    }

    // Tests that claims wait when there are more claims being made than
    // connections allowed, and resume once a connection is returned.
    #[tokio::test]
    async fn test_get_more_claims_than_max() {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector.clone(),
            small_policy(),
        )
        .await
        .unwrap();

        let mut handles = vec![];
        for _ in 0..3 {
            handles.push(pool.claim().await.expect("Failed to get claim"));
        }
        assert_eq!(pool.stats().claimed, 3);

        // When we try another claim, it cannot complete within the timeout.
        let err = pool.claim().await.map(|_| ()).unwrap_err();
        assert_eq!(err, Error::AllClaimsUsed);
        assert_eq!(connector.connects(), 3);

        // If we make space, the next claim re-uses that old connection.
        let returned = handles.remove(0);
        let returned_id = returned.id;
        drop(returned);

        let handle = pool
            .claim()
            .await
            .expect("Failed to get claim after space became available!");
        assert_eq!(handle.id, returned_id);
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_waiting_claim_served_by_release() {
        let connector = Arc::new(TestConnector::new());
        let pool = Arc::new(
            Pool::new(
                "my-pool".to_string(),
                vec![localhost(8080)],
                connector,
                Policy {
                    min_connections: 1,
                    max_connections: 1,
                    claim_timeout: Duration::from_secs(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap(),
        );

        let first = pool.claim().await.unwrap();
        let first_id = first.id;
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.claim().await.map(|h| h.id) }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().waiting, 1);
        drop(first);

        let id = waiter.await.unwrap().expect("waiter should get the connection");
        assert_eq!(id, first_id);
    }

    #[tokio::test]
    async fn test_failover_between_endpoints() {
        let connector = Arc::new(TestConnector::new());
        let dead = localhost(1);
        let alive = localhost(2);
        connector.refuse(dead);

        let pool = Pool::new(
            "trackers".to_string(),
            vec![dead, alive],
            connector,
            Policy {
                min_connections: 4,
                max_connections: 8,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        for _ in 0..6 {
            let handle = pool.claim().await.unwrap();
            assert_eq!(handle.endpoint(), alive);
        }
    }

    #[tokio::test]
    async fn test_broken_connection_is_not_reused() {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector.clone(),
            small_policy(),
        )
        .await
        .unwrap();

        let mut handle = pool.claim().await.unwrap();
        let broken_id = handle.id;
        handle.mark_broken();
        drop(handle);

        let handle = pool.claim().await.unwrap();
        assert_ne!(handle.id, broken_id);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_stale_connection_is_validated() {
        let connector = Arc::new(FaultyConnector::new());
        let pool = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector.clone(),
            Policy {
                validate_idle_after: Duration::ZERO,
                ..small_policy()
            },
        )
        .await
        .unwrap();

        // The warm connection fails its check, so the claim is served by a
        // freshly opened one instead.
        connector.fail_next_check();
        let _handle = pool.claim().await.unwrap();
        assert!(connector.checks() >= 1);
        assert_eq!(pool.stats().connections_opened, 2);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_waiter() {
        let connector = Arc::new(FaultyConnector::new());
        let pool = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector.clone(),
            Policy {
                claim_timeout: Duration::from_secs(10),
                ..small_policy()
            },
        )
        .await
        .unwrap();

        let _held = pool.claim().await.unwrap();
        connector.start_failing();
        let err = pool.claim().await.map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::Connect(_)), "Unexpected error: {err}");

        // The pool remains usable once the endpoint recovers.
        connector.stop_failing();
        let _handle = pool.claim().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate() {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector,
            Policy::default(),
        )
        .await
        .unwrap();
        let handle = pool.claim().await.expect("Failed to get claim");

        pool.terminate().await.unwrap();
        assert!(matches!(
            pool.terminate().await.unwrap_err(),
            Error::Terminated,
        ));
        assert!(matches!(
            pool.claim().await.map(|_| ()).unwrap_err(),
            Error::Terminated,
        ));

        // Returning a handle after termination is harmless.
        drop(handle);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let connector = Arc::new(crate::test_utils::SlowConnector::new());
        connector.stall();
        let err = Pool::new(
            "my-pool".to_string(),
            vec![localhost(8080)],
            connector,
            Policy {
                connect_timeout: Duration::from_millis(10),
                ..small_policy()
            },
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }), "Unexpected error: {err}");
    }
}
