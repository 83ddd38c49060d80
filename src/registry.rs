//! A registry which owns one [Pool] per storage server address.
//!
//! All lookups and creations go through a single worker task. The worker
//! owns the address-to-pool map outright, so the map needs no lock: its
//! request queue is the only synchronization. Pools are created in
//! background tasks which report back to the worker, so a slow creation for
//! one address never delays lookups for another.

use crate::backend::{self, Connection, Endpoint};
use crate::join::propagate_panics;
use crate::policy::Policy;
use crate::pool::{self, Pool};
#[cfg(feature = "probes")]
use crate::probes;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{event, instrument, Level};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Failed to create a pool for storage server {address}: {source}")]
    Create {
        address: Endpoint,
        #[source]
        source: pool::Error,
    },

    #[error("Registry terminated")]
    Terminated,
}

type Reply<Conn> = oneshot::Sender<Result<Arc<Pool<Conn>>, Error>>;

enum Request<Conn: Connection> {
    LookupOrCreate { address: Endpoint, tx: Reply<Conn> },
    Addresses { tx: oneshot::Sender<Vec<Endpoint>> },
    Terminate,
}

type CreateResult<Conn> = (Endpoint, Result<Pool<Conn>, pool::Error>);

struct RegistryInner<Conn: Connection> {
    connector: backend::SharedConnector<Conn>,
    policy: Policy,

    pools: HashMap<Endpoint, Arc<Pool<Conn>>>,

    // Callers waiting on a creation which is already in flight.
    //
    // An address is a key here exactly while its creation task runs.
    pending: HashMap<Endpoint, Vec<Reply<Conn>>>,
    creating: JoinSet<CreateResult<Conn>>,

    rx: mpsc::UnboundedReceiver<Request<Conn>>,
}

impl<Conn: Connection> RegistryInner<Conn> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.rx.recv() => {
                    match request {
                        Some(Request::LookupOrCreate { address, tx }) => {
                            self.lookup_or_create(address, tx);
                        }
                        Some(Request::Addresses { tx }) => {
                            let _ = tx.send(self.pools.keys().copied().collect());
                        }
                        Some(Request::Terminate) | None => {
                            self.terminate().await;
                            return;
                        }
                    }
                }
                Some(result) = self.creating.join_next(), if !self.creating.is_empty() => {
                    self.handle_created(result);
                }
            }
        }
    }

    fn lookup_or_create(&mut self, address: Endpoint, tx: Reply<Conn>) {
        #[cfg(feature = "probes")]
        probes::registry__lookup__start!(|| address.to_string());

        if let Some(pool) = self.pools.get(&address) {
            #[cfg(feature = "probes")]
            probes::registry__lookup__done!(|| address.to_string());
            let _ = tx.send(Ok(pool.clone()));
            return;
        }

        if let Some(waiters) = self.pending.get_mut(&address) {
            event!(Level::DEBUG, address = %address, "Waiting on in-flight pool creation");
            waiters.push(tx);
            return;
        }

        event!(Level::INFO, address = %address, "Creating storage pool");
        self.pending.insert(address, vec![tx]);
        let connector = self.connector.clone();
        let policy = self.policy.clone();
        self.creating.spawn(async move {
            let result = Pool::new(
                format!("storage-{address}"),
                vec![address],
                connector,
                policy,
            )
            .await;
            (address, result)
        });
    }

    fn handle_created(&mut self, result: Result<CreateResult<Conn>, JoinError>) {
        let Some((address, result)) = propagate_panics(result) else {
            return;
        };
        let waiters = self.pending.remove(&address).unwrap_or_default();

        let reply = match result {
            Ok(pool) => {
                event!(Level::INFO, address = %address, "Storage pool created");
                #[cfg(feature = "probes")]
                probes::registry__pool__created!(|| address.to_string());
                let pool = Arc::new(pool);
                self.pools.insert(address, pool.clone());
                Ok(pool)
            }
            Err(source) => {
                // Nothing is recorded, so the next lookup tries again.
                event!(Level::WARN, address = %address, err = %source, "Failed to create storage pool");
                Err(Error::Create { address, source })
            }
        };

        for tx in waiters {
            #[cfg(feature = "probes")]
            match &reply {
                Ok(_) => probes::registry__lookup__done!(|| address.to_string()),
                Err(err) => probes::registry__lookup__failed!(|| (address.to_string(), err.to_string())),
            }
            let _ = tx.send(reply.clone());
        }
    }

    #[instrument(skip(self), name = "RegistryInner::terminate")]
    async fn terminate(&mut self) {
        // Dropping the waiters tells them we've terminated.
        self.creating.shutdown().await;
        self.pending.clear();

        for (address, pool) in self.pools.drain() {
            if let Err(err) = pool.terminate().await {
                event!(Level::DEBUG, address = %address, err = %err, "Pool already terminated");
            }
        }
    }
}

/// Owns one connection pool per storage server address.
///
/// Construct one registry per process (or per cluster) and share it between
/// clients through an [Arc]. Call [Registry::terminate] to shut every pool
/// down; dropping the registry aborts its worker, which drops the pools.
pub struct Registry<Conn: Connection> {
    tx: mpsc::UnboundedSender<Request<Conn>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    policy: Policy,
}

impl<Conn: Connection> Registry<Conn> {
    /// Creates a registry whose pools connect through `connector` and are
    /// sized by `policy`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(connector: backend::SharedConnector<Conn>, policy: Policy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = RegistryInner {
            connector,
            policy: policy.clone(),
            pools: HashMap::new(),
            pending: HashMap::new(),
            creating: JoinSet::new(),
            rx,
        };
        let handle = tokio::task::spawn(worker.run());
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            policy,
        }
    }

    /// The policy used for every pool this registry creates.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Returns the pool for `address`, creating it if it does not exist yet.
    ///
    /// Concurrent callers for the same new address share a single creation
    /// attempt, and all observe its outcome. A failed attempt is not
    /// remembered; the next call tries again.
    #[instrument(level = "debug", skip(self), err, name = "Registry::lookup_or_create")]
    pub async fn lookup_or_create(&self, address: Endpoint) -> Result<Arc<Pool<Conn>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::LookupOrCreate { address, tx })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Lists the addresses which currently have a pool.
    pub async fn addresses(&self) -> Result<Vec<Endpoint>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Addresses { tx })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Terminates the registry and every pool it created.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.tx
            .send(Request::Terminate)
            .map_err(|_| Error::Terminated)?;
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return Ok(());
        };
        handle.await.map_err(|_| Error::Terminated)
    }
}

impl<Conn: Connection> Drop for Registry<Conn> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
