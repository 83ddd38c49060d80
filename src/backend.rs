//! The interface for identifying and connecting to tracker and storage
//! servers.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Timed out connecting to {0}")]
    Timeout(Endpoint),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// A single tracker or storage server, identified by its address.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct Endpoint {
    pub address: SocketAddr,
}

impl Endpoint {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(address: SocketAddr) -> Self {
        Self { address }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.address.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.address.serialize(serializer)
    }
}

/// Interface for raw connections.
pub trait Connection: Send + 'static {}

impl<T> Connection for T where T: Send + 'static {}

/// Describes how a connection to an [Endpoint] should be constructed.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Creates a connection to an endpoint.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, Error>;

    /// Determines if the connection to an endpoint is still valid.
    ///
    /// The pool calls this on connections which have been idle for longer
    /// than [crate::policy::Policy::validate_idle_after], before handing
    /// them out again. It can run for
    /// [crate::policy::Policy::health_check_timeout] before timing out.
    ///
    /// By default this method does nothing.
    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Error> {
        Ok(())
    }
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
