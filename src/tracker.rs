//! Queries which ask a tracker which storage server should handle a request.

use crate::backend::Endpoint;
use crate::pool::{self, Pool};
use crate::proto::{self, BodyLen, Command, GROUP_NAME_MAX_LEN, IP_ADDRESS_LEN, PKG_LEN_SIZE};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("No tracker connection available")]
    Pool(#[from] pool::Error),

    #[error("Tracker query failed")]
    Protocol(#[from] proto::Error),

    #[error("Tracker returned an invalid storage address {ip:?} port {port}")]
    InvalidAddress { ip: String, port: i64 },
}

impl Error {
    /// True if the tracker answered, but had no storage server to offer
    /// (or no such file, for fetch and update queries).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Protocol(e) if e.status() == Some(2))
    }
}

/// The storage server a tracker picked to serve one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageServer {
    pub address: Endpoint,
    pub group_name: String,
    /// Which of the server's store paths an upload should land in.
    ///
    /// Always zero for fetch and update queries, whose replies carry no
    /// store path.
    pub store_path_index: u8,
}

fn parse_storage_server(body: &[u8]) -> Result<StorageServer, Error> {
    let group_name = proto::get_fixed_str(&body[..GROUP_NAME_MAX_LEN]);
    let ip_field = &body[GROUP_NAME_MAX_LEN..GROUP_NAME_MAX_LEN + IP_ADDRESS_LEN];
    let ip = proto::get_fixed_str(ip_field);
    let port_offset = GROUP_NAME_MAX_LEN + IP_ADDRESS_LEN;
    let port = proto::get_i64(&body[port_offset..port_offset + PKG_LEN_SIZE]);
    let store_path_index = body.get(port_offset + PKG_LEN_SIZE).copied().unwrap_or(0);

    let invalid = || Error::InvalidAddress {
        ip: ip.clone(),
        port,
    };
    let addr: IpAddr = ip.parse().map_err(|_| invalid())?;
    let port = u16::try_from(port).map_err(|_| invalid())?;

    Ok(StorageServer {
        address: Endpoint::new(SocketAddr::new(addr, port)),
        group_name,
        store_path_index,
    })
}

/// Sends queries to the tracker cluster over a shared connection pool.
#[derive(Clone)]
pub struct Tracker {
    pool: Arc<Pool<TcpStream>>,
    timeout: Duration,
}

impl Tracker {
    /// Wraps a pool of tracker connections. Each query (including the wait
    /// for its reply) must finish within `timeout`.
    pub fn new(pool: Arc<Pool<TcpStream>>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &Arc<Pool<TcpStream>> {
        &self.pool
    }

    /// Asks for any storage server, in any group, to take a new upload.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn query_store_without_group(&self) -> Result<StorageServer, Error> {
        self.query(
            Command::TrackerQueryStoreWithoutGroupOne,
            vec![],
            proto::QUERY_STORE_BODY_LEN,
        )
        .await
    }

    /// Asks for a storage server in `group` which accepts writes.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn query_store_with_group(&self, group: &str) -> Result<StorageServer, Error> {
        let mut body = Vec::with_capacity(GROUP_NAME_MAX_LEN);
        proto::put_fixed(&mut body, group.as_bytes(), GROUP_NAME_MAX_LEN);
        self.query(
            Command::TrackerQueryStoreWithGroupOne,
            body,
            proto::QUERY_STORE_BODY_LEN,
        )
        .await
    }

    /// Asks for the storage server which may modify (e.g. delete) a file.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn query_update(&self, group: &str, filename: &str) -> Result<StorageServer, Error> {
        self.query(
            Command::TrackerQueryUpdate,
            file_body(group, filename),
            proto::QUERY_FETCH_BODY_LEN,
        )
        .await
    }

    /// Asks for a storage server from which a file may be read.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn query_fetch(&self, group: &str, filename: &str) -> Result<StorageServer, Error> {
        self.query(
            Command::TrackerQueryFetchOne,
            file_body(group, filename),
            proto::QUERY_FETCH_BODY_LEN,
        )
        .await
    }

    async fn query(
        &self,
        cmd: Command,
        body: Vec<u8>,
        reply_len: usize,
    ) -> Result<StorageServer, Error> {
        let mut conn = self.pool.claim().await?;

        let exchange = async {
            proto::send_request(&mut *conn, cmd, &body, 0).await?;
            proto::recv_response(&mut *conn, BodyLen::Exactly(reply_len as u64)).await
        };
        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(proto::Error::Timeout),
        };

        match result {
            Ok(reply) => {
                let server = parse_storage_server(&reply)?;
                event!(Level::DEBUG, cmd = ?cmd, server = ?server, "Tracker chose storage server");
                Ok(server)
            }
            Err(err) => {
                if !err.leaves_connection_usable() {
                    conn.mark_broken();
                }
                Err(err.into())
            }
        }
    }
}

fn file_body(group: &str, filename: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(GROUP_NAME_MAX_LEN + filename.len());
    proto::put_fixed(&mut body, group.as_bytes(), GROUP_NAME_MAX_LEN);
    body.extend_from_slice(filename.as_bytes());
    body
}
