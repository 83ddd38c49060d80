//! Implementation of [Connector] for TCP connections to trackers and
//! storage servers.

use crate::backend::{self, Endpoint, Error};
use crate::proto::{self, BodyLen, Command};

use async_trait::async_trait;
use tokio::net::TcpStream;

pub struct TcpConnector {}

impl TcpConnector {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl backend::Connector for TcpConnector {
    type Connection = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, Error> {
        let stream = TcpStream::connect(endpoint.address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    // Both trackers and storage servers answer the active-test command with
    // an empty response, which doesn't disturb any other traffic.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Error> {
        proto::send_request(conn, Command::ActiveTest, &[], 0)
            .await
            .map_err(|e| Error::Other(e.into()))?;
        proto::recv_header(conn, BodyLen::Exactly(0))
            .await
            .map_err(|e| Error::Other(e.into()))?;
        Ok(())
    }
}
