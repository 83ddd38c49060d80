//! Connections which are borrowed from the connection pool.

use crate::backend::{Connection, Endpoint};
use crate::pool::BorrowedConnection;
use tokio::sync::mpsc::OwnedPermit;
use tokio::time::Duration;

/// A [Connection] which is returned to the pool when dropped.
///
/// Note that this method implements [std::ops::Deref] for the
/// generic `Conn` type, and generally, clients should transparently
/// use a handle as a connection.
pub struct Handle<Conn: Connection> {
    inner: Option<BorrowedConnection<Conn>>,
    permit: Option<OwnedPermit<BorrowedConnection<Conn>>>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(
        conn: BorrowedConnection<Conn>,
        permit: OwnedPermit<BorrowedConnection<Conn>>,
    ) -> Self {
        Self {
            inner: Some(conn),
            permit: Some(permit),
        }
    }

    fn borrowed(&self) -> &BorrowedConnection<Conn> {
        self.inner.as_ref().unwrap()
    }

    /// The endpoint this connection is attached to.
    pub fn endpoint(&self) -> Endpoint {
        self.borrowed().endpoint
    }

    /// Marks the connection as unusable.
    ///
    /// Once the handle is dropped, the pool closes the connection instead of
    /// handing it out again. Callers should do this whenever a request was
    /// interrupted midway and the stream may hold unread or partial frames.
    pub fn mark_broken(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.broken = true;
        }
    }

    #[cfg_attr(not(feature = "probes"), allow(dead_code))]
    pub(crate) fn id(&self) -> u64 {
        self.borrowed().id
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.borrowed().last_used.elapsed()
    }
}

impl<Conn> std::ops::Deref for Handle<Conn>
where
    Conn: Send + 'static,
{
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().map(|inner| &inner.conn.0).unwrap()
    }
}

impl<Conn> std::ops::DerefMut for Handle<Conn>
where
    Conn: Send + 'static,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().map(|inner| &mut inner.conn.0).unwrap()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        let conn = self.inner.take().unwrap();
        let permit = self.permit.take().unwrap();

        #[cfg(feature = "probes")]
        crate::probes::handle__returned!(|| (conn.endpoint.to_string(), conn.id));

        permit.send(conn);
    }
}
