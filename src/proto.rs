//! Framing for the tracker and storage wire protocol.
//!
//! Every message starts with a fixed 10 byte header: the body length as a
//! big-endian i64, a command byte, and a status byte. Responses use
//! [Command::Response]; a non-zero status is an errno from the server.
//! String fields inside bodies are fixed-width and NUL padded.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 10;
pub const PKG_LEN_SIZE: usize = 8;
pub const GROUP_NAME_MAX_LEN: usize = 16;
pub const IP_ADDRESS_LEN: usize = 15;
pub const EXT_NAME_MAX_LEN: usize = 6;
pub const PREFIX_MAX_LEN: usize = 16;

/// Body of a "query store" reply: group, ip, port, store path index.
pub const QUERY_STORE_BODY_LEN: usize = GROUP_NAME_MAX_LEN + IP_ADDRESS_LEN + PKG_LEN_SIZE + 1;

/// Body of a "query fetch" or "query update" reply: group, ip, port.
pub const QUERY_FETCH_BODY_LEN: usize = GROUP_NAME_MAX_LEN + IP_ADDRESS_LEN + PKG_LEN_SIZE;

// Limits how much of an error body we're willing to skip over.
const MAX_DRAINED_BODY: u64 = 64 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    StorageUploadFile = 11,
    StorageDeleteFile = 12,
    StorageDownloadFile = 14,
    StorageUploadSlaveFile = 21,
    StorageUploadAppenderFile = 23,
    StorageAppendFile = 24,
    Response = 100,
    TrackerQueryStoreWithoutGroupOne = 101,
    TrackerQueryFetchOne = 102,
    TrackerQueryUpdate = 103,
    TrackerQueryStoreWithGroupOne = 104,
    ActiveTest = 111,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Command::*;
        Ok(match value {
            11 => StorageUploadFile,
            12 => StorageDeleteFile,
            14 => StorageDownloadFile,
            21 => StorageUploadSlaveFile,
            23 => StorageUploadAppenderFile,
            24 => StorageAppendFile,
            100 => Response,
            101 => TrackerQueryStoreWithoutGroupOne,
            102 => TrackerQueryFetchOne,
            103 => TrackerQueryUpdate,
            104 => TrackerQueryStoreWithGroupOne,
            111 => ActiveTest,
            other => return Err(other),
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Server returned status {status} ({})", describe_status(.status))]
    Status { status: u8 },

    #[error("Expected a response, got command {0}")]
    UnexpectedCommand(u8),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Timed out waiting for the server")]
    Timeout,
}

impl Error {
    /// True if the error was reported cleanly by the server, leaving the
    /// connection positioned at a message boundary.
    pub fn leaves_connection_usable(&self) -> bool {
        matches!(self, Error::Status { .. })
    }

    /// The errno reported by the server, if any.
    pub fn status(&self) -> Option<u8> {
        match self {
            Error::Status { status } => Some(*status),
            _ => None,
        }
    }
}

fn describe_status(status: &u8) -> &'static str {
    match *status {
        2 => "no such file or server",
        5 => "I/O error on server",
        12 => "out of memory",
        16 => "busy",
        17 => "already exists",
        22 => "invalid argument",
        28 => "no space left",
        95 => "not supported",
        _ => "unknown",
    }
}

/// The fixed header preceding every request and response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub body_len: u64,
    pub cmd: u8,
    pub status: u8,
}

impl Header {
    pub fn new(cmd: Command, body_len: u64) -> Self {
        Self {
            body_len,
            cmd: cmd as u8,
            status: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0; HEADER_LEN];
        buf[..PKG_LEN_SIZE].copy_from_slice(&self.body_len.to_be_bytes());
        buf[PKG_LEN_SIZE] = self.cmd;
        buf[PKG_LEN_SIZE + 1] = self.status;
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        let body_len = get_i64(&buf[..PKG_LEN_SIZE]);
        let body_len = u64::try_from(body_len)
            .map_err(|_| Error::Malformed(format!("negative body length {body_len}")))?;
        Ok(Self {
            body_len,
            cmd: buf[PKG_LEN_SIZE],
            status: buf[PKG_LEN_SIZE + 1],
        })
    }
}

/// Appends `value` to `buf`, truncated or NUL padded to exactly `width`
/// bytes.
pub fn put_fixed(buf: &mut Vec<u8>, value: &[u8], width: usize) {
    let len = value.len().min(width);
    buf.extend_from_slice(&value[..len]);
    buf.resize(buf.len() + width - len, 0);
}

pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Reads a NUL padded string field.
pub fn get_fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Reads a big-endian i64 from the first eight bytes of `field`.
pub fn get_i64(field: &[u8]) -> i64 {
    let mut bytes = [0; PKG_LEN_SIZE];
    bytes.copy_from_slice(&field[..PKG_LEN_SIZE]);
    i64::from_be_bytes(bytes)
}

/// Sends a header announcing `body.len() + trailing` body bytes, followed by
/// `body`.
///
/// The caller is responsible for writing the `trailing` bytes afterwards.
pub async fn send_request<W>(
    conn: &mut W,
    cmd: Command,
    body: &[u8],
    trailing: u64,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let header = Header::new(cmd, body.len() as u64 + trailing);
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    conn.write_all(&buf).await?;
    if trailing == 0 {
        conn.flush().await?;
    }
    Ok(())
}

/// The body length a caller is prepared to accept.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BodyLen {
    /// Fixed size replies, e.g. tracker lookups.
    Exactly(u64),
    /// Replies bounded by the request, e.g. a ranged download.
    AtMost(u64),
    /// Anything the server announces. Only for bodies read incrementally.
    Any,
}

impl BodyLen {
    fn check(self, body_len: u64) -> Result<(), Error> {
        match self {
            BodyLen::Exactly(expected) if body_len != expected => Err(Error::Malformed(
                format!("expected a {expected} byte body, got {body_len}"),
            )),
            BodyLen::AtMost(max) if body_len > max => Err(Error::Malformed(format!(
                "expected at most {max} body bytes, got {body_len}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Reads a response header.
///
/// Fails with [Error::Status] (after skipping any error body) if the server
/// reported an error, and with [Error::Malformed] if the announced body
/// length is not acceptable to `expected`.
pub async fn recv_header<R>(conn: &mut R, expected: BodyLen) -> Result<Header, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0; HEADER_LEN];
    conn.read_exact(&mut buf).await?;
    let header = Header::decode(&buf)?;

    if header.cmd != Command::Response as u8 {
        return Err(Error::UnexpectedCommand(header.cmd));
    }
    if header.status != 0 {
        if header.body_len > MAX_DRAINED_BODY {
            return Err(Error::Malformed(format!(
                "error body of {} bytes",
                header.body_len
            )));
        }
        tokio::io::copy(
            &mut (&mut *conn).take(header.body_len),
            &mut tokio::io::sink(),
        )
        .await?;
        return Err(Error::Status {
            status: header.status,
        });
    }
    expected.check(header.body_len)?;
    Ok(header)
}

/// Reads a full response, returning its body.
///
/// The body buffer grows as bytes arrive, so an announced length never
/// turns into an allocation by itself.
pub async fn recv_response<R>(conn: &mut R, expected: BodyLen) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let header = recv_header(conn, expected).await?;
    let mut body = Vec::new();
    (&mut *conn)
        .take(header.body_len)
        .read_to_end(&mut body)
        .await?;
    if (body.len() as u64) < header.body_len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("body ended after {} of {} bytes", body.len(), header.body_len),
        )));
    }
    Ok(body)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout() {
        let header = Header::new(Command::StorageDownloadFile, 0x0102);
        let encoded = header.encode();
        assert_eq!(encoded, [0, 0, 0, 0, 0, 0, 1, 2, 14, 0]);
        assert_eq!(Header::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn negative_body_length_is_rejected() {
        let mut encoded = [0xff; HEADER_LEN];
        encoded[PKG_LEN_SIZE] = Command::Response as u8;
        assert!(matches!(Header::decode(&encoded), Err(Error::Malformed(_))));
    }

    #[test]
    fn fixed_fields_are_padded_and_truncated() {
        let mut buf = vec![];
        put_fixed(&mut buf, b"group1", GROUP_NAME_MAX_LEN);
        assert_eq!(buf.len(), GROUP_NAME_MAX_LEN);
        assert_eq!(get_fixed_str(&buf), "group1");

        let mut buf = vec![];
        put_fixed(&mut buf, b"tar.gz.bak", EXT_NAME_MAX_LEN);
        assert_eq!(buf, b"tar.gz");
    }

    #[test]
    fn command_from_byte() {
        assert_eq!(Command::try_from(104), Ok(Command::TrackerQueryStoreWithGroupOne));
        assert_eq!(Command::try_from(99), Err(99));
    }

    #[tokio::test]
    async fn status_error_skips_body_and_keeps_stream_aligned() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut failure = Header::new(Command::Response, 3);
        failure.status = 2;
        server.write_all(&failure.encode()).await.unwrap();
        server.write_all(b"abc").await.unwrap();
        let ok = Header::new(Command::Response, 2);
        server.write_all(&ok.encode()).await.unwrap();
        server.write_all(b"hi").await.unwrap();

        let err = recv_response(&mut client, BodyLen::Any).await.unwrap_err();
        assert_eq!(err.status(), Some(2));
        assert!(err.leaves_connection_usable());

        let body = recv_response(&mut client, BodyLen::Exactly(2)).await.unwrap();
        assert_eq!(body, b"hi");
    }

    #[tokio::test]
    async fn unexpected_length_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(&Header::new(Command::Response, 5).encode())
            .await
            .unwrap();

        let err = recv_header(&mut client, BodyLen::Exactly(QUERY_FETCH_BODY_LEN as u64))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
        assert!(!err.leaves_connection_usable());
    }

    #[tokio::test]
    async fn huge_announced_body_is_not_allocated_up_front() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let huge = Header::new(Command::Response, i64::MAX as u64);
        server.write_all(&huge.encode()).await.unwrap();
        server.write_all(b"abc").await.unwrap();
        drop(server);

        let err = recv_response(&mut client, BodyLen::Any).await.unwrap_err();
        let Error::Io(io_err) = &err else {
            panic!("expected a short read, got {err:?}");
        };
        assert_eq!(io_err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn body_longer_than_the_bound_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let huge = Header::new(Command::Response, i64::MAX as u64);
        server.write_all(&huge.encode()).await.unwrap();

        let err = recv_response(&mut client, BodyLen::AtMost(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
        assert!(!err.leaves_connection_usable());

        let ok = Header::new(Command::Response, 4);
        server.write_all(&ok.encode()).await.unwrap();
        server.write_all(b"four").await.unwrap();
        let body = recv_response(&mut client, BodyLen::AtMost(5)).await.unwrap();
        assert_eq!(body, b"four");
    }

    #[tokio::test]
    async fn request_is_header_then_body() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        send_request(&mut client, Command::StorageDeleteFile, b"xyz", 0)
            .await
            .unwrap();

        let mut buf = [0; HEADER_LEN + 3];
        server.read_exact(&mut buf).await.unwrap();
        let header = Header::decode(buf[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.body_len, 3);
        assert_eq!(header.cmd, Command::StorageDeleteFile as u8);
        assert_eq!(&buf[HEADER_LEN..], b"xyz");
    }
}
