//! Executes file operations against a single storage server.

use crate::claim::Handle;
use crate::file_id::RemoteFileId;
use crate::pool::{self, Pool};
use crate::proto::{
    self, BodyLen, Command, EXT_NAME_MAX_LEN, GROUP_NAME_MAX_LEN, PKG_LEN_SIZE, PREFIX_MAX_LEN,
};

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

const COPY_BUF_LEN: usize = 64 * 1024;

// Group name plus the longest remote filename a storage server generates.
const UPLOAD_REPLY: BodyLen = BodyLen::AtMost((GROUP_NAME_MAX_LEN + 128) as u64);

#[derive(Error, Debug)]
pub enum Error {
    #[error("No storage connection available")]
    Pool(#[from] pool::Error),

    #[error("Storage request failed")]
    Protocol(#[from] proto::Error),

    #[error("Local file {} failed: {source}", .path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    fn leaves_connection_usable(&self) -> bool {
        match self {
            Error::Pool(_) => true,
            Error::Protocol(err) => err.leaves_connection_usable(),
            // Local file failures happen mid-transfer.
            Error::LocalFile { .. } => false,
        }
    }

    fn local(path: &Path, source: io::Error) -> Self {
        Error::LocalFile {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadFileResponse {
    pub group_name: String,
    /// Identifies the new file, as `group/remote_filename`.
    pub remote_file_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadContent {
    Buffer(Vec<u8>),
    File(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadFileResponse {
    pub remote_file_id: String,
    pub content: DownloadContent,
    /// Number of bytes the server sent.
    pub download_size: u64,
}

impl DownloadFileResponse {
    /// The downloaded bytes, for downloads made into memory.
    pub fn buffer(&self) -> Option<&[u8]> {
        match &self.content {
            DownloadContent::Buffer(buf) => Some(buf),
            DownloadContent::File(_) => None,
        }
    }
}

/// A local regular file, checked before it is uploaded.
#[derive(Clone, Debug)]
pub struct LocalFile {
    path: PathBuf,
    size: u64,
}

impl LocalFile {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The file's extension, which becomes the extension of the stored file.
    pub fn ext(&self) -> &str {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
    }
}

/// The content of an upload or append.
#[derive(Clone, Copy, Debug)]
pub enum UploadSource<'a> {
    Buffer(&'a [u8]),
    File(&'a LocalFile),
}

impl UploadSource<'_> {
    fn size(&self) -> u64 {
        match self {
            UploadSource::Buffer(buf) => buf.len() as u64,
            UploadSource::File(file) => file.size,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    /// A file which can never change.
    Regular,
    /// A file which can later be extended with [Storage::append].
    Appender,
}

// Content waiting to be streamed after a request body.
enum Payload<'a> {
    Buffer(&'a [u8]),
    File { file: tokio::fs::File, path: &'a Path, size: u64 },
}

impl<'a> Payload<'a> {
    async fn open(source: UploadSource<'a>) -> Result<Payload<'a>, Error> {
        Ok(match source {
            UploadSource::Buffer(buf) => Payload::Buffer(buf),
            UploadSource::File(local) => {
                let file = tokio::fs::File::open(local.path())
                    .await
                    .map_err(|e| Error::local(local.path(), e))?;
                Payload::File {
                    file,
                    path: local.path(),
                    size: local.size(),
                }
            }
        })
    }

    async fn send<S>(self, conn: &mut S) -> Result<(), Error>
    where
        S: AsyncWrite + Unpin,
    {
        match self {
            Payload::Buffer(buf) => {
                conn.write_all(buf).await.map_err(proto::Error::from)?;
            }
            Payload::File { file, path, size } => {
                let mut file = file.take(size);
                let mut buf = vec![0; COPY_BUF_LEN];
                let mut sent = 0;
                while sent < size {
                    let n = file.read(&mut buf).await.map_err(|e| Error::local(path, e))?;
                    if n == 0 {
                        let err = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("file shrank to {sent} of {size} bytes while uploading"),
                        );
                        return Err(Error::local(path, err));
                    }
                    conn.write_all(&buf[..n])
                        .await
                        .map_err(proto::Error::from)?;
                    sent += n as u64;
                }
            }
        }
        conn.flush().await.map_err(proto::Error::from)?;
        Ok(())
    }
}

fn upload_body(kind: UploadKind, store_path_index: u8, size: u64, ext: &str) -> (Command, Vec<u8>) {
    let cmd = match kind {
        UploadKind::Regular => Command::StorageUploadFile,
        UploadKind::Appender => Command::StorageUploadAppenderFile,
    };
    let mut body = Vec::with_capacity(1 + PKG_LEN_SIZE + EXT_NAME_MAX_LEN);
    body.push(store_path_index);
    proto::put_u64(&mut body, size);
    proto::put_fixed(&mut body, ext.as_bytes(), EXT_NAME_MAX_LEN);
    (cmd, body)
}

fn upload_slave_body(master: &RemoteFileId, size: u64, prefix: &str, ext: &str) -> Vec<u8> {
    let master_name = master.remote_filename().as_bytes();
    let mut body = Vec::with_capacity(
        2 * PKG_LEN_SIZE + PREFIX_MAX_LEN + EXT_NAME_MAX_LEN + master_name.len(),
    );
    proto::put_u64(&mut body, master_name.len() as u64);
    proto::put_u64(&mut body, size);
    proto::put_fixed(&mut body, prefix.as_bytes(), PREFIX_MAX_LEN);
    proto::put_fixed(&mut body, ext.as_bytes(), EXT_NAME_MAX_LEN);
    body.extend_from_slice(master_name);
    body
}

fn append_body(appender: &RemoteFileId, size: u64) -> Vec<u8> {
    let name = appender.remote_filename().as_bytes();
    let mut body = Vec::with_capacity(2 * PKG_LEN_SIZE + name.len());
    proto::put_u64(&mut body, name.len() as u64);
    proto::put_u64(&mut body, size);
    body.extend_from_slice(name);
    body
}

fn file_body(file: &RemoteFileId) -> Vec<u8> {
    let name = file.remote_filename().as_bytes();
    let mut body = Vec::with_capacity(GROUP_NAME_MAX_LEN + name.len());
    proto::put_fixed(&mut body, file.group_name().as_bytes(), GROUP_NAME_MAX_LEN);
    body.extend_from_slice(name);
    body
}

fn download_body(file: &RemoteFileId, offset: u64, size: u64) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 * PKG_LEN_SIZE);
    proto::put_u64(&mut body, offset);
    proto::put_u64(&mut body, size);
    body.extend(file_body(file));
    body
}

fn parse_upload_reply(reply: &[u8]) -> Result<UploadFileResponse, proto::Error> {
    if reply.len() <= GROUP_NAME_MAX_LEN {
        return Err(proto::Error::Malformed(format!(
            "upload reply of {} bytes",
            reply.len()
        )));
    }
    let group_name = proto::get_fixed_str(&reply[..GROUP_NAME_MAX_LEN]);
    let remote_filename = String::from_utf8_lossy(&reply[GROUP_NAME_MAX_LEN..]);
    Ok(UploadFileResponse {
        remote_file_id: format!("{group_name}/{remote_filename}"),
        group_name,
    })
}

async fn send_with_payload<S>(
    conn: &mut S,
    cmd: Command,
    body: &[u8],
    payload: Payload<'_>,
    size: u64,
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    proto::send_request(conn, cmd, body, size).await?;
    payload.send(conn).await
}

// Reads `len` bytes of response body into a local file.
async fn recv_into_file<S>(
    conn: &mut S,
    len: u64,
    file: &mut tokio::fs::File,
    path: &Path,
) -> Result<(), Error>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0; COPY_BUF_LEN];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(COPY_BUF_LEN as u64) as usize;
        let n = conn
            .read(&mut buf[..want])
            .await
            .map_err(proto::Error::from)?;
        if n == 0 {
            let err = io::Error::from(io::ErrorKind::UnexpectedEof);
            return Err(proto::Error::from(err).into());
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| Error::local(path, e))?;
        remaining -= n as u64;
    }
    file.flush().await.map_err(|e| Error::local(path, e))?;
    Ok(())
}

/// Runs storage operations over a pool of connections to one storage server.
pub struct Storage {
    pool: Arc<Pool<TcpStream>>,
    timeout: Duration,
}

impl Storage {
    /// Each operation, including streaming its content, must finish within
    /// `timeout`.
    pub fn new(pool: Arc<Pool<TcpStream>>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn timed<T>(
        &self,
        exchange: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(proto::Error::Timeout.into()),
        }
    }

    /// Uploads a new file into the store path chosen by the tracker.
    #[instrument(level = "debug", skip(self, source), fields(size = source.size()), err)]
    pub async fn upload(
        &self,
        kind: UploadKind,
        store_path_index: u8,
        source: UploadSource<'_>,
        ext: &str,
    ) -> Result<UploadFileResponse, Error> {
        let size = source.size();
        let (cmd, body) = upload_body(kind, store_path_index, size, ext);
        let payload = Payload::open(source).await?;

        let mut conn = self.pool.claim().await?;
        let result = self
            .timed(async {
                let conn = &mut *conn;
                send_with_payload(conn, cmd, &body, payload, size).await?;
                Ok(parse_upload_reply(&proto::recv_response(conn, UPLOAD_REPLY).await?)?)
            })
            .await;
        finish(&mut conn, result)
    }

    /// Uploads a file associated with `master`, named after it plus `prefix`.
    #[instrument(level = "debug", skip(self, source), fields(size = source.size()), err)]
    pub async fn upload_slave(
        &self,
        source: UploadSource<'_>,
        master: &RemoteFileId,
        prefix: &str,
        ext: &str,
    ) -> Result<UploadFileResponse, Error> {
        let size = source.size();
        let body = upload_slave_body(master, size, prefix, ext);
        let payload = Payload::open(source).await?;

        let mut conn = self.pool.claim().await?;
        let result = self
            .timed(async {
                let conn = &mut *conn;
                let cmd = Command::StorageUploadSlaveFile;
                send_with_payload(conn, cmd, &body, payload, size).await?;
                Ok(parse_upload_reply(&proto::recv_response(conn, UPLOAD_REPLY).await?)?)
            })
            .await;
        finish(&mut conn, result)
    }

    /// Appends `data` to the end of an appender file.
    #[instrument(level = "debug", skip(self, data), fields(size = data.len()), err)]
    pub async fn append(&self, appender: &RemoteFileId, data: &[u8]) -> Result<(), Error> {
        let size = data.len() as u64;
        let body = append_body(appender, size);

        let mut conn = self.pool.claim().await?;
        let result = self
            .timed(async {
                let conn = &mut *conn;
                let payload = Payload::Buffer(data);
                send_with_payload(conn, Command::StorageAppendFile, &body, payload, size).await?;
                proto::recv_header(conn, BodyLen::Exactly(0)).await?;
                Ok(())
            })
            .await;
        finish(&mut conn, result)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete(&self, file: &RemoteFileId) -> Result<(), Error> {
        let body = file_body(file);

        let mut conn = self.pool.claim().await?;
        let result = self
            .timed(async {
                let conn = &mut *conn;
                proto::send_request(conn, Command::StorageDeleteFile, &body, 0).await?;
                proto::recv_header(conn, BodyLen::Exactly(0)).await?;
                Ok(())
            })
            .await;
        finish(&mut conn, result)
    }

    /// Downloads `size` bytes starting at `offset` into memory. A `size` of
    /// zero reads to the end of the file.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn download_to_buffer(
        &self,
        file: &RemoteFileId,
        offset: u64,
        size: u64,
    ) -> Result<DownloadFileResponse, Error> {
        let body = download_body(file, offset, size);

        let mut conn = self.pool.claim().await?;
        let result = self
            .timed(async {
                let conn = &mut *conn;
                proto::send_request(conn, Command::StorageDownloadFile, &body, 0).await?;
                Ok(proto::recv_response(conn, download_len(size)).await?)
            })
            .await;
        let content = finish(&mut conn, result)?;

        Ok(DownloadFileResponse {
            remote_file_id: file.to_string(),
            download_size: content.len() as u64,
            content: DownloadContent::Buffer(content),
        })
    }

    /// Downloads `size` bytes starting at `offset` into the local file at
    /// `path`, which is created (or truncated) before anything is sent.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn download_to_file(
        &self,
        path: &Path,
        file: &RemoteFileId,
        offset: u64,
        size: u64,
    ) -> Result<DownloadFileResponse, Error> {
        let mut local = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::local(path, e))?;
        let body = download_body(file, offset, size);

        let mut conn = self.pool.claim().await?;
        let result = self
            .timed(async {
                let conn = &mut *conn;
                proto::send_request(conn, Command::StorageDownloadFile, &body, 0).await?;
                let header = proto::recv_header(conn, download_len(size)).await?;
                recv_into_file(conn, header.body_len, &mut local, path).await?;
                Ok(header.body_len)
            })
            .await;
        let download_size = finish(&mut conn, result)?;

        Ok(DownloadFileResponse {
            remote_file_id: file.to_string(),
            content: DownloadContent::File(path.to_path_buf()),
            download_size,
        })
    }
}

// A ranged download must not return more than was asked for.
fn download_len(size: u64) -> BodyLen {
    match size {
        0 => BodyLen::Any,
        size => BodyLen::AtMost(size),
    }
}

// Discards the connection unless the exchange left it at a message boundary.
fn finish<T>(conn: &mut Handle<TcpStream>, result: Result<T, Error>) -> Result<T, Error> {
    if let Err(err) = &result {
        if !err.leaves_connection_usable() {
            event!(
                Level::WARN,
                server = %conn.endpoint(),
                err = ?err,
                "Discarding storage connection"
            );
            conn.mark_broken();
        }
    }
    result
}
