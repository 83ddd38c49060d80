//! The main interface: file operations dispatched through the trackers.
//!
//! Every operation runs in two phases. First a tracker is asked which storage
//! server should handle it. Then the registry provides the pool for that
//! server's address, and the operation runs on one of its connections.
//! Either phase may fail; nothing is retried.

use crate::backend::{Endpoint, SharedConnector};
use crate::config::ClientConfig;
use crate::connectors::tcp::TcpConnector;
use crate::file_id::{self, ParseError, RemoteFileId};
use crate::pool::{self, Pool};
use crate::registry::{self, Registry};
use crate::storage::{
    self, DownloadFileResponse, LocalFile, Storage, UploadFileResponse, UploadKind, UploadSource,
};
use crate::tracker::{self, StorageServer, Tracker};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid client configuration: {0}")]
    Config(String),

    #[error("Cannot connect to any tracker")]
    TrackerPool(#[source] pool::Error),

    #[error("Invalid remote file id or name")]
    Format(#[from] ParseError),

    #[error("Cannot read local file {}: {source} (uploading)", .path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracker could not provide a storage server")]
    Resolve(#[from] tracker::Error),

    #[error("Cannot reach storage server")]
    Pool(#[from] registry::Error),

    #[error("Storage operation failed")]
    Storage(#[from] storage::Error),
}

async fn resolve_endpoints(names: &[String]) -> Result<Vec<Endpoint>, Error> {
    let mut endpoints = vec![];
    for name in names {
        let addrs = tokio::net::lookup_host(name.as_str())
            .await
            .map_err(|e| Error::Config(format!("cannot resolve tracker {name:?}: {e}")))?;
        for addr in addrs {
            let endpoint = Endpoint::new(addr);
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
    }
    if endpoints.is_empty() {
        return Err(Error::Config("trackers resolved to no addresses".to_string()));
    }
    Ok(endpoints)
}

async fn open_local(path: &Path) -> Result<LocalFile, Error> {
    LocalFile::open(path).await.map_err(|source| Error::LocalFile {
        path: path.to_path_buf(),
        source,
    })
}

/// A handle to a file store, which may be cloned and shared between tasks.
#[derive(Clone)]
pub struct Client {
    tracker: Tracker,
    registry: Arc<Registry<TcpStream>>,
    timeout: Duration,
}

impl Client {
    /// Connects to the trackers, with a registry of storage pools private to
    /// this client (and its clones).
    pub async fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate().map_err(Error::Config)?;
        let connector: SharedConnector<TcpStream> = Arc::new(TcpConnector::new());
        let registry = Arc::new(Registry::new(connector, config.storage_policy.clone()));
        Self::with_registry(config, registry).await
    }

    /// Connects to the trackers, sharing storage pools with every other
    /// client using `registry`.
    ///
    /// Storage pools follow the registry's policy, rather than
    /// [ClientConfig::storage_policy].
    #[instrument(skip(registry), err, name = "Client::new")]
    pub async fn with_registry(
        config: ClientConfig,
        registry: Arc<Registry<TcpStream>>,
    ) -> Result<Self, Error> {
        config.validate().map_err(Error::Config)?;
        let endpoints = resolve_endpoints(&config.endpoints).await?;

        let connector: SharedConnector<TcpStream> = Arc::new(TcpConnector::new());
        let pool = Pool::new(
            "tracker".to_string(),
            endpoints,
            connector,
            config.tracker_policy.clone(),
        )
        .await
        .map_err(Error::TrackerPool)?;

        Ok(Self {
            tracker: Tracker::new(Arc::new(pool), config.network_timeout),
            registry,
            timeout: config.network_timeout,
        })
    }

    /// The tracker this client resolves storage servers through.
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// The registry holding this client's storage pools.
    pub fn registry(&self) -> &Arc<Registry<TcpStream>> {
        &self.registry
    }

    async fn storage(&self, server: &StorageServer) -> Result<Storage, Error> {
        let pool = self.registry.lookup_or_create(server.address).await?;
        Ok(Storage::new(pool, self.timeout))
    }

    async fn upload_new(
        &self,
        kind: UploadKind,
        source: UploadSource<'_>,
        ext: &str,
    ) -> Result<UploadFileResponse, Error> {
        file_id::check_ext(ext)?;
        let server = self.tracker.query_store_without_group().await?;
        let storage = self.storage(&server).await?;
        let response = storage
            .upload(kind, server.store_path_index, source, ext)
            .await?;
        event!(
            Level::DEBUG,
            kind = ?kind,
            id = %response.remote_file_id,
            "Uploaded file"
        );
        Ok(response)
    }

    async fn upload_slave(
        &self,
        source: UploadSource<'_>,
        master: &RemoteFileId,
        prefix: &str,
        ext: &str,
    ) -> Result<UploadFileResponse, Error> {
        file_id::check_prefix(prefix)?;
        file_id::check_ext(ext)?;
        let server = self
            .tracker
            .query_store_with_group(master.group_name())
            .await?;
        let storage = self.storage(&server).await?;
        Ok(storage.upload_slave(source, master, prefix, ext).await?)
    }

    /// Uploads the local file at `path`, keeping its extension.
    pub async fn upload_by_filename(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<UploadFileResponse, Error> {
        self.upload_file(UploadKind::Regular, path.as_ref()).await
    }

    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()), err)]
    pub async fn upload_by_buffer(
        &self,
        bytes: &[u8],
        ext: &str,
    ) -> Result<UploadFileResponse, Error> {
        self.upload_new(UploadKind::Regular, UploadSource::Buffer(bytes), ext)
            .await
    }

    /// Uploads the local file at `path` as a slave of `remote_file_id`, in
    /// the same group.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.as_ref().display()), err)]
    pub async fn upload_slave_by_filename(
        &self,
        path: impl AsRef<Path>,
        remote_file_id: &str,
        prefix: &str,
    ) -> Result<UploadFileResponse, Error> {
        let master = RemoteFileId::parse(remote_file_id)?;
        let local = open_local(path.as_ref()).await?;
        self.upload_slave(UploadSource::File(&local), &master, prefix, local.ext())
            .await
    }

    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()), err)]
    pub async fn upload_slave_by_buffer(
        &self,
        bytes: &[u8],
        remote_file_id: &str,
        prefix: &str,
        ext: &str,
    ) -> Result<UploadFileResponse, Error> {
        let master = RemoteFileId::parse(remote_file_id)?;
        self.upload_slave(UploadSource::Buffer(bytes), &master, prefix, ext)
            .await
    }

    /// Uploads the local file at `path` as an appender file, which
    /// [Client::append_by_buffer] can extend later.
    pub async fn upload_appender_by_filename(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<UploadFileResponse, Error> {
        self.upload_file(UploadKind::Appender, path.as_ref()).await
    }

    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()), err)]
    pub async fn upload_appender_by_buffer(
        &self,
        bytes: &[u8],
        ext: &str,
    ) -> Result<UploadFileResponse, Error> {
        self.upload_new(UploadKind::Appender, UploadSource::Buffer(bytes), ext)
            .await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn upload_file(&self, kind: UploadKind, path: &Path) -> Result<UploadFileResponse, Error> {
        let local = open_local(path).await?;
        self.upload_new(kind, UploadSource::File(&local), local.ext())
            .await
    }

    /// Appends `bytes` to an appender file.
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()), err)]
    pub async fn append_by_buffer(&self, bytes: &[u8], remote_file_id: &str) -> Result<(), Error> {
        let appender = RemoteFileId::parse(remote_file_id)?;
        let server = self
            .tracker
            .query_store_with_group(appender.group_name())
            .await?;
        let storage = self.storage(&server).await?;
        Ok(storage.append(&appender, bytes).await?)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete_file(&self, remote_file_id: &str) -> Result<(), Error> {
        let file = RemoteFileId::parse(remote_file_id)?;
        let server = self
            .tracker
            .query_update(file.group_name(), file.remote_filename())
            .await?;
        let storage = self.storage(&server).await?;
        Ok(storage.delete(&file).await?)
    }

    /// Downloads part of a file into `local_path`, starting at `offset`.
    ///
    /// A `size` of zero downloads everything after `offset`.
    #[instrument(
        level = "debug",
        skip(self, local_path),
        fields(local_path = %local_path.as_ref().display()),
        err
    )]
    pub async fn download_to_file(
        &self,
        local_path: impl AsRef<Path>,
        remote_file_id: &str,
        offset: u64,
        size: u64,
    ) -> Result<DownloadFileResponse, Error> {
        let file = RemoteFileId::parse(remote_file_id)?;
        let server = self.fetch_server(&file).await?;
        let storage = self.storage(&server).await?;
        Ok(storage
            .download_to_file(local_path.as_ref(), &file, offset, size)
            .await?)
    }

    /// Downloads part of a file into memory, starting at `offset`.
    ///
    /// A `size` of zero downloads everything after `offset`.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn download_to_buffer(
        &self,
        remote_file_id: &str,
        offset: u64,
        size: u64,
    ) -> Result<DownloadFileResponse, Error> {
        let file = RemoteFileId::parse(remote_file_id)?;
        let server = self.fetch_server(&file).await?;
        let storage = self.storage(&server).await?;
        Ok(storage.download_to_buffer(&file, offset, size).await?)
    }

    async fn fetch_server(&self, file: &RemoteFileId) -> Result<StorageServer, Error> {
        Ok(self
            .tracker
            .query_fetch(file.group_name(), file.remote_filename())
            .await?)
    }

    /// Closes the tracker pool and every storage pool in the registry.
    ///
    /// Operations on this client (or its clones) fail afterwards, as do
    /// operations on other clients sharing the registry.
    pub async fn close(&self) {
        if let Err(err) = self.tracker.pool().terminate().await {
            event!(Level::DEBUG, err = ?err, "Tracker pool already terminated");
        }
        if let Err(err) = self.registry.terminate().await {
            event!(Level::DEBUG, err = ?err, "Registry already terminated");
        }
    }
}
