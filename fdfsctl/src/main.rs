use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use fdfs::client::Client;
use fdfs::config::ClientConfig;
use tokio::time::Duration;
use tracing_subscriber::fmt::format::{format, FmtSpan};

#[derive(Debug, Clone, Parser)]
#[clap(version, about)]
pub struct Args {
    /// Tracker address (host:port). May be repeated, or comma separated.
    #[clap(
        long = "tracker",
        short = 't',
        env = "FDFS_TRACKERS",
        value_delimiter = ',',
        required = true
    )]
    pub trackers: Vec<String>,

    /// Seconds any single request may take
    #[clap(long, env = "FDFS_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Connections opened up front, per pool
    #[clap(long, default_value_t = 1)]
    pub min_connections: usize,

    /// Most connections held, per pool
    #[clap(long, default_value_t = 4)]
    pub max_connections: usize,

    /// Log to stderr (-v info, -vv debug, -vvv with span events)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Upload a local file, printing its remote file id
    Upload { path: Utf8PathBuf },

    /// Upload a local file as a slave of an existing file
    UploadSlave {
        path: Utf8PathBuf,
        master: String,
        /// Suffix appended to the master's name, e.g. "_150x150"
        #[clap(long)]
        prefix: String,
    },

    /// Upload a local file which may later be appended to
    UploadAppender { path: Utf8PathBuf },

    /// Append a local file's contents to an appender file
    Append {
        path: Utf8PathBuf,
        remote_file_id: String,
    },

    /// Download a file, or part of one
    Download {
        remote_file_id: String,
        output: Utf8PathBuf,
        #[clap(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to download; zero reads to the end of the file
        #[clap(long, default_value_t = 0)]
        size: u64,
    },

    /// Delete a file
    Delete { remote_file_id: String },
}

fn tracing(verbose: u8) {
    let (events, max_level) = match verbose {
        0 => return,
        1 => (FmtSpan::NONE, tracing::Level::INFO),
        2 => (FmtSpan::NONE, tracing::Level::DEBUG),
        _ => (FmtSpan::ENTER, tracing::Level::DEBUG),
    };

    tracing_subscriber::fmt()
        .event_format(format().compact())
        .with_span_events(events)
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Upload { path } => {
            let uploaded = client.upload_by_filename(&path).await?;
            println!("{}", uploaded.remote_file_id);
        }
        Command::UploadSlave {
            path,
            master,
            prefix,
        } => {
            let uploaded = client
                .upload_slave_by_filename(&path, &master, &prefix)
                .await?;
            println!("{}", uploaded.remote_file_id);
        }
        Command::UploadAppender { path } => {
            let uploaded = client.upload_appender_by_filename(&path).await?;
            println!("{}", uploaded.remote_file_id);
        }
        Command::Append {
            path,
            remote_file_id,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {path}"))?;
            client.append_by_buffer(&bytes, &remote_file_id).await?;
            println!("{}", bytes.len());
        }
        Command::Download {
            remote_file_id,
            output,
            offset,
            size,
        } => {
            let downloaded = client
                .download_to_file(&output, &remote_file_id, offset, size)
                .await?;
            println!("{}", downloaded.download_size);
        }
        Command::Delete { remote_file_id } => {
            client.delete_file(&remote_file_id).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing(args.verbose);

    let config = ClientConfig::new(args.trackers)
        .with_network_timeout(Duration::from_secs(args.timeout_secs))
        .with_min_connections(args.min_connections)
        .with_max_connections(args.max_connections);
    let client = Client::new(config)
        .await
        .context("Failed to connect to the trackers")?;

    let result = run(&client, args.command).await;
    client.close().await;
    result
}
