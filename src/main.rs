use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use bitleech::{
    client::{Client, DownloadOutcome},
    config::{Config, LISTEN_PORT, MAX_PEER_CONNECTIONS},
    error::ApplicationError,
    storage::FileStorage,
    torrent::Torrent,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Downloads the content of a .torrent file")]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory the content is written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Number of peers downloaded from at the same time
    #[arg(long, default_value_t = MAX_PEER_CONNECTIONS)]
    max_peers: usize,

    /// Port reported to the tracker
    #[arg(long, default_value_t = LISTEN_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let args = Args::parse();

    let torrent = Torrent::from_file(&args.torrent)?;
    torrent.log_info();

    let config = Config {
        max_peer_connections: args.max_peers,
        listen_port: args.port,
        output_dir: args.output,
        ..Config::default()
    };
    let storage = FileStorage::create(&config.output_dir, &torrent)
        .map_err(ApplicationError::StorageError)?;

    let handle = Client::new(torrent, config).start(Box::new(storage))?;

    let stop = handle.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, shutting down");
            stop.cancel();
        }
    });

    match handle.wait().await {
        Ok(DownloadOutcome::Complete) => {
            info!("download complete");
            Ok(())
        }
        Ok(DownloadOutcome::Aborted) => {
            warn!("download aborted before completion");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "download failed");
            Err(e)
        }
    }
}
