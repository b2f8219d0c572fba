use std::{path::PathBuf, time::Duration};

/// Size of a block request, the de-facto standard across clients
pub const BLOCK_SIZE: u32 = 16 * 1024;
/// Number of peer connections kept by a single client
pub const MAX_PEER_CONNECTIONS: usize = 40;
pub const LISTEN_PORT: u16 = 6881;

/// Runtime knobs of the download engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the fixed worker pool
    pub max_peer_connections: usize,
    pub block_size: u32,
    /// Port reported to the tracker
    pub listen_port: u16,
    pub connect_timeout: Duration,
    /// Longest silence tolerated from a connected peer
    pub read_timeout: Duration,
    /// Reads allowed while waiting for the 68 handshake bytes
    pub handshake_attempts: usize,
    /// After this long a requested block goes back to the pool
    pub pending_timeout: Duration,
    pub announce_timeout: Duration,
    /// Delay before retrying a failed announce
    pub announce_retry: Duration,
    /// Used until the tracker sends its own interval
    pub default_announce_interval: Duration,
    /// Sleep of the coordinator between completion checks
    pub idle_interval: Duration,
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peer_connections: MAX_PEER_CONNECTIONS,
            block_size: BLOCK_SIZE,
            listen_port: LISTEN_PORT,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
            handshake_attempts: 10,
            pending_timeout: Duration::from_secs(60),
            announce_timeout: Duration::from_secs(30),
            announce_retry: Duration::from_secs(60),
            default_announce_interval: Duration::from_secs(30 * 60),
            idle_interval: Duration::from_secs(5),
            output_dir: PathBuf::from("."),
        }
    }
}
