//! A BitTorrent download engine: bencode and wire codecs, per-peer protocol
//! sessions, a block scheduler with piece verification, and the client that
//! ties them to an HTTP tracker and a storage backend.

pub mod bencode;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod queue;
pub mod storage;
pub mod torrent;
pub mod tracker;
