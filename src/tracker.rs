use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use rand::{Rng, distributions::Alphanumeric};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::{
    bencode::{self, Value},
    config::Config,
    error::ApplicationError,
    peer::Peer,
    protocol::PeerId,
    torrent::Torrent,
};

const PEER_ID_PREFIX: &[u8; 8] = b"-BL0001-";
/// Seconds between announces when the tracker does not say
const DEFAULT_INTERVAL: u64 = 1800;

/// Generates the local peer id: the client prefix and 12 random
/// alphanumeric characters
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

fn tracker_error(e: impl std::fmt::Display) -> ApplicationError {
    ApplicationError::TrackerError(e.to_string())
}

/// Decoded body of a successful announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next announce
    pub interval:   u64,
    /// Number of seeders, if reported
    pub complete:   Option<u64>,
    /// Number of leechers, if reported
    pub incomplete: Option<u64>,
    pub peers:      Vec<Peer>,
}

impl AnnounceResponse {
    pub fn from_bytes(body: &[u8]) -> Result<Self, ApplicationError> {
        let dict: BTreeMap<String, Value> = bencode::decode(body)?;

        if let Some(reason) = dict.get("failure reason") {
            let reason = match reason {
                Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                other => format!("{:?}", other),
            };
            return Err(ApplicationError::TrackerError(reason));
        }

        let count = |key: &str| match dict.get(key) {
            Some(Value::Int(n)) if *n >= 0 => Some(*n as u64),
            _ => None,
        };

        let peers = match dict.get("peers") {
            None => Vec::new(),
            Some(Value::Bytes(packed)) => Self::compact_peers(packed)?,
            Some(Value::List(_)) => {
                return Err(ApplicationError::TrackerError(
                    "non-compact peer lists are not supported".into(),
                ));
            }
            Some(_) => {
                return Err(ApplicationError::TrackerError("malformed peers value".into()));
            }
        };

        Ok(Self {
            interval: count("interval").unwrap_or(DEFAULT_INTERVAL),
            complete: count("complete"),
            incomplete: count("incomplete"),
            peers,
        })
    }

    /// Peers packed as 4 bytes of IPv4 address followed by a big-endian port
    fn compact_peers(packed: &[u8]) -> Result<Vec<Peer>, ApplicationError> {
        if packed.len() % 6 != 0 {
            return Err(ApplicationError::TrackerError(format!(
                "compact peers of {} bytes",
                packed.len()
            )));
        }

        Ok(packed
            .chunks_exact(6)
            .map(|chunk| Peer {
                ip:   IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                port: u16::from_be_bytes([chunk[4], chunk[5]]),
            })
            .collect())
    }
}

/// Announce session with the HTTP tracker of one torrent
pub struct Tracker {
    client:     Client,
    announce:   Url,
    info_hash:  [u8; 20],
    peer_id:    PeerId,
    port:       u16,
    started:    bool,
}

impl Tracker {
    pub fn new(torrent: &Torrent, peer_id: PeerId, config: &Config) -> Result<Self, ApplicationError> {
        let announce = Url::parse(&torrent.announce).map_err(tracker_error)?;
        if !matches!(announce.scheme(), "http" | "https") {
            return Err(ApplicationError::TrackerError(format!(
                "unsupported tracker scheme {}",
                announce.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(config.announce_timeout)
            .no_proxy()
            .build()
            .map_err(tracker_error)?;

        Ok(Self {
            client,
            announce,
            info_hash: torrent.info_hash(),
            peer_id,
            port: config.listen_port,
            started: false,
        })
    }

    fn announce_url(&self, uploaded: u64, downloaded: u64, left: u64) -> String {
        // the binary parameters are encoded by hand, Url would encode the
        // percent signs a second time
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash, NON_ALPHANUMERIC),
            percent_encode(&self.peer_id, NON_ALPHANUMERIC),
            self.port,
            uploaded,
            downloaded,
            left,
        );
        if !self.started {
            query.push_str("&event=started");
        }

        let base = self.announce.as_str();
        let sep = if self.announce.query().is_some() { '&' } else { '?' };
        format!("{}{}{}", base, sep, query)
    }

    /// Reports progress and asks for peers. `left` is what remains to be
    /// verified, which `downloaded` alone cannot tell once pieces fail.
    pub async fn announce(
        &mut self,
        uploaded:   u64,
        downloaded: u64,
        left:       u64,
    ) -> Result<AnnounceResponse, ApplicationError> {
        let url = self.announce_url(uploaded, downloaded, left);
        debug!(url = %url, "announcing");

        let response = self.client.get(&url).send().await.map_err(tracker_error)?;
        if response.status() != StatusCode::OK {
            return Err(ApplicationError::TrackerError(format!(
                "tracker replied with {}",
                response.status()
            )));
        }
        let body = response.bytes().await.map_err(tracker_error)?;
        let response = AnnounceResponse::from_bytes(&body)?;

        self.started = true;
        info!(
            peers = response.peers.len(),
            interval = response.interval,
            seeders = ?response.complete,
            leechers = ?response.incomplete,
            "tracker announce"
        );
        Ok(response)
    }

    /// Ends the session
    pub fn close(self) {
        debug!(tracker = %self.announce, "tracker session closed");
    }
}
