use bitvec::prelude::{BitVec, Msb0};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ApplicationError;
use crate::piece::{BlockRequest, Piece};
use crate::protocol::PeerId;
use crate::storage::Storage;
use crate::torrent::Torrent;

/// Pieces a peer can serve, bit `i` standing for piece `i`
pub type Availability = BitVec<u8, Msb0>;

/// Owns every piece and block of a download: decides what each peer is
/// asked for, collects the blocks that arrive, verifies finished pieces and
/// hands them to storage.
///
/// Shared between connections behind a single lock. None of its methods
/// suspend, so a call always runs to completion before the next one.
pub struct PieceManager {
    pieces: Vec<Piece>,
    total_size: u64,
    /// Peers with an open session
    connected: HashSet<PeerId>,
    peers: HashMap<PeerId, Availability>,
    storage: Box<dyn Storage>,
    pending_timeout: Duration,
    downloaded: u64,
    uploaded: u64,
    integrity_failures: u64,
}

impl PieceManager {
    pub fn new(
        torrent: &Torrent,
        block_size: u32,
        pending_timeout: Duration,
        storage: Box<dyn Storage>,
    ) -> Self {
        let len = torrent.piece_length();
        let tot = torrent.total_size();
        let cnt = torrent.pieces_count();
        let last_len = if tot % len == 0 { len } else { tot % len };

        let pieces = torrent
            .piece_hashes()
            .into_iter()
            .enumerate()
            .map(|(i, hash)| {
                let piece_size = if i == cnt - 1 { last_len } else { len };
                Piece::new(i, piece_size as u32, block_size, hash)
            })
            .collect();

        Self {
            pieces,
            total_size: tot,
            connected: HashSet::new(),
            peers: HashMap::new(),
            storage,
            pending_timeout,
            downloaded: 0,
            uploaded: 0,
            integrity_failures: 0,
        }
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Marks `peer` as connected. False if it already is.
    pub fn connect_peer(&mut self, peer: PeerId) -> bool {
        self.connected.insert(peer)
    }

    /// Registers (or replaces) everything `peer` announced in its bitfield
    pub fn add_peer(&mut self, peer: PeerId, bitfield: &[u8]) {
        self.peers.insert(peer, Availability::from_slice(bitfield));
    }

    /// Records a single `have` from `peer`
    pub fn update_peer(&mut self, peer: PeerId, index: usize) {
        if index >= self.pieces.len() {
            debug!(index, "ignoring have for a piece out of range");
            return;
        }
        let bits = self.peers.entry(peer).or_default();
        if bits.len() <= index {
            bits.resize(self.pieces.len(), false);
        }
        bits.set(index, true);
    }

    /// Forgets `peer` and puts back every block still pending on it
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.connected.remove(peer);
        self.peers.remove(peer);
        self.release_peer(peer);
    }

    /// Puts back every block still pending on `peer`
    pub fn release_peer(&mut self, peer: &PeerId) -> usize {
        let released: usize = self.pieces.iter_mut().map(|p| p.release_peer(peer)).sum();
        if released > 0 {
            debug!(released, "released pending blocks");
        }
        released
    }

    fn has_piece(&self, peer: &Availability, index: usize) -> bool {
        peer.get(index).is_some_and(|bit| *bit)
    }

    /// Picks the next block to ask `peer` for and marks it pending.
    ///
    /// Pieces already under way are finished before new ones are started,
    /// lower indices first. Blocks pending for longer than the pending
    /// timeout are up for grabs again.
    pub fn next_request(&mut self, peer: PeerId) -> Option<BlockRequest> {
        let now = Instant::now();
        let timeout = self.pending_timeout;
        let expired: usize = self
            .pieces
            .iter_mut()
            .map(|p| p.release_expired(now, timeout))
            .sum();
        if expired > 0 {
            debug!(expired, "pending requests timed out");
        }

        let available = self.peers.get(&peer)?;
        let index = self
            .pieces
            .iter()
            .filter(|p| !p.is_complete() && p.has_missing() && self.has_piece(available, p.index))
            .min_by_key(|p| (!p.in_progress(), p.index))
            .map(|p| p.index)?;

        self.pieces[index].next_request(peer, now)
    }

    /// Stores a block that arrived from `peer`.
    ///
    /// Blocks that do not belong to the download are logged and dropped.
    /// Once all blocks of the piece are in, its hash is checked: a match
    /// writes it to storage, a mismatch throws the whole piece away.
    pub fn block_received(
        &mut self,
        peer: PeerId,
        index: usize,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), ApplicationError> {
        let Some(piece) = self.pieces.get_mut(index) else {
            warn!(index, offset, "received a block of a non-existing piece");
            return Ok(());
        };
        if piece.is_complete() {
            debug!(index, offset, "received a block of an already verified piece");
            return Ok(());
        }

        let len = data.len() as u64;
        if !piece.block_received(offset, data) {
            warn!(index, offset, len, "trying to complete a non-existing block");
            return Ok(());
        }
        self.downloaded += len;

        if !piece.is_retrieved() {
            return Ok(());
        }

        match piece.verify() {
            Ok(()) => {
                let data = piece.data();
                if let Err(e) = self.storage.write_piece(index, &data) {
                    self.pieces[index].reset();
                    return Err(ApplicationError::StorageError(e));
                }
                // Payloads are on disk now
                for block in &mut self.pieces[index].blocks {
                    block.data = None;
                }
                info!(
                    index,
                    peer = %String::from_utf8_lossy(&peer),
                    verified = self.verified_pieces(),
                    total = self.pieces.len(),
                    "piece verified"
                );
            }
            Err(e) => {
                piece.reset();
                self.integrity_failures += 1;
                warn!(error = %e, "discarding piece");
            }
        }
        Ok(())
    }

    /// Every piece was downloaded and verified
    pub fn complete(&self) -> bool {
        self.pieces.iter().all(Piece::is_complete)
    }

    pub fn verified_pieces(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_complete()).count()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded
    }

    /// Bytes still to be verified
    pub fn bytes_left(&self) -> u64 {
        let done: u64 = self
            .pieces
            .iter()
            .filter(|p| p.is_complete())
            .map(|p| p.length() as u64)
            .sum();
        self.total_size - done
    }

    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures
    }

    /// Flushes storage
    pub fn close(&mut self) -> Result<(), ApplicationError> {
        self.storage.flush().map_err(ApplicationError::StorageError)
    }
}
