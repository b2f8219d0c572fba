use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};

use crate::error::ApplicationError;
use crate::protocol::PeerId;

/// Represents the current state of a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Nobody has been asked for the block yet, or the ask was given up
    Missing,
    /// Requested from a peer, not yet received
    Pending,
    /// The data arrived
    Retrieved,
}

/// A contiguous block of data within a piece
#[derive(Debug, Clone)]
pub struct Block {
    pub piece: usize,
    /// Offset (in bytes) from the start of the piece
    pub offset: u32,
    pub length: u32,
    pub state: BlockState,
    pub data: Option<Vec<u8>>,
    /// Peer the block was requested from and when, while pending
    assignment: Option<(PeerId, Instant)>,
}

/// What a peer connection needs to put a block on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: usize,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    fn new(piece: usize, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
            state: BlockState::Missing,
            data: None,
            assignment: None,
        }
    }

    fn reset(&mut self) {
        self.state = BlockState::Missing;
        self.data = None;
        self.assignment = None;
    }

    fn request(&self) -> BlockRequest {
        BlockRequest {
            piece: self.piece,
            offset: self.offset,
            length: self.length,
        }
    }
}

/// A piece of the torrent, composed of one or more blocks
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: usize,
    /// Blocks by ascending offset, covering the whole piece
    pub blocks: Vec<Block>,
    pub hash: [u8; 20],
    verified: bool,
}

impl Piece {
    pub fn new(index: usize, length: u32, block_size: u32, hash: [u8; 20]) -> Self {
        let blocks = (0..length)
            .step_by(block_size as usize)
            .map(|offset| Block::new(index, offset, block_size.min(length - offset)))
            .collect();

        Self {
            index,
            blocks,
            hash,
            verified: false,
        }
    }

    pub fn length(&self) -> usize {
        self.blocks.iter().map(|b| b.length as usize).sum()
    }

    /// Reset all blocks to missing regardless of their current state
    pub fn reset(&mut self) {
        self.blocks.iter_mut().for_each(Block::reset);
    }

    /// Marks the first missing block as pending for `peer` and returns it
    pub fn next_request(&mut self, peer: PeerId, now: Instant) -> Option<BlockRequest> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.state == BlockState::Missing)?;
        block.state = BlockState::Pending;
        block.assignment = Some((peer, now));
        Some(block.request())
    }

    /// Stores the data of the block starting at `offset`.
    ///
    /// Returns `false` when no block of this piece starts there or the data
    /// does not have the block's length.
    pub fn block_received(&mut self, offset: u32, data: Vec<u8>) -> bool {
        match self.blocks.iter_mut().find(|b| b.offset == offset) {
            Some(block) if block.length as usize == data.len() => {
                block.state = BlockState::Retrieved;
                block.data = Some(data);
                block.assignment = None;
                true
            }
            _ => false,
        }
    }

    /// Sends pending blocks back to missing when `release` says so. Returns
    /// how many were released.
    fn release_where(&mut self, release: impl Fn(&PeerId, &Instant) -> bool) -> usize {
        let mut released = 0;
        for block in &mut self.blocks {
            if block.state != BlockState::Pending {
                continue;
            }
            if let Some((peer, at)) = &block.assignment {
                if release(peer, at) {
                    block.reset();
                    released += 1;
                }
            }
        }
        released
    }

    /// Releases every block pending on `peer`
    pub fn release_peer(&mut self, peer: &PeerId) -> usize {
        self.release_where(|owner, _| owner == peer)
    }

    /// Releases blocks requested more than `timeout` before `now`
    pub fn release_expired(&mut self, now: Instant, timeout: Duration) -> usize {
        self.release_where(|_, at| now.saturating_duration_since(*at) >= timeout)
    }

    /// All blocks arrived. Says nothing about the data being correct.
    pub fn is_retrieved(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Retrieved)
    }

    /// The piece was retrieved and matched its hash
    pub fn is_complete(&self) -> bool {
        self.verified
    }

    pub fn has_missing(&self) -> bool {
        self.blocks.iter().any(|b| b.state == BlockState::Missing)
    }

    /// At least one block is pending or retrieved
    pub fn in_progress(&self) -> bool {
        self.blocks.iter().any(|b| b.state != BlockState::Missing)
    }

    /// Concatenation of the retrieved block payloads in offset order
    pub fn data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.length());
        for block in &self.blocks {
            if let Some(bytes) = &block.data {
                data.extend_from_slice(bytes);
            }
        }
        data
    }

    /// Checks the retrieved data against the piece hash and marks the piece
    /// complete when it matches
    pub fn verify(&mut self) -> Result<(), ApplicationError> {
        if !self.is_retrieved() || Sha1::digest(self.data()).as_slice() != self.hash.as_slice() {
            return Err(ApplicationError::IntegrityError(self.index));
        }
        self.verified = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        hash
    }

    #[test]
    fn splits_into_blocks_with_short_tail() {
        let piece = Piece::new(3, 40000, 16384, [0; 20]);
        let layout: Vec<_> = piece.blocks.iter().map(|b| (b.offset, b.length)).collect();
        assert_eq!(layout, [(0, 16384), (16384, 16384), (32768, 7232)]);
        assert!(piece.blocks.iter().all(|b| b.piece == 3));
        assert_eq!(piece.length(), 40000);
    }

    #[test]
    fn requests_blocks_in_order() {
        let mut piece = Piece::new(0, 100, 40, [0; 20]);
        let now = Instant::now();
        let first = piece.next_request([1; 20], now).unwrap();
        let second = piece.next_request([2; 20], now).unwrap();
        assert_eq!((first.offset, first.length), (0, 40));
        assert_eq!((second.offset, second.length), (40, 40));
        assert_eq!(piece.next_request([1; 20], now).unwrap().length, 20);
        assert_eq!(piece.next_request([1; 20], now), None);
        assert!(!piece.has_missing());
    }

    #[test]
    fn retrieved_is_not_complete_until_verified() {
        let content: Vec<u8> = (0..100u8).collect();
        let mut piece = Piece::new(0, 100, 64, hash_of(&content));

        assert!(piece.block_received(64, content[64..].to_vec()));
        assert!(!piece.is_retrieved());
        assert!(piece.block_received(0, content[..64].to_vec()));
        assert!(piece.is_retrieved());
        assert!(!piece.is_complete());

        assert_eq!(piece.data(), content);
        piece.verify().unwrap();
        assert!(piece.is_complete());
    }

    #[test]
    fn verify_fails_on_corruption() {
        let content = vec![1u8; 64];
        let mut piece = Piece::new(5, 64, 32, hash_of(&content));
        piece.block_received(0, vec![1; 32]);
        piece.block_received(32, vec![2; 32]);

        assert!(matches!(
            piece.verify(),
            Err(ApplicationError::IntegrityError(5))
        ));
        assert!(!piece.is_complete());

        piece.reset();
        assert!(piece.blocks.iter().all(|b| b.state == BlockState::Missing && b.data.is_none()));
    }

    #[test]
    fn ignores_unknown_offsets_and_wrong_lengths() {
        let mut piece = Piece::new(0, 64, 32, [0; 20]);
        assert!(!piece.block_received(10, vec![0; 32]));
        assert!(!piece.block_received(0, vec![0; 31]));
        assert!(!piece.in_progress());
    }

    #[test]
    fn releases_by_peer_and_by_age() {
        let mut piece = Piece::new(0, 96, 32, [0; 20]);
        let start = Instant::now();
        piece.next_request([1; 20], start);
        piece.next_request([2; 20], start + Duration::from_secs(30));
        piece.next_request([1; 20], start + Duration::from_secs(30));

        assert_eq!(piece.release_expired(start + Duration::from_secs(60), Duration::from_secs(60)), 1);
        assert_eq!(piece.blocks[0].state, BlockState::Missing);

        assert_eq!(piece.release_peer(&[1; 20]), 1);
        assert_eq!(piece.blocks[2].state, BlockState::Missing);
        assert_eq!(piece.blocks[1].state, BlockState::Pending);
    }
}
