//! # Piece Work Records
//!
//! A piece travels through the scheduler as a [`PieceWork`]: queued on the
//! work channel while pending, owned by exactly one worker while in
//! progress, and re-queued whole if that worker fails. A verified piece
//! leaves the worker as a [`PieceResult`] on the result channel.
//!
//! Within a piece, data moves in 16 KiB blocks. The counters and the
//! per-block map on [`PieceWork`] track the request pipeline for the worker
//! that currently owns the piece; the map is what lets a worker re-request
//! lost blocks after a choke without double-counting duplicates.

/// Size of one block request on the wire (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Download state of a single piece while a worker owns it.
#[derive(Default, Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 of the piece (20 bytes from the metainfo)
    pub hash: Vec<u8>,
    /// Length of this piece in bytes; only the last piece may be short
    pub length: u32,
    /// Piece buffer; blocks land at their `begin` offset
    pub data: Vec<u8>,
    /// Which blocks have arrived
    pub received: Vec<bool>,
    /// Block requests currently in flight
    pub requests: u32,
    /// Watermark of bytes requested so far
    pub requested: u32,
    /// Bytes received so far
    pub downloaded: u32,
}

/// A downloaded and verified piece, ready for assembly.
#[derive(Default, Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Length of the piece in bytes
    pub length: u32,
    /// Complete piece data
    pub data: Vec<u8>,
}

impl PieceWork {
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceWork {
        let nb_blocks = length.div_ceil(BLOCK_SIZE) as usize;
        PieceWork {
            index,
            hash,
            length,
            data: vec![0; length as usize],
            received: vec![false; nb_blocks],
            requests: 0,
            requested: 0,
            downloaded: 0,
        }
    }

    /// Clear all pipeline state before a fresh download attempt.
    pub fn reset(&mut self) {
        self.received.fill(false);
        self.requests = 0;
        self.requested = 0;
        self.downloaded = 0;
    }

    /// After a choke dropped our in-flight requests, rewind the request
    /// watermark to the first block that never arrived. Blocks past the
    /// hole that did arrive are deduplicated on receipt.
    pub fn rewind_to_first_hole(&mut self) {
        let first_hole = self
            .received
            .iter()
            .position(|received| !received)
            .unwrap_or(self.received.len());
        self.requested = ((first_hole as u32) * BLOCK_SIZE).min(self.length);
        self.requests = 0;
    }
}

impl PieceResult {
    pub fn new(index: u32, length: u32, data: Vec<u8>) -> PieceResult {
        PieceResult {
            index,
            length,
            data,
        }
    }
}
