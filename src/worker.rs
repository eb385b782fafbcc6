//! # Download Workers
//!
//! A worker is one OS thread of the download pool. It pulls peer addresses
//! off a shared channel and runs one session per peer: connect, handshake,
//! bitfield, interested, then a loop that claims pieces from the work
//! channel and downloads them block by block.
//!
//! ## Queue discipline
//!
//! Receiving a `PieceWork` from the work channel is the pending to
//! in-progress transition, and the channel guarantees exactly one worker
//! makes it. A failed piece (hash mismatch, dead connection, peer lacks
//! it) is sent back whole, which is the retry transition. A verified piece
//! goes out on the result channel and is never seen again.
//!
//! Workers watch the shared `remaining` counter at every claim boundary and
//! exit once it reaches zero, so cancellation needs no extra signalling.
//!
//! ## Piece pipeline
//!
//! Within a piece, up to five block requests ride the wire at once to hide
//! round trips. A choke drops whatever was in flight; on the next unchoke
//! the request watermark rewinds to the first block that never arrived and
//! duplicates are discarded on receipt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sha1::{Digest, Sha1};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::message::*;
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork, BLOCK_SIZE};

// Maximum number of concurrent block requests per peer
const NB_REQUESTS_MAX: u32 = 5;

// Socket timeouts: short while negotiating, generous mid-download
const HANDSHAKE_TIMEOUT_SECS: u64 = 5;
const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

// How long to wait on the work channel before re-checking `remaining`
const WORK_POLL_MS: u64 = 250;

// Consecutive claims of pieces this peer cannot serve before the session
// gives up on it
const MISS_LIMIT: u32 = 64;

/// One thread of the download pool.
pub struct Worker {
    /// Shared queue of peer addresses still worth trying
    peers: Receiver<Peer>,
    /// Our 20-byte peer id
    peer_id: Vec<u8>,
    /// Infohash of the torrent being downloaded
    info_hash: Vec<u8>,
    /// Work queue; the sender side re-queues failed pieces
    work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Verified pieces flow out here
    result_tx: Sender<PieceResult>,
    /// Pieces not yet verified, shared with the assembler
    remaining: Arc<AtomicUsize>,
    /// First error recorded by any worker, for the failure report
    last_error: Arc<Mutex<Option<Error>>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peers: Receiver<Peer>,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
        result_tx: Sender<PieceResult>,
        remaining: Arc<AtomicUsize>,
        last_error: Arc<Mutex<Option<Error>>>,
    ) -> Worker {
        Worker {
            peers,
            peer_id,
            info_hash,
            work_chan,
            result_tx,
            remaining,
            last_error,
        }
    }

    /// Run sessions against peers from the shared queue until the download
    /// completes or the queue runs dry.
    pub fn start_download(&self) {
        while self.remaining.load(Ordering::SeqCst) > 0 {
            let peer = match self.peers.try_recv() {
                Ok(peer) => peer,
                Err(_) => return,
            };

            if let Err(error) = self.run_session(peer) {
                debug!("Session with peer {} ended: {}", peer, error);
                self.record_error(error);
            }
        }
    }

    /// One full session against one peer.
    fn run_session(&self, peer: Peer) -> Result<()> {
        let mut client = Client::connect(peer)?;
        client.set_connection_timeout(HANDSHAKE_TIMEOUT_SECS)?;
        client.handshake_with_peer(&self.peer_id, &self.info_hash, false)?;
        client.read_bitfield()?;
        client.send_unchoke()?;
        client.send_interested()?;

        let mut misses: u32 = 0;

        loop {
            // Claim boundary: observe cancellation before taking work
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }

            let mut piece_work = match self
                .work_chan
                .1
                .recv_timeout(Duration::from_millis(WORK_POLL_MS))
            {
                Ok(piece_work) => piece_work,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            };

            // This peer cannot serve the piece; put it back for another
            // worker. A session that only ever misses is not helping.
            if !client.has_piece(piece_work.index) {
                let index = piece_work.index;
                self.requeue(piece_work)?;
                misses += 1;
                if misses >= MISS_LIMIT {
                    debug!("Peer {} has none of the remaining pieces", peer);
                    return Ok(());
                }
                debug!("Peer {} does not have piece {}", peer, index);
                continue;
            }
            misses = 0;

            // Download piece; a wire failure ends the session
            if let Err(error) = self.download_piece(&mut client, &mut piece_work) {
                self.requeue(piece_work)?;
                return Err(error);
            }

            // Verify piece integrity; a mismatch retries on this or any
            // other worker
            if let Err(error) = verify_piece_integrity(&piece_work) {
                warn!("Piece {} failed verification, retrying", piece_work.index);
                self.record_error(error);
                piece_work.reset();
                self.requeue(piece_work)?;
                continue;
            }

            // Courtesy announce; not worth ending the session over
            if client.send_have(piece_work.index).is_err() {
                debug!("Could not announce piece {} to peer {}", piece_work.index, peer);
            }

            let piece_result =
                PieceResult::new(piece_work.index, piece_work.length, piece_work.data);
            if self.result_tx.send(piece_result).is_err() {
                // Assembler is gone, nothing left to do
                return Ok(());
            }
        }
    }

    /// Download a single piece over an unchoke-ready connection.
    fn download_piece(&self, client: &mut Client, piece_work: &mut PieceWork) -> Result<()> {
        client.set_connection_timeout(DOWNLOAD_TIMEOUT_SECS)?;

        piece_work.reset();

        while piece_work.downloaded < piece_work.length {
            // Keep the request pipeline full while unchoked
            if !client.is_choked() {
                while piece_work.requests < NB_REQUESTS_MAX
                    && piece_work.requested < piece_work.length
                {
                    let remaining_bytes = piece_work.length - piece_work.requested;
                    let block_size = BLOCK_SIZE.min(remaining_bytes);

                    client.send_request(piece_work.index, piece_work.requested, block_size)?;

                    piece_work.requests += 1;
                    piece_work.requested += block_size;
                }
            }

            let message = client.read_message()?;
            match message.id {
                MESSAGE_CHOKE => {
                    client.read_choke();
                    debug!("Peer {} choked us mid-piece", client.peer());
                }
                MESSAGE_UNCHOKE => {
                    let was_choked = client.is_choked();
                    client.read_unchoke();
                    if was_choked {
                        // In-flight requests died with the choke
                        piece_work.rewind_to_first_hole();
                    }
                }
                MESSAGE_HAVE => client.read_have(&message)?,
                MESSAGE_PIECE => client.read_piece(&message, piece_work)?,
                MESSAGE_KEEPALIVE => {}
                MESSAGE_CANCEL | MESSAGE_EXTENDED => {}
                id => debug!(
                    "Ignoring message id {} from peer {}",
                    id,
                    client.peer()
                ),
            }
        }

        debug!("Downloaded piece {}", piece_work.index);

        Ok(())
    }

    /// Return a piece to the work queue.
    fn requeue(&self, mut piece_work: PieceWork) -> Result<()> {
        piece_work.reset();
        self.work_chan
            .0
            .send(piece_work)
            .map_err(|_| Error::DownloadIncomplete("work queue closed".into()))
    }

    /// Keep the first error seen by any worker.
    fn record_error(&self, error: Error) {
        if let Ok(mut slot) = self.last_error.lock() {
            if slot.is_none() {
                *slot = Some(error);
            }
        }
    }
}

/// Compare a downloaded piece against its expected hash.
fn verify_piece_integrity(piece_work: &PieceWork) -> Result<()> {
    let digest = Sha1::digest(&piece_work.data);
    if digest.as_slice() != piece_work.hash.as_slice() {
        return Err(Error::HashMismatch(format!("piece {}", piece_work.index)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_hash() {
        let data = b"some piece bytes".to_vec();
        let hash = Sha1::digest(&data).to_vec();
        let mut work = PieceWork::new(0, hash, data.len() as u32);
        work.data = data;
        assert!(verify_piece_integrity(&work).is_ok());
    }

    #[test]
    fn verify_rejects_corrupt_piece() {
        let data = b"some piece bytes".to_vec();
        let hash = Sha1::digest(&data).to_vec();
        let mut work = PieceWork::new(0, hash, data.len() as u32);
        work.data = data;
        work.data[3] ^= 0xff;
        assert!(matches!(
            verify_piece_integrity(&work),
            Err(Error::HashMismatch(_))
        ));
    }

    #[test]
    fn empty_input_sha1_vector() {
        assert_eq!(
            hex::encode(Sha1::digest([])),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }
}
