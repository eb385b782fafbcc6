//! # Torrent Management
//!
//! Metainfo parsing and download coordination. A [`Torrent`] is built from
//! a `.torrent` file or bootstrapped from a magnet link, then drives the
//! whole download: tracker announce, worker pool, piece assembly.
//!
//! ## Infohash discipline
//!
//! The infohash is the SHA-1 of the *raw bytes* of the info dictionary as
//! they appear in the source file. The parser locates that byte range by
//! bencode-aware scanning and hashes the slice directly; it never re-encodes
//! the decoded value, so key ordering or integer quirks in the source can
//! never shift the hash.
//!
//! ## Download coordination
//!
//! 1. Announce to the tracker and collect peer addresses
//! 2. Seed the work channel with every piece, index-ascending
//! 3. Spawn up to four workers that pull peers off a shared channel
//! 4. Collect verified pieces from the result channel into the file buffer
//! 5. Succeed when nothing remains; fail with the first recorded error when
//!    every worker has exited early

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::client::Client;
use crate::error::{Error, Result};
use crate::extension::{self, PeerExtensions};
use crate::handshake::Handshake;
use crate::magnet::MagnetLink;
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::tracker;
use crate::worker::Worker;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

// Maximum number of concurrent peer sessions
const WORKERS_MAX: usize = 4;

/// A single-file torrent and the state needed to download it.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker URL for peer discovery
    announce: String,
    /// 20-byte SHA-1 hash of the raw info dictionary
    info_hash: Vec<u8>,
    /// Expected SHA-1 per piece, split from the `pieces` blob
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u64,
    /// Suggested filename from the metainfo
    name: String,
    /// Random 20-byte identifier for this client instance
    peer_id: Vec<u8>,
}

impl Torrent {
    /// Parse a `.torrent` file.
    pub fn open(filepath: &Path) -> Result<Torrent> {
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => {
                return Err(Error::InvalidTorrent(format!(
                    "could not open {}",
                    filepath.display()
                )))
            }
        };

        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(Error::InvalidTorrent(format!(
                "could not read {}",
                filepath.display()
            )));
        }

        Torrent::from_bytes(&buf)
    }

    /// Parse metainfo bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let metainfo = bencode::decode(buf)?;

        let announce = match metainfo.get(b"announce").and_then(Value::as_bytes) {
            Some(announce) => String::from_utf8_lossy(announce).into_owned(),
            None => return Err(Error::InvalidTorrent("missing announce".into())),
        };

        let info = match metainfo.get(b"info") {
            Some(info) => info,
            None => return Err(Error::InvalidTorrent("missing info dictionary".into())),
        };

        // Hash the raw info slice, never a re-encoding
        let (start, end) = info_span(buf)?;
        let info_hash = Sha1::digest(&buf[start..end]).to_vec();

        let mut torrent = Torrent::from_info(info)?;
        torrent.announce = announce;
        torrent.info_hash = info_hash;

        Ok(torrent)
    }

    /// Build a torrent from a magnet link plus the info-dictionary bytes
    /// fetched over the metadata extension. The bytes must already have
    /// been verified against the magnet infohash.
    pub fn from_metadata(magnet: &MagnetLink, metadata: &[u8]) -> Result<Torrent> {
        let announce = match magnet.announce() {
            Some(announce) => announce.to_string(),
            None => return Err(Error::InvalidMagnet("link carries no tracker".into())),
        };

        let info = bencode::decode(metadata)?;
        let mut torrent = Torrent::from_info(&info)?;
        torrent.announce = announce;
        torrent.info_hash = magnet.info_hash.clone();

        Ok(torrent)
    }

    /// Extract the single-file fields from a decoded info dictionary.
    fn from_info(info: &Value) -> Result<Torrent> {
        let name = match info.get(b"name").and_then(Value::as_bytes) {
            Some(name) => String::from_utf8_lossy(name).into_owned(),
            None => return Err(Error::InvalidTorrent("info has no name".into())),
        };

        let length = match info.get(b"length").and_then(Value::as_int) {
            Some(length) if length > 0 => length as u64,
            _ => return Err(Error::InvalidTorrent("info has no positive length".into())),
        };

        let piece_length = match info.get(b"piece length").and_then(Value::as_int) {
            Some(piece_length) if piece_length > 0 && piece_length <= u32::MAX as i64 => {
                piece_length as u32
            }
            _ => {
                return Err(Error::InvalidTorrent(
                    "info has no usable piece length".into(),
                ))
            }
        };

        let pieces = match info.get(b"pieces").and_then(Value::as_bytes) {
            Some(pieces) if !pieces.is_empty() && pieces.len() % SHA1_HASH_SIZE == 0 => pieces,
            _ => {
                return Err(Error::InvalidTorrent(
                    "pieces is not a multiple of 20 bytes".into(),
                ))
            }
        };
        let pieces_hashes = pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();

        Ok(Torrent {
            announce: String::new(),
            info_hash: vec![],
            pieces_hashes,
            piece_length,
            length,
            name,
            peer_id: tracker::generate_peer_id(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn announce(&self) -> &str {
        &self.announce
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn info_hash(&self) -> &[u8] {
        &self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(&self.info_hash)
    }

    pub fn pieces_hashes(&self) -> &[Vec<u8>] {
        &self.pieces_hashes
    }

    pub fn peer_id(&self) -> &[u8] {
        &self.peer_id
    }

    /// Announce to the tracker and return its peer list.
    pub fn request_peers(&self) -> Result<Vec<Peer>> {
        tracker::request_peers(&self.announce, &self.info_hash, &self.peer_id, self.length)
    }

    /// Length of one piece; only the last piece may be short.
    pub fn piece_len(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.length);
        (end - begin) as u32
    }

    /// Byte offset of a piece within the assembled file.
    fn piece_offset(&self, index: u32) -> usize {
        (index as u64 * self.piece_length as u64) as usize
    }

    /// Download the whole file, discovering peers through the tracker.
    pub fn download(&self) -> Result<Vec<u8>> {
        let peers = self.request_peers()?;
        self.download_from_peers(peers)
    }

    /// Download the whole file from a known peer list.
    pub fn download_from_peers(&self, peers: Vec<Peer>) -> Result<Vec<u8>> {
        info!(
            "Downloading {:?} ({} pieces) from {} peers",
            self.name,
            self.pieces_hashes.len(),
            peers.len()
        );

        let pieces: Vec<PieceWork> = (0..self.pieces_hashes.len() as u32)
            .map(|index| {
                PieceWork::new(
                    index,
                    self.pieces_hashes[index as usize].clone(),
                    self.piece_len(index),
                )
            })
            .collect();

        self.run_download(peers, pieces, self.length as usize, true)
    }

    /// Download one piece, discovering peers through the tracker.
    pub fn download_piece(&self, index: u32) -> Result<Vec<u8>> {
        if index as usize >= self.pieces_hashes.len() {
            return Err(Error::InvalidTorrent(format!(
                "piece {} out of range, torrent has {} pieces",
                index,
                self.pieces_hashes.len()
            )));
        }

        let peers = self.request_peers()?;
        self.download_piece_from_peers(peers, index)
    }

    /// Download one piece from a known peer list.
    pub fn download_piece_from_peers(&self, peers: Vec<Peer>, index: u32) -> Result<Vec<u8>> {
        let piece = PieceWork::new(
            index,
            self.pieces_hashes[index as usize].clone(),
            self.piece_len(index),
        );
        let total = piece.length as usize;

        self.run_download(peers, vec![piece], total, false)
    }

    /// Run the worker pool over a set of pieces and assemble the results.
    ///
    /// The work channel is the pending queue; receiving from it is the
    /// exclusive claim on a piece. Workers re-queue pieces they cannot
    /// finish. When every worker has exited, the result channel disconnects
    /// and whatever is still missing decides success or failure.
    fn run_download(
        &self,
        peers: Vec<Peer>,
        pieces: Vec<PieceWork>,
        total_len: usize,
        progress: bool,
    ) -> Result<Vec<u8>> {
        let nb_pieces = pieces.len();
        let single = nb_pieces == 1;
        let base_offset = if single {
            self.piece_offset(pieces[0].index)
        } else {
            0
        };

        // Work and result channels
        let work_chan = unbounded::<PieceWork>();
        let result_chan = unbounded::<PieceResult>();

        // Seed pending pieces, index-ascending
        for piece_work in pieces {
            if work_chan.0.send(piece_work).is_err() {
                return Err(Error::DownloadIncomplete("work queue closed".into()));
            }
        }

        // Shared scheduler state
        let remaining = Arc::new(AtomicUsize::new(nb_pieces));
        let last_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        // Peer addresses feed the pool; a worker pulls the next one when
        // its session ends
        let (peer_tx, peer_rx) = unbounded::<Peer>();
        for peer in &peers {
            let _ = peer_tx.send(*peer);
        }
        drop(peer_tx);

        // Spawn the pool
        let nb_workers = WORKERS_MAX.min(peers.len());
        for _ in 0..nb_workers {
            let worker = Worker::new(
                peer_rx.clone(),
                self.peer_id.clone(),
                self.info_hash.clone(),
                (work_chan.0.clone(), work_chan.1.clone()),
                result_chan.0.clone(),
                Arc::clone(&remaining),
                Arc::clone(&last_error),
            );
            thread::spawn(move || worker.start_download());
        }

        // Only workers hold result senders now; when they all exit, the
        // receive below disconnects
        drop(result_chan.0);

        let pb = if progress {
            let pb = ProgressBar::new(total_len as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%",
                    )
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        // Assemble verified pieces into the file buffer; piece ranges are
        // disjoint by construction
        let mut data: Vec<u8> = vec![0; total_len];
        while remaining.load(Ordering::SeqCst) > 0 {
            let piece_result = match result_chan.1.recv() {
                Ok(piece_result) => piece_result,
                Err(_) => break,
            };

            let begin = self.piece_offset(piece_result.index) - base_offset;
            let end = begin + piece_result.length as usize;
            data[begin..end].copy_from_slice(&piece_result.data);

            pb.inc(piece_result.length as u64);
            remaining.fetch_sub(1, Ordering::SeqCst);
        }
        pb.finish_and_clear();

        // Anything still pending means the pool died under us
        if remaining.load(Ordering::SeqCst) > 0 {
            let first_error = last_error.lock().ok().and_then(|mut slot| slot.take());
            return Err(first_error.unwrap_or_else(|| {
                Error::DownloadIncomplete(format!(
                    "{} pieces still pending with no usable peers",
                    remaining.load(Ordering::SeqCst)
                ))
            }));
        }

        Ok(data)
    }
}

/// Locate the raw byte range of the `info` value inside metainfo bytes.
///
/// Scans the outer dictionary entry by entry with the bencode decoder,
/// recording where each value starts and ends. Returns `[start, end)` of
/// the info value.
fn info_span(buf: &[u8]) -> Result<(usize, usize)> {
    if buf.first() != Some(&b'd') {
        return Err(Error::InvalidTorrent("metainfo is not a dictionary".into()));
    }

    let mut pos = 1;
    loop {
        match buf.get(pos) {
            None | Some(b'e') => {
                return Err(Error::InvalidTorrent("metainfo has no info entry".into()))
            }
            Some(_) => {}
        }

        let (key, consumed) = decode_at(buf, pos)?;
        pos += consumed;
        let key = match key.as_bytes() {
            Some(key) => key.to_vec(),
            None => return Err(Error::InvalidTorrent("metainfo key is not a string".into())),
        };

        let start = pos;
        let (_, consumed) = decode_at(buf, pos)?;
        pos += consumed;

        if key == b"info" {
            return Ok((start, pos));
        }
    }
}

/// Decode one value at an offset, shifting error offsets to the whole
/// buffer.
fn decode_at(buf: &[u8], pos: usize) -> Result<(Value, usize)> {
    bencode::decode_prefix(&buf[pos..]).map_err(|error| match error {
        Error::Bencode { offset, reason } => Error::Bencode {
            offset: offset + pos,
            reason,
        },
        other => other,
    })
}

/// Connect to a peer from the magnet's swarm and complete both handshakes.
///
/// Peers are tried in tracker order; the first one that accepts the base
/// handshake with the extension bit and offers ut_metadata wins. Returns
/// the live connection, the peer's handshake and its extension ids.
pub fn magnet_connect(
    magnet: &MagnetLink,
    peer_id: &[u8],
) -> Result<(Client, Handshake, PeerExtensions)> {
    let announce = match magnet.announce() {
        Some(announce) => announce,
        None => return Err(Error::InvalidMagnet("link carries no tracker".into())),
    };

    let peers = tracker::request_peers(
        announce,
        &magnet.info_hash,
        peer_id,
        tracker::LEFT_UNKNOWN,
    )?;

    let mut last_error = None;
    for peer in peers {
        match magnet_peer_session(peer, magnet, peer_id) {
            Ok(session) => return Ok(session),
            Err(error) => {
                debug!("Peer {} unusable for metadata: {}", peer, error);
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or(Error::NoPeers))
}

fn magnet_peer_session(
    peer: Peer,
    magnet: &MagnetLink,
    peer_id: &[u8],
) -> Result<(Client, Handshake, PeerExtensions)> {
    let mut client = Client::connect(peer)?;
    client.set_connection_timeout(10)?;

    let peer_handshake = client.handshake_with_peer(peer_id, &magnet.info_hash, true)?;
    if !peer_handshake.supports_extensions() {
        return Err(Error::PeerProtocol(format!(
            "peer {} does not support the extension protocol",
            peer
        )));
    }

    extension::send_handshake(&mut client)?;
    let extensions = extension::read_handshake(&mut client)?;

    Ok((client, peer_handshake, extensions))
}

/// Bootstrap a full [`Torrent`] from a magnet link by fetching and
/// verifying the info dictionary from the swarm.
pub fn from_magnet(magnet: &MagnetLink) -> Result<Torrent> {
    let peer_id = tracker::generate_peer_id();
    let (mut client, _, extensions) = magnet_connect(magnet, &peer_id)?;
    let metadata = extension::fetch_metadata(&mut client, extensions.metadata_id, &magnet.info_hash)?;

    Torrent::from_metadata(magnet, &metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
    use std::sync::atomic::AtomicBool;

    /// Canonical metainfo bytes for a file split into `piece_length` pieces
    /// of `content`.
    fn sample_metainfo(content: &[u8], piece_length: u32) -> Vec<u8> {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length as usize) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }

        let info = BTreeMap::from([
            (b"length".to_vec(), Value::Int(content.len() as i64)),
            (b"name".to_vec(), Value::string("sample.txt")),
            (b"piece length".to_vec(), Value::Int(piece_length as i64)),
            (b"pieces".to_vec(), Value::Bytes(pieces)),
        ]);
        let metainfo = BTreeMap::from([
            (
                b"announce".to_vec(),
                Value::string("http://tracker.example/announce"),
            ),
            (b"info".to_vec(), Value::Dict(info)),
        ]);

        Value::Dict(metainfo).encode()
    }

    fn sample_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn parse_sample_torrent() {
        let content = sample_content(92063);
        let buf = sample_metainfo(&content, 32768);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        assert_eq!(torrent.announce(), "http://tracker.example/announce");
        assert_eq!(torrent.name(), "sample.txt");
        assert_eq!(torrent.length(), 92063);
        assert_eq!(torrent.piece_length(), 32768);
        assert_eq!(torrent.pieces_hashes().len(), 3);
    }

    #[test]
    fn infohash_is_hash_of_raw_info_slice() {
        let buf = sample_metainfo(&sample_content(1000), 512);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        let (start, end) = info_span(&buf).unwrap();
        assert_eq!(
            torrent.info_hash(),
            Sha1::digest(&buf[start..end]).as_slice()
        );

        // For a canonical file, re-encoding the decoded info value must
        // reproduce the same hash
        let metainfo = bencode::decode(&buf).unwrap();
        let reencoded = metainfo.get(b"info").unwrap().encode();
        assert_eq!(torrent.info_hash(), Sha1::digest(&reencoded).as_slice());
    }

    #[test]
    fn info_span_is_exact() {
        let buf = sample_metainfo(&sample_content(100), 64);
        let (start, end) = info_span(&buf).unwrap();

        // The span starts at the info value and its slice decodes alone
        let info = bencode::decode(&buf[start..end]).unwrap();
        assert!(info.get(b"pieces").is_some());
        // The outer dictionary closes right after the span
        assert_eq!(&buf[end..], b"e");
    }

    #[test]
    fn info_span_requires_info_entry() {
        assert!(info_span(b"d3:foo3:bare").is_err());
        assert!(info_span(b"i42e").is_err());
    }

    #[test]
    fn piece_lengths_cover_the_file() {
        let buf = sample_metainfo(&sample_content(92063), 32768);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        assert_eq!(torrent.piece_len(0), 32768);
        assert_eq!(torrent.piece_len(1), 32768);
        assert_eq!(torrent.piece_len(2), 92063 - 2 * 32768);
        assert_eq!(
            (0..3).map(|i| torrent.piece_len(i) as u64).sum::<u64>(),
            torrent.length()
        );
    }

    #[test]
    fn reject_structurally_broken_metainfo() {
        // pieces not a multiple of 20
        let info = BTreeMap::from([
            (b"length".to_vec(), Value::Int(10)),
            (b"name".to_vec(), Value::string("x")),
            (b"piece length".to_vec(), Value::Int(4)),
            (b"pieces".to_vec(), Value::Bytes(vec![0; 19])),
        ]);
        let metainfo = Value::Dict(BTreeMap::from([
            (b"announce".to_vec(), Value::string("http://t/a")),
            (b"info".to_vec(), Value::Dict(info)),
        ]));
        assert!(matches!(
            Torrent::from_bytes(&metainfo.encode()),
            Err(Error::InvalidTorrent(_))
        ));
    }

    #[test]
    fn from_metadata_uses_magnet_identity() {
        let content = sample_content(5000);
        let buf = sample_metainfo(&content, 2048);
        let (start, end) = info_span(&buf).unwrap();
        let info_bytes = &buf[start..end];

        let magnet = MagnetLink::parse(&format!(
            "magnet:?xt=urn:btih:{}&dn=sample.txt&tr=http%3A%2F%2Ftracker.example%2Fannounce",
            hex::encode(Sha1::digest(info_bytes))
        ))
        .unwrap();

        let torrent = Torrent::from_metadata(&magnet, info_bytes).unwrap();
        assert_eq!(torrent.info_hash(), magnet.info_hash.as_slice());
        assert_eq!(torrent.announce(), "http://tracker.example/announce");
        assert_eq!(torrent.length(), 5000);
        assert_eq!(torrent.pieces_hashes().len(), 3);
    }

    /// A minimal seeder on a loopback socket: handshake, full bitfield,
    /// unchoke on interest, then serve block requests from `content`.
    /// Optionally corrupts the first block it ever serves.
    fn spawn_seeder(
        content: Vec<u8>,
        piece_length: u32,
        info_hash: Vec<u8>,
        corrupt_first_block: bool,
    ) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let corrupted = Arc::new(AtomicBool::new(!corrupt_first_block));

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(sock) = stream else { break };
                let content = content.clone();
                let info_hash = info_hash.clone();
                let corrupted = Arc::clone(&corrupted);
                thread::spawn(move || {
                    serve_peer(sock, content, piece_length, info_hash, corrupted)
                });
            }
        });

        Peer::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn serve_peer(
        mut sock: TcpStream,
        content: Vec<u8>,
        piece_length: u32,
        info_hash: Vec<u8>,
        corrupted: Arc<AtomicBool>,
    ) {
        // Base handshake
        let mut theirs = vec![0u8; 68];
        if sock.read_exact(&mut theirs).is_err() {
            return;
        }
        let hs = Handshake::new(vec![7; 20], info_hash);
        sock.write_all(&hs.serialize()).unwrap();

        // Full bitfield
        let nb_pieces = content.len().div_ceil(piece_length as usize);
        let mut bitfield = vec![0u8; nb_pieces.div_ceil(8)];
        for index in 0..nb_pieces {
            bitfield[index / 8] |= 1 << (7 - (index % 8));
        }
        let frame = Message::new_with_payload(MESSAGE_BITFIELD, bitfield)
            .serialize()
            .unwrap();
        sock.write_all(&frame).unwrap();

        // Serve requests
        loop {
            let Ok(len) = sock.read_u32::<BigEndian>() else {
                return;
            };
            if len == 0 {
                continue;
            }
            let mut body = vec![0u8; len as usize];
            if sock.read_exact(&mut body).is_err() {
                return;
            }

            match body[0] {
                MESSAGE_INTERESTED => {
                    let unchoke = Message::new(MESSAGE_UNCHOKE).serialize().unwrap();
                    sock.write_all(&unchoke).unwrap();
                }
                MESSAGE_REQUEST => {
                    let mut cursor = std::io::Cursor::new(&body[1..]);
                    let index = cursor.read_u32::<BigEndian>().unwrap();
                    let begin = cursor.read_u32::<BigEndian>().unwrap();
                    let block_len = cursor.read_u32::<BigEndian>().unwrap();

                    let offset = index as usize * piece_length as usize + begin as usize;
                    let mut block = content[offset..offset + block_len as usize].to_vec();
                    if !corrupted.swap(true, Ordering::SeqCst) {
                        block[0] ^= 0xff;
                    }

                    let mut payload = Vec::with_capacity(8 + block.len());
                    payload.write_u32::<BigEndian>(index).unwrap();
                    payload.write_u32::<BigEndian>(begin).unwrap();
                    payload.extend_from_slice(&block);
                    let frame = Message::new_with_payload(MESSAGE_PIECE, payload)
                        .serialize()
                        .unwrap();
                    sock.write_all(&frame).unwrap();
                }
                _ => {}
            }
        }
    }

    #[test]
    fn download_assembles_and_verifies_the_file() {
        let content = sample_content(100_000);
        let piece_length = 40_000;
        let buf = sample_metainfo(&content, piece_length);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        let seeder = spawn_seeder(
            content.clone(),
            piece_length,
            torrent.info_hash().to_vec(),
            false,
        );

        let data = torrent.download_from_peers(vec![seeder]).unwrap();
        assert_eq!(data.len() as u64, torrent.length());
        assert_eq!(data, content);

        // Every piece of the assembled buffer hashes to its expected value
        for (index, expected) in torrent.pieces_hashes().iter().enumerate() {
            let begin = index * piece_length as usize;
            let end = (begin + piece_length as usize).min(data.len());
            assert_eq!(Sha1::digest(&data[begin..end]).as_slice(), expected.as_slice());
        }
    }

    #[test]
    fn download_twice_is_byte_identical() {
        let content = sample_content(60_000);
        let piece_length = 16_384;
        let buf = sample_metainfo(&content, piece_length);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        let seeder = spawn_seeder(content, piece_length, torrent.info_hash().to_vec(), false);

        let first = torrent.download_from_peers(vec![seeder]).unwrap();
        let second = torrent.download_from_peers(vec![seeder]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_piece_is_retried_until_it_verifies() {
        let content = sample_content(50_000);
        let piece_length = 20_000;
        let buf = sample_metainfo(&content, piece_length);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        // First served block is corrupted; the retry must recover
        let seeder = spawn_seeder(
            content.clone(),
            piece_length,
            torrent.info_hash().to_vec(),
            true,
        );

        let data = torrent.download_from_peers(vec![seeder]).unwrap();
        assert_eq!(data, content);
    }

    #[test]
    fn download_single_piece() {
        let content = sample_content(100_000);
        let piece_length = 40_000;
        let buf = sample_metainfo(&content, piece_length);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        let seeder = spawn_seeder(
            content.clone(),
            piece_length,
            torrent.info_hash().to_vec(),
            false,
        );

        // The short last piece
        let data = torrent.download_piece_from_peers(vec![seeder], 2).unwrap();
        assert_eq!(data, &content[80_000..]);
    }

    #[test]
    fn download_fails_cleanly_with_no_reachable_peer() {
        let buf = sample_metainfo(&sample_content(1000), 512);
        let torrent = Torrent::from_bytes(&buf).unwrap();

        // A port nothing listens on
        let dead = Peer::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        let result = torrent.download_from_peers(vec![dead]);
        assert!(result.is_err());
    }

    #[test]
    fn piece_index_out_of_range() {
        let buf = sample_metainfo(&sample_content(1000), 512);
        let torrent = Torrent::from_bytes(&buf).unwrap();
        assert!(matches!(
            torrent.download_piece(9),
            Err(Error::InvalidTorrent(_))
        ));
    }
}
