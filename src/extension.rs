//! # Metadata Exchange
//!
//! BEP-10 extension protocol plus the BEP-9 ut_metadata extension, used to
//! fetch the info dictionary from a peer when all we hold is a magnet link.
//!
//! The dance: both sides advertise extension support in the base handshake
//! (reserved bit), then swap extended handshakes (message id 20, extension
//! id 0) whose payload maps extension names to the ids each side chose.
//! Metadata then moves in 16 KiB pieces, each answered with a bencoded
//! header followed immediately by the raw bytes.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::client::Client;
use crate::error::{Error, Result};
use crate::message::*;

/// Extension id we advertise for ut_metadata; peers address data replies
/// to it.
pub const LOCAL_METADATA_ID: u8 = 1;

/// Extension id 0 is reserved for the extended handshake itself.
const HANDSHAKE_EXTENSION_ID: u8 = 0;

/// Metadata moves in pieces of this size; only the last may be short.
pub const METADATA_PIECE_SIZE: usize = 16384;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

/// What the peer told us in its extended handshake.
#[derive(Debug, Clone)]
pub struct PeerExtensions {
    /// Every extension the peer advertised, name to extension id
    pub extensions: BTreeMap<String, u8>,
    /// The id the peer chose for ut_metadata; ours to use when requesting
    pub metadata_id: u8,
    /// Size of the info dictionary, when the peer includes it
    pub metadata_size: Option<u64>,
}

/// Payload of our extended handshake: `{"m": {"ut_metadata": 1}}`.
fn handshake_payload() -> Vec<u8> {
    let m = BTreeMap::from([(
        b"ut_metadata".to_vec(),
        Value::Int(LOCAL_METADATA_ID as i64),
    )]);
    Value::Dict(BTreeMap::from([(b"m".to_vec(), Value::Dict(m))])).encode()
}

/// Send our extended handshake.
pub fn send_handshake(client: &mut Client) -> Result<()> {
    client.send_extended(HANDSHAKE_EXTENSION_ID, handshake_payload())
}

/// Wait for the peer's extended handshake and extract its ut_metadata id.
///
/// Bitfield, have and choke-state messages arriving first are absorbed into
/// the client's session state, since peers order these freely.
pub fn read_handshake(client: &mut Client) -> Result<PeerExtensions> {
    loop {
        let message = client.read_message()?;
        match message.id {
            MESSAGE_KEEPALIVE => continue,
            MESSAGE_BITFIELD => client.set_bitfield(message.payload),
            MESSAGE_HAVE => client.read_have(&message)?,
            MESSAGE_CHOKE => client.read_choke(),
            MESSAGE_UNCHOKE => client.read_unchoke(),
            MESSAGE_EXTENDED => {
                let (extension_id, payload) = split_extended(&message)?;
                if extension_id != HANDSHAKE_EXTENSION_ID {
                    return Err(Error::PeerProtocol(format!(
                        "peer {} sent extension {} before its extended handshake",
                        client.peer(),
                        extension_id
                    )));
                }
                return parse_handshake(payload, client.peer());
            }
            id => {
                debug!(
                    "Ignoring message id {} from peer {} while waiting for extended handshake",
                    id,
                    client.peer()
                );
            }
        }
    }
}

fn parse_handshake(payload: &[u8], peer: crate::peer::Peer) -> Result<PeerExtensions> {
    let (dict, _) = bencode::decode_prefix(payload)?;

    // The "m" entry maps extension names to the ids the peer chose
    let mut extensions = BTreeMap::new();
    if let Some(m) = dict.get(b"m").and_then(Value::as_dict) {
        for (name, id) in m {
            if let Some(id) = id.as_int().filter(|id| (1..=255).contains(id)) {
                extensions.insert(String::from_utf8_lossy(name).into_owned(), id as u8);
            }
        }
    }

    let metadata_id = match extensions.get("ut_metadata") {
        Some(&id) => id,
        None => {
            return Err(Error::PeerProtocol(format!(
                "peer {} does not offer ut_metadata",
                peer
            )))
        }
    };

    let metadata_size = dict
        .get(b"metadata_size")
        .and_then(Value::as_int)
        .filter(|size| *size > 0)
        .map(|size| size as u64);

    debug!("Peer {} speaks ut_metadata as extension {}", peer, metadata_id);

    Ok(PeerExtensions {
        extensions,
        metadata_id,
        metadata_size,
    })
}

/// Ask for metadata piece `piece`: `{"msg_type": 0, "piece": k}` addressed
/// to the peer's ut_metadata id.
pub fn request_metadata_piece(client: &mut Client, metadata_id: u8, piece: u64) -> Result<()> {
    let request = Value::Dict(BTreeMap::from([
        (b"msg_type".to_vec(), Value::Int(MSG_TYPE_REQUEST)),
        (b"piece".to_vec(), Value::Int(piece as i64)),
    ]));
    client.send_extended(metadata_id, request.encode())
}

/// Wait for one metadata data message and return (piece, total_size, bytes).
///
/// The payload is a bencoded header dict followed by the raw piece bytes;
/// the header's encoded length locates the split.
fn read_metadata_data(client: &mut Client) -> Result<(u64, u64, Vec<u8>)> {
    loop {
        let message = client.read_message()?;
        match message.id {
            MESSAGE_KEEPALIVE => continue,
            MESSAGE_BITFIELD => client.set_bitfield(message.payload),
            MESSAGE_HAVE => client.read_have(&message)?,
            MESSAGE_CHOKE => client.read_choke(),
            MESSAGE_UNCHOKE => client.read_unchoke(),
            MESSAGE_EXTENDED => {
                let (extension_id, payload) = split_extended(&message)?;
                if extension_id != LOCAL_METADATA_ID {
                    debug!(
                        "Ignoring extension {} message from peer {}",
                        extension_id,
                        client.peer()
                    );
                    continue;
                }

                let (header, consumed) = bencode::decode_prefix(payload)?;
                let msg_type = header.get(b"msg_type").and_then(Value::as_int);
                match msg_type {
                    Some(MSG_TYPE_DATA) => {}
                    Some(MSG_TYPE_REJECT) => {
                        return Err(Error::PeerProtocol(format!(
                            "peer {} rejected the metadata request",
                            client.peer()
                        )))
                    }
                    _ => {
                        return Err(Error::PeerProtocol(format!(
                            "peer {} sent an unexpected ut_metadata message",
                            client.peer()
                        )))
                    }
                }

                let piece = header.get(b"piece").and_then(Value::as_int).unwrap_or(-1);
                let total_size = header.get(b"total_size").and_then(Value::as_int);
                let total_size = match total_size {
                    Some(total_size) if total_size > 0 => total_size as u64,
                    _ => {
                        return Err(Error::PeerProtocol(format!(
                            "peer {} sent metadata without a total_size",
                            client.peer()
                        )))
                    }
                };
                if piece < 0 {
                    return Err(Error::PeerProtocol(format!(
                        "peer {} sent metadata without a piece index",
                        client.peer()
                    )));
                }

                return Ok((piece as u64, total_size, payload[consumed..].to_vec()));
            }
            id => debug!(
                "Ignoring message id {} from peer {} while fetching metadata",
                id,
                client.peer()
            ),
        }
    }
}

/// Fetch the whole info dictionary from a peer and verify it against the
/// magnet infohash. Pieces are requested in order until `total_size` bytes
/// are held.
pub fn fetch_metadata(client: &mut Client, metadata_id: u8, info_hash: &[u8]) -> Result<Vec<u8>> {
    let mut metadata: Vec<u8> = Vec::new();
    let mut total_size: Option<u64> = None;

    for piece in 0.. {
        request_metadata_piece(client, metadata_id, piece)?;
        let (got_piece, announced_size, bytes) = read_metadata_data(client)?;

        if got_piece != piece {
            return Err(Error::PeerProtocol(format!(
                "peer {} answered metadata piece {} to a request for {}",
                client.peer(),
                got_piece,
                piece
            )));
        }
        if bytes.is_empty() {
            return Err(Error::PeerProtocol(format!(
                "peer {} sent an empty metadata piece",
                client.peer()
            )));
        }

        // All replies must agree on the size
        let size = *total_size.get_or_insert(announced_size);
        if size != announced_size {
            return Err(Error::PeerProtocol(format!(
                "peer {} changed total_size from {} to {}",
                client.peer(),
                size,
                announced_size
            )));
        }

        metadata.extend_from_slice(&bytes);
        if metadata.len() as u64 >= size {
            break;
        }

        // Every piece but the last is exactly 16 KiB
        if bytes.len() != METADATA_PIECE_SIZE {
            return Err(Error::PeerProtocol(format!(
                "peer {} sent a short metadata piece before total_size",
                client.peer()
            )));
        }
    }

    let size = total_size.unwrap_or(0);
    if metadata.len() as u64 != size {
        return Err(Error::PeerProtocol(format!(
            "metadata reassembly produced {} bytes, expected {}",
            metadata.len(),
            size
        )));
    }

    // Integrity gate: the metadata must hash to the magnet's infohash
    let digest = Sha1::digest(&metadata);
    if digest.as_slice() != info_hash {
        return Err(Error::HashMismatch("fetched metadata".into()));
    }

    info!("Fetched and verified {} bytes of metadata", metadata.len());

    Ok(metadata)
}

/// Split an extended message into its extension id and payload.
fn split_extended(message: &Message) -> Result<(u8, &[u8])> {
    match message.payload.split_first() {
        Some((&extension_id, payload)) => Ok((extension_id, payload)),
        None => Err(Error::PeerProtocol("empty extended message".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Handshake;
    use crate::peer::Peer;
    use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn handshake_payload_shape() {
        assert_eq!(handshake_payload(), b"d1:md11:ut_metadatai1eee");
    }

    #[test]
    fn request_payload_shape() {
        let request = Value::Dict(BTreeMap::from([
            (b"msg_type".to_vec(), Value::Int(MSG_TYPE_REQUEST)),
            (b"piece".to_vec(), Value::Int(3)),
        ]));
        assert_eq!(request.encode(), b"d8:msg_typei0e5:piecei3ee");
    }

    /// A scripted peer on a loopback socket: accepts the base handshake,
    /// answers the extended handshake, then serves metadata pieces.
    fn scripted_metadata_peer(
        info_hash: Vec<u8>,
        metadata: Vec<u8>,
    ) -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            // Base handshake
            let mut theirs = vec![0u8; 68];
            sock.read_exact(&mut theirs).unwrap();
            sock.write_all(&Handshake::with_extensions(vec![9; 20], info_hash).serialize())
                .unwrap();

            // Their extended handshake, then ours with metadata_size
            let (id, payload) = read_frame(&mut sock);
            assert_eq!(id, MESSAGE_EXTENDED);
            assert_eq!(payload[0], HANDSHAKE_EXTENSION_ID);

            let reply = Value::Dict(BTreeMap::from([
                (
                    b"m".to_vec(),
                    Value::Dict(BTreeMap::from([(b"ut_metadata".to_vec(), Value::Int(42))])),
                ),
                (
                    b"metadata_size".to_vec(),
                    Value::Int(metadata.len() as i64),
                ),
            ]));
            write_extended(&mut sock, HANDSHAKE_EXTENSION_ID, reply.encode());

            // Serve metadata pieces as requested
            let total = metadata.len();
            loop {
                let (id, payload) = read_frame(&mut sock);
                assert_eq!(id, MESSAGE_EXTENDED);
                assert_eq!(payload[0], 42);
                let (request, _) = bencode::decode_prefix(&payload[1..]).unwrap();
                let piece = request.get(b"piece").and_then(Value::as_int).unwrap() as usize;

                let start = piece * METADATA_PIECE_SIZE;
                let end = (start + METADATA_PIECE_SIZE).min(total);
                let header = Value::Dict(BTreeMap::from([
                    (b"msg_type".to_vec(), Value::Int(MSG_TYPE_DATA)),
                    (b"piece".to_vec(), Value::Int(piece as i64)),
                    (b"total_size".to_vec(), Value::Int(total as i64)),
                ]));
                let mut body = header.encode();
                body.extend_from_slice(&metadata[start..end]);
                write_extended(&mut sock, LOCAL_METADATA_ID, body);

                if end == total {
                    break;
                }
            }
        });

        (addr, handle)
    }

    fn read_frame(sock: &mut TcpStream) -> (u8, Vec<u8>) {
        let len = sock.read_u32::<BigEndian>().unwrap() as usize;
        let mut body = vec![0u8; len];
        sock.read_exact(&mut body).unwrap();
        (body[0], body[1..].to_vec())
    }

    fn write_extended(sock: &mut TcpStream, extension_id: u8, payload: Vec<u8>) {
        sock.write_u32::<BigEndian>(2 + payload.len() as u32).unwrap();
        sock.write_all(&[MESSAGE_EXTENDED, extension_id]).unwrap();
        sock.write_all(&payload).unwrap();
    }

    fn fetch_from_scripted_peer(metadata: Vec<u8>) -> Result<Vec<u8>> {
        let info_hash = Sha1::digest(&metadata).to_vec();
        let (addr, handle) = scripted_metadata_peer(info_hash.clone(), metadata);

        let peer = Peer::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, addr.port()));
        let mut client = Client::connect(peer).unwrap();
        client
            .handshake_with_peer(&[1; 20], &info_hash, true)
            .unwrap();

        send_handshake(&mut client)?;
        let extensions = read_handshake(&mut client)?;
        assert_eq!(extensions.metadata_id, 42);

        let fetched = fetch_metadata(&mut client, extensions.metadata_id, &info_hash);
        handle.join().unwrap();
        fetched
    }

    #[test]
    fn fetch_single_piece_metadata() {
        let metadata = b"d6:lengthi92063e4:name10:sample.txt12:piece lengthi32768ee".to_vec();
        assert_eq!(fetch_from_scripted_peer(metadata.clone()).unwrap(), metadata);
    }

    #[test]
    fn fetch_multi_piece_metadata() {
        // Three pieces: 16 KiB, 16 KiB, and a short tail
        let metadata: Vec<u8> = (0..METADATA_PIECE_SIZE * 2 + 777)
            .map(|i| (i % 251) as u8)
            .collect();
        assert_eq!(fetch_from_scripted_peer(metadata.clone()).unwrap(), metadata);
    }

    #[test]
    fn metadata_hash_gate() {
        let metadata = b"d4:name4:evile".to_vec();
        let lying_hash = vec![0u8; 20];
        let (addr, handle) = scripted_metadata_peer(lying_hash.clone(), metadata);

        let peer = Peer::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, addr.port()));
        let mut client = Client::connect(peer).unwrap();
        client
            .handshake_with_peer(&[1; 20], &lying_hash, true)
            .unwrap();
        send_handshake(&mut client).unwrap();
        let extensions = read_handshake(&mut client).unwrap();

        let result = fetch_metadata(&mut client, extensions.metadata_id, &lying_hash);
        assert!(matches!(result, Err(Error::HashMismatch(_))));
        handle.join().unwrap();
    }

    #[test]
    fn parse_handshake_reads_id_and_size() {
        let payload = Value::Dict(BTreeMap::from([
            (
                b"m".to_vec(),
                Value::Dict(BTreeMap::from([(b"ut_metadata".to_vec(), Value::Int(3))])),
            ),
            (b"metadata_size".to_vec(), Value::Int(132)),
        ]))
        .encode();

        let peer = Peer::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        let extensions = parse_handshake(&payload, peer).unwrap();
        assert_eq!(extensions.metadata_id, 3);
        assert_eq!(extensions.metadata_size, Some(132));
    }

    #[test]
    fn parse_handshake_requires_ut_metadata() {
        // Peer advertises extensions but no ut_metadata entry
        let payload = Value::Dict(BTreeMap::from([(
            b"m".to_vec(),
            Value::Dict(BTreeMap::new()),
        )]))
        .encode();

        let peer = Peer::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        assert!(matches!(
            parse_handshake(&payload, peer),
            Err(Error::PeerProtocol(_))
        ));
    }
}
