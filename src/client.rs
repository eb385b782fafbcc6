//! # Peer Connection
//!
//! One [`Client`] owns one TCP connection to one remote peer and speaks the
//! peer wire protocol over it: the 68-byte handshake, then length-prefixed
//! messages.
//!
//! ## Connection states
//!
//! A fresh connection starts choked; requests are only answered after the
//! peer unchokes us. The peer's bitfield tells us which pieces it can serve
//! (bit 7 of byte 0 is piece 0, MSB first within each byte).
//!
//! ## Failure policy
//!
//! Framing problems (short reads, oversized frames, EOF mid-frame) are
//! fatal to the connection. The scheduler handles recovery by re-queueing
//! whatever piece the owning worker held.

use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::handshake::{deserialize_handshake, Handshake};
use crate::message::*;
use crate::peer::Peer;
use crate::piece::{PieceWork, BLOCK_SIZE};

const CONNECT_TIMEOUT_SECS: u64 = 15;

/// A connection to a remote peer.
pub struct Client {
    /// Address of the remote peer
    peer: Peer,
    /// TCP stream to the peer
    conn: TcpStream,
    /// Bitfield of the pieces the peer claims to have
    bitfield: Vec<u8>,
    /// Whether the peer currently has us choked
    choked: bool,
}

impl Client {
    /// Open a TCP connection to a peer with a bounded timeout.
    pub fn connect(peer: Peer) -> Result<Client> {
        let addr = SocketAddr::V4(peer.socket_addr());
        let conn = match TcpStream::connect_timeout(&addr, Duration::from_secs(CONNECT_TIMEOUT_SECS))
        {
            Ok(conn) => conn,
            Err(_) => return Err(Error::PeerProtocol(format!("could not connect to {}", peer))),
        };

        debug!("Connected to peer {}", peer);

        Ok(Client {
            peer,
            conn,
            bitfield: vec![],
            choked: true,
        })
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Whether the peer currently has us choked.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Set read and write timeouts on the connection.
    pub fn set_connection_timeout(&self, secs: u64) -> Result<()> {
        self.conn
            .set_write_timeout(Some(Duration::from_secs(secs)))?;
        self.conn
            .set_read_timeout(Some(Duration::from_secs(secs)))?;
        Ok(())
    }

    /// Exchange handshakes with the peer.
    ///
    /// Sends ours, reads theirs, and checks that both sides talk about the
    /// same torrent. Returns the peer's handshake so callers can display
    /// the remote peer id and probe the extension-protocol bit.
    pub fn handshake_with_peer(
        &mut self,
        peer_id: &[u8],
        info_hash: &[u8],
        extensions: bool,
    ) -> Result<Handshake> {
        // Send our handshake
        let handshake = if extensions {
            Handshake::with_extensions(peer_id.to_vec(), info_hash.to_vec())
        } else {
            Handshake::new(peer_id.to_vec(), info_hash.to_vec())
        };
        self.conn.write_all(&handshake.serialize())?;

        // Read the peer's handshake
        let pstrlen = self.read_handshake_len()?;
        let mut handshake_buf: Vec<u8> = vec![0; 48 + pstrlen];
        if self.conn.read_exact(&mut handshake_buf).is_err() {
            return Err(Error::PeerProtocol(format!(
                "could not read handshake from {}",
                self.peer
            )));
        }

        // Both sides must reference the same torrent
        let peer_handshake = deserialize_handshake(&handshake_buf, pstrlen)?;
        if peer_handshake.info_hash != info_hash {
            return Err(Error::PeerProtocol(format!(
                "peer {} answered with a different infohash",
                self.peer
            )));
        }

        debug!("Handshake complete with peer {}", self.peer);

        Ok(peer_handshake)
    }

    /// Read the pstrlen byte that opens the peer's handshake.
    fn read_handshake_len(&mut self) -> Result<usize> {
        let mut buf = [0; 1];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(Error::PeerProtocol(format!(
                "could not read handshake length from {}",
                self.peer
            )));
        }

        let pstrlen = buf[0];
        if pstrlen == 0 {
            return Err(Error::PeerProtocol(format!(
                "peer {} sent an empty protocol string",
                self.peer
            )));
        }

        Ok(pstrlen as usize)
    }

    /// Read one length-prefixed message.
    pub fn read_message(&mut self) -> Result<Message> {
        let message_len = self.read_message_len()?;

        // Length zero is a keep-alive
        if message_len == 0 {
            debug!("Receive KEEP_ALIVE from peer {}", self.peer);
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }

        if message_len > MESSAGE_LEN_MAX {
            return Err(Error::PeerProtocol(format!(
                "peer {} announced an oversized frame of {} bytes",
                self.peer, message_len
            )));
        }

        let mut message_buf: Vec<u8> = vec![0; message_len];
        if self.conn.read_exact(&mut message_buf).is_err() {
            return Err(Error::PeerProtocol(format!(
                "connection to {} dropped mid-frame",
                self.peer
            )));
        }

        deserialize_message(&message_buf)
    }

    /// Read the 4-byte big-endian length prefix.
    fn read_message_len(&mut self) -> Result<usize> {
        let mut buf = [0; 4];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(Error::PeerProtocol(format!(
                "could not read message length from {}",
                self.peer
            )));
        }

        let mut cursor = Cursor::new(buf);
        let message_len = cursor.read_u32::<BigEndian>()?;

        Ok(message_len as usize)
    }

    /// Whether the peer claims to have a piece.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index < self.bitfield.len() {
            return self.bitfield[byte_index] >> (7 - offset) & 1 != 0;
        }
        false
    }

    /// Mark a piece as available in the peer's bitfield, growing it if a
    /// `have` message references a piece past the current capacity.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }
        self.bitfield[byte_index] |= 1 << (7 - offset);
    }

    /// Install a bitfield payload received outside [`Client::read_bitfield`],
    /// e.g. while waiting for an extension handshake.
    pub fn set_bitfield(&mut self, payload: Vec<u8>) {
        self.bitfield = payload;
    }

    /// Read the peer's bitfield, which arrives right after the handshake.
    /// Keep-alives before it are tolerated.
    pub fn read_bitfield(&mut self) -> Result<()> {
        loop {
            let message = self.read_message()?;
            match message.id {
                MESSAGE_KEEPALIVE => continue,
                MESSAGE_BITFIELD => {
                    debug!("Receive MESSAGE_BITFIELD from peer {}", self.peer);
                    self.bitfield = message.payload;
                    return Ok(());
                }
                id => {
                    return Err(Error::PeerProtocol(format!(
                        "peer {} sent message id {} before its bitfield",
                        self.peer, id
                    )))
                }
            }
        }
    }

    pub fn read_choke(&mut self) {
        debug!("Receive MESSAGE_CHOKE from peer {}", self.peer);
        self.choked = true
    }

    pub fn read_unchoke(&mut self) {
        debug!("Receive MESSAGE_UNCHOKE from peer {}", self.peer);
        self.choked = false
    }

    /// Tell the peer we want to download.
    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Send MESSAGE_INTERESTED to peer {}", self.peer);
        self.send(Message::new(MESSAGE_INTERESTED))
    }

    /// Tell the peer it may request from us. Most peers expect this
    /// courtesy before unchoking in return.
    pub fn send_unchoke(&mut self) -> Result<()> {
        debug!("Send MESSAGE_UNCHOKE to peer {}", self.peer);
        self.send(Message::new(MESSAGE_UNCHOKE))
    }

    /// Announce that we completed a piece.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;

        debug!("Send MESSAGE_HAVE {} to peer {}", index, self.peer);
        self.send(Message::new_with_payload(MESSAGE_HAVE, payload))
    }

    /// Record a piece the peer just announced.
    pub fn read_have(&mut self, message: &Message) -> Result<()> {
        if message.payload.len() != 4 {
            return Err(Error::PeerProtocol(format!(
                "peer {} sent a malformed have message",
                self.peer
            )));
        }

        let mut payload_cursor = Cursor::new(&message.payload);
        let index = payload_cursor.read_u32::<BigEndian>()?;
        debug!("Receive MESSAGE_HAVE {} from peer {}", index, self.peer);

        self.set_piece(index);

        Ok(())
    }

    /// Request one block of a piece.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;
        payload.write_u32::<BigEndian>(begin)?;
        payload.write_u32::<BigEndian>(length)?;

        debug!(
            "Send MESSAGE_REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send(Message::new_with_payload(MESSAGE_REQUEST, payload))
    }

    /// Land a received block in the piece buffer.
    ///
    /// A block for some other piece is discarded without error; the peer may
    /// still be flushing requests from an earlier owner of the connection.
    /// A block that oversteps the piece buffer is a protocol violation.
    pub fn read_piece(&mut self, message: &Message, piece_work: &mut PieceWork) -> Result<()> {
        if message.payload.len() < 8 {
            return Err(Error::PeerProtocol(format!(
                "peer {} sent a truncated piece message",
                self.peer
            )));
        }

        let mut payload_cursor = Cursor::new(&message.payload[0..8]);
        let index = payload_cursor.read_u32::<BigEndian>()?;
        let begin = payload_cursor.read_u32::<BigEndian>()?;

        // Stale block from a previous request cycle
        if index != piece_work.index {
            debug!(
                "Discard block for piece {} while downloading {} from peer {}",
                index, piece_work.index, self.peer
            );
            return Ok(());
        }

        let block = &message.payload[8..];
        let block_len = block.len() as u32;

        if begin as u64 + block_len as u64 > piece_work.length as u64 {
            return Err(Error::PeerProtocol(format!(
                "peer {} sent block [{}:{}] past piece length {}",
                self.peer,
                begin,
                begin + block_len,
                piece_work.length
            )));
        }

        debug!(
            "Receive piece {} [{}:{}] from peer {}",
            index,
            begin,
            begin + block_len,
            self.peer
        );

        piece_work.requests = piece_work.requests.saturating_sub(1);

        // A block can arrive twice after a choke forced re-requests;
        // count it only once.
        let block_index = (begin / BLOCK_SIZE) as usize;
        if piece_work.received.get(block_index).copied().unwrap_or(true) {
            debug!(
                "Discard duplicate block [{}:{}] of piece {} from peer {}",
                begin,
                begin + block_len,
                index,
                self.peer
            );
            return Ok(());
        }

        // Land the block
        piece_work.data[begin as usize..(begin + block_len) as usize].copy_from_slice(block);
        piece_work.received[block_index] = true;
        piece_work.downloaded += block_len;

        Ok(())
    }

    /// Send an extended (id 20) message: one extension id byte, then the
    /// extension payload.
    pub fn send_extended(&mut self, extension_id: u8, payload: Vec<u8>) -> Result<()> {
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(extension_id);
        body.extend_from_slice(&payload);

        debug!(
            "Send MESSAGE_EXTENDED ext {} ({} bytes) to peer {}",
            extension_id,
            body.len(),
            self.peer
        );
        self.send(Message::new_with_payload(MESSAGE_EXTENDED, body))
    }

    fn send(&mut self, message: Message) -> Result<()> {
        let encoded = message.serialize()?;
        if self.conn.write_all(&encoded).is_err() {
            return Err(Error::PeerProtocol(format!(
                "could not send message to {}",
                self.peer
            )));
        }
        Ok(())
    }
}
