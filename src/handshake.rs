//! # BitTorrent Handshake
//!
//! The handshake is the first exchange on a fresh peer connection, a fixed
//! 68-byte record:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19)
//! - **pstr**: the protocol identifier `"BitTorrent protocol"`
//! - **reserved**: 8 bytes of capability flags
//! - **info_hash**: 20 bytes, SHA-1 of the raw info dictionary
//! - **peer_id**: 20 bytes identifying the peer
//!
//! ## Reserved bits
//!
//! The only capability this client understands is the extension protocol
//! (BEP-10): bit `0x10` of reserved byte index 5. It is advertised when we
//! intend to fetch metadata over ut_metadata, and probed on the peer's side
//! before attempting an extended handshake.

use crate::error::{Error, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Reserved byte index carrying the extension-protocol flag.
const EXTENSION_BYTE: usize = 5;
/// Extension-protocol flag within that byte.
const EXTENSION_BIT: u8 = 0x10;

/// One side of the 68-byte handshake exchange.
pub struct Handshake {
    /// Protocol identifier bytes ("BitTorrent protocol")
    pub pstr: Vec<u8>,
    /// 8 reserved capability bytes
    pub reserved: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte identifier of the sending peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build our side of the handshake with all reserved bytes zero.
    pub fn new(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.as_bytes().to_vec(),
            reserved: vec![0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Build our side of the handshake advertising extension-protocol
    /// support, for connections that will carry ut_metadata traffic.
    pub fn with_extensions(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        let mut handshake = Handshake::new(peer_id, info_hash);
        handshake.reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        handshake
    }

    /// Whether the sending peer set the extension-protocol bit.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize in wire order. Always 49 + pstr length bytes, 68 for the
    /// standard protocol string.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(49 + self.pstr.len());

        serialized.push(self.pstr.len() as u8);
        serialized.extend_from_slice(&self.pstr);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }
}

/// Deserialize the body of a received handshake.
///
/// # Arguments
///
/// * `buf` - Everything after the pstrlen byte, `48 + pstrlen` bytes.
/// * `pstrlen` - The length prefix already read off the wire.
///
pub fn deserialize_handshake(buf: &[u8], pstrlen: usize) -> Result<Handshake> {
    if buf.len() != pstrlen + 48 {
        return Err(Error::PeerProtocol(format!(
            "handshake body has {} bytes, expected {}",
            buf.len(),
            pstrlen + 48
        )));
    }

    let pstr = buf[0..pstrlen].to_vec();
    let reserved = buf[pstrlen..(pstrlen + 8)].to_vec();
    let info_hash = buf[(pstrlen + 8)..(pstrlen + 28)].to_vec();
    let peer_id = buf[(pstrlen + 28)..(pstrlen + 48)].to_vec();

    Ok(Handshake {
        pstr,
        reserved,
        info_hash,
        peer_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ids() -> (Vec<u8>, Vec<u8>) {
        ((0..20).collect(), (20..40).collect())
    }

    #[test]
    fn serialized_record_is_68_bytes() {
        let (peer_id, info_hash) = sample_ids();
        let wire = Handshake::new(peer_id.clone(), info_hash.clone()).serialize();
        assert_eq!(wire.len(), 68);
        assert_eq!(wire[0], 19);
        assert_eq!(&wire[1..20], PROTOCOL_ID.as_bytes());
        assert_eq!(&wire[20..28], &[0u8; 8]);
        assert_eq!(&wire[28..48], info_hash.as_slice());
        assert_eq!(&wire[48..68], peer_id.as_slice());
    }

    #[test]
    fn extension_bit_lands_in_reserved_byte_five() {
        let (peer_id, info_hash) = sample_ids();
        let wire = Handshake::with_extensions(peer_id, info_hash).serialize();
        assert_eq!(wire[20 + EXTENSION_BYTE], EXTENSION_BIT);
    }

    #[test]
    fn roundtrip_through_deserialize() {
        let (peer_id, info_hash) = sample_ids();
        let wire = Handshake::with_extensions(peer_id.clone(), info_hash.clone()).serialize();
        let parsed = deserialize_handshake(&wire[1..], wire[0] as usize).unwrap();
        assert_eq!(parsed.pstr, PROTOCOL_ID.as_bytes());
        assert_eq!(parsed.info_hash, info_hash);
        assert_eq!(parsed.peer_id, peer_id);
        assert!(parsed.supports_extensions());
    }

    #[test]
    fn plain_handshake_advertises_nothing() {
        let (peer_id, info_hash) = sample_ids();
        assert!(!Handshake::new(peer_id, info_hash).supports_extensions());
    }

    #[test]
    fn reject_short_body() {
        assert!(deserialize_handshake(&[0u8; 40], 19).is_err());
    }
}
