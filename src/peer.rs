//! # Peer Addresses
//!
//! Peers come back from the tracker in a compact binary blob: 6 bytes per
//! peer, the IPv4 address in network order followed by the port in network
//! order.

use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddrV4};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

const PEER_SIZE: usize = 6;

/// Network address of a peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port the peer listens on
    pub port: u16,
}

impl Peer {
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

impl From<SocketAddrV4> for Peer {
    fn from(addr: SocketAddrV4) -> Peer {
        Peer {
            ip: *addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list, preserving tracker order.
///
/// # Arguments
///
/// * `blob` - Concatenated 6-byte entries from the tracker's `peers` field.
///
pub fn from_compact(blob: &[u8]) -> Result<Vec<Peer>> {
    // Check tracker peers are valid
    if blob.len() % PEER_SIZE != 0 {
        return Err(Error::Tracker(format!(
            "compact peer list has odd length {}",
            blob.len()
        )));
    }

    let mut peers = Vec::with_capacity(blob.len() / PEER_SIZE);
    for entry in blob.chunks_exact(PEER_SIZE) {
        // Read peer IP address
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);

        // Read peer port
        let mut port_cursor = Cursor::new(&entry[4..6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer { ip, port });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compact_list() {
        let blob = vec![192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = from_compact(&blob).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].to_string(), "10.0.0.2:80");
    }

    #[test]
    fn parse_empty_list() {
        assert!(from_compact(&[]).unwrap().is_empty());
    }

    #[test]
    fn entry_count_matches_input_length() {
        let blob: Vec<u8> = (0..(PEER_SIZE * 7) as u8).collect();
        assert_eq!(from_compact(&blob).unwrap().len(), 7);
    }

    #[test]
    fn reject_truncated_list() {
        assert!(from_compact(&[127, 0, 0, 1, 0]).is_err());
    }
}
