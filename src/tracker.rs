//! # Tracker Client
//!
//! Peer discovery over HTTP. The announce request is a GET whose query
//! carries the infohash and our peer id as percent-encoded raw bytes; the
//! response is a bencoded dictionary whose `peers` entry is the compact
//! 6-bytes-per-peer blob.
//!
//! A `failure reason` key in the response, a non-success HTTP status, or an
//! unparseable body all surface as a tracker failure; an empty peer list is
//! its own error so callers can tell "tracker broken" from "swarm empty".

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use crate::error::{Error, Result};
use crate::peer::{self, Peer};

/// Port advertised in announce requests.
pub const PORT: u16 = 6881;

/// `left` placeholder for magnet bootstrap, where the real length is
/// unknown until the metadata arrives. Trackers reject `left=0`.
pub const LEFT_UNKNOWN: u64 = 1;

const TRACKER_TIMEOUT_SECS: u64 = 15;

/// Bencoded announce response.
#[derive(Debug, Deserialize)]
struct TrackerResponse {
    /// Refresh interval in seconds, unused by one-shot downloads
    #[serde(default)]
    #[allow(dead_code)]
    interval: Option<u64>,
    /// Human-readable rejection from the tracker
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    /// Compact peer list, 6 bytes per peer
    #[serde(default)]
    peers: Option<ByteBuf>,
}

/// Generate a random 20-byte peer id for this client instance.
pub fn generate_peer_id() -> Vec<u8> {
    let mut peer_id: Vec<u8> = vec![0; 20];
    let mut rng = rand::thread_rng();
    for x in peer_id.iter_mut() {
        *x = rng.gen();
    }
    peer_id
}

/// Percent-encode raw bytes for a URL query.
///
/// Unreserved characters (`A-Z a-z 0-9 - _ . ~`) pass through; every other
/// byte becomes `%HH` with uppercase hex.
pub fn urlencode(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
        }
    }

    encoded
}

/// Reverse of [`urlencode`]. Kept alongside it for symmetry with clients
/// that hand-parse query strings.
#[allow(dead_code)]
pub fn urldecode(encoded: &str) -> Result<Vec<u8>> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(Error::Tracker("truncated percent escape".into()));
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok());
            match hex {
                Some(byte) => decoded.push(byte),
                None => return Err(Error::Tracker("invalid percent escape".into())),
            }
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }

    Ok(decoded)
}

/// Build the announce URL.
///
/// # Arguments
///
/// * `announce` - The tracker URL from the metainfo or magnet link.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - The 20-byte id identifying this client.
/// * `left` - Bytes still needed, or [`LEFT_UNKNOWN`] for magnet bootstrap.
///
pub fn build_tracker_url(
    announce: &str,
    info_hash: &[u8],
    peer_id: &[u8],
    left: u64,
) -> Result<String> {
    // Validate the announce URL before decorating it
    if Url::parse(announce).is_err() {
        return Err(Error::Tracker(format!(
            "could not parse announce url {:?}",
            announce
        )));
    }

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        urlencode(info_hash),
        urlencode(peer_id),
        PORT,
        left
    );

    let mut url = announce.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

/// Announce to the tracker and return its peer list, in tracker order.
pub fn request_peers(
    announce: &str,
    info_hash: &[u8],
    peer_id: &[u8],
    left: u64,
) -> Result<Vec<Peer>> {
    let url = build_tracker_url(announce, info_hash, peer_id, left)?;

    debug!("Announcing to tracker {}", announce);

    // Build blocking HTTP client
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(TRACKER_TIMEOUT_SECS))
        .build()
        .map_err(|e| Error::Tracker(format!("could not build http client: {}", e)))?;

    // Send GET request to the tracker
    let response = client
        .get(&url)
        .send()
        .map_err(|e| Error::Tracker(format!("announce request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::Tracker(format!(
            "tracker answered {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .map_err(|e| Error::Tracker(format!("could not read announce response: {}", e)))?;

    parse_response(&body)
}

/// Decode an announce response body into peers.
fn parse_response(body: &[u8]) -> Result<Vec<Peer>> {
    let response: TrackerResponse = de::from_bytes(body)
        .map_err(|e| Error::Tracker(format!("could not decode announce response: {}", e)))?;

    if let Some(reason) = response.failure_reason {
        return Err(Error::Tracker(reason));
    }

    let peers_blob = match response.peers {
        Some(peers_blob) => peers_blob,
        None => return Err(Error::Tracker("announce response missing peers".into())),
    };

    let peers = peer::from_compact(&peers_blob)?;
    if peers.is_empty() {
        return Err(Error::NoPeers);
    }

    info!("Tracker returned {} peers", peers.len());

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_keeps_unreserved_bytes() {
        let unreserved = b"AZaz09-_.~";
        assert_eq!(urlencode(unreserved), "AZaz09-_.~");
    }

    #[test]
    fn urlencode_escapes_everything_else() {
        assert_eq!(urlencode(&[0x00, 0xff, b' ', b'/']), "%00%FF%20%2F");
    }

    #[test]
    fn urlencode_roundtrips_every_byte() {
        let all: Vec<u8> = (0u8..=255).collect();
        assert_eq!(urldecode(&urlencode(&all)).unwrap(), all);
    }

    #[test]
    fn urldecode_rejects_truncated_escape() {
        assert!(urldecode("%4").is_err());
        assert!(urldecode("%zz").is_err());
    }

    #[test]
    fn tracker_url_shape() {
        let info_hash = [0xaau8; 20];
        let peer_id = [b'x'; 20];
        let url =
            build_tracker_url("http://tracker.example/announce", &info_hash, &peer_id, 92063)
                .unwrap();
        assert_eq!(
            url,
            format!(
                "http://tracker.example/announce?info_hash={}&peer_id={}&port=6881&uploaded=0&downloaded=0&left=92063&compact=1",
                "%AA".repeat(20),
                "x".repeat(20),
            )
        );
    }

    #[test]
    fn tracker_url_joins_existing_query() {
        let url = build_tracker_url("http://t.example/ann?key=1", &[0u8; 20], &[b'p'; 20], 5)
            .unwrap();
        assert!(url.starts_with("http://t.example/ann?key=1&info_hash="));
    }

    #[test]
    fn tracker_url_rejects_bad_announce() {
        assert!(build_tracker_url("not a url", &[0u8; 20], &[0u8; 20], 1).is_err());
    }

    #[test]
    fn parse_response_with_peers() {
        let body = b"d8:intervali900e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x00\x50e";
        let peers = parse_response(body).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "10.0.0.2:80");
    }

    #[test]
    fn parse_response_failure_reason() {
        let body = b"d14:failure reason12:unregisterede";
        match parse_response(body) {
            Err(Error::Tracker(reason)) => assert_eq!(reason, "unregistered"),
            other => panic!("expected tracker failure, got {:?}", other),
        }
    }

    #[test]
    fn parse_response_empty_peer_list() {
        let body = b"d8:intervali900e5:peers0:e";
        assert!(matches!(parse_response(body), Err(Error::NoPeers)));
    }

    #[test]
    fn generated_peer_ids_are_20_bytes_and_distinct() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(a.len(), 20);
        assert_eq!(b.len(), 20);
        assert_ne!(a, b);
    }
}
