//! # Magnet Link Parsing
//!
//! A magnet link carries enough to bootstrap a download without a metainfo
//! file: the infohash (`xt=urn:btih:<40-hex>`) and usually one or more
//! tracker URLs (`tr=`). The info dictionary itself is then fetched from a
//! peer over the metadata extension.

use url::Url;

use crate::error::{Error, Result};

const BTIH_PREFIX: &str = "urn:btih:";

/// Parsed contents of a `magnet:?` URI.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// 20-byte SHA-1 infohash from the `xt` parameter
    pub info_hash: Vec<u8>,
    /// Tracker URLs in `tr` order; the first one is used for announces
    pub trackers: Vec<String>,
    /// Display name from the `dn` parameter, used as a default filename
    pub display_name: Option<String>,
}

impl MagnetLink {
    /// Parse a magnet URI.
    ///
    /// Only the hex-encoded SHA-1 form of `xt` is supported. Parameters
    /// other than `xt`, `tr` and `dn` are ignored.
    pub fn parse(uri: &str) -> Result<MagnetLink> {
        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(_) => return Err(Error::InvalidMagnet("not a valid URI".into())),
        };

        if url.scheme() != "magnet" {
            return Err(Error::InvalidMagnet(format!(
                "expected magnet scheme, got {:?}",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut trackers = Vec::new();
        let mut display_name = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => info_hash = Some(parse_btih(&value)?),
                "tr" => trackers.push(value.into_owned()),
                "dn" => display_name = Some(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = match info_hash {
            Some(info_hash) => info_hash,
            None => return Err(Error::InvalidMagnet("missing xt parameter".into())),
        };

        Ok(MagnetLink {
            info_hash,
            trackers,
            display_name,
        })
    }

    /// First tracker URL, if the link carried any.
    pub fn announce(&self) -> Option<&str> {
        self.trackers.first().map(String::as_str)
    }

    /// Infohash as 40 lowercase hex characters.
    pub fn info_hash_hex(&self) -> String {
        hex::encode(&self.info_hash)
    }
}

/// Decode an `xt` value of the form `urn:btih:<40-hex>` into 20 raw bytes.
fn parse_btih(xt: &str) -> Result<Vec<u8>> {
    let hash_hex = match xt.strip_prefix(BTIH_PREFIX) {
        Some(rest) => rest,
        None => return Err(Error::InvalidMagnet(format!("unsupported xt {:?}", xt))),
    };

    if hash_hex.len() != 40 {
        return Err(Error::InvalidMagnet(format!(
            "infohash must be 40 hex characters, got {}",
            hash_hex.len()
        )));
    }

    match hex::decode(hash_hex) {
        Ok(bytes) => Ok(bytes),
        Err(_) => Err(Error::InvalidMagnet("infohash is not valid hex".into())),
    }
}
