//! HTTP/bencode tracker announce.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::crypto;

use super::{parse_compact_peers, PeerEndpoint};

#[derive(Debug, Serialize, Deserialize, Default)]
struct TrackerResponse {
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(untagged)]
enum Peers {
    Compact(#[serde(with = "serde_bytes")] Vec<u8>),
    #[default]
    Absent,
}

/// GETs the tracker with the standard BitTorrent-style query parameters
/// (`info_hash` is non-standard: SHA-1 of the raw address string) and
/// decodes the bencoded response's compact `peers` field.
///
/// Built by hand rather than through `Url::query_pairs_mut`: the binary
/// `info_hash`/`peer_id` fields are already percent-encoded, and handing
/// them to `query_pairs_mut` would percent-encode the `%` signs again.
pub async fn announce(tracker_url: &str, address: &str) -> Result<Vec<PeerEndpoint>> {
    let info_hash = crypto::info_hash(address);
    let peer_id = crypto::generate_peer_id();

    let separator = if tracker_url.contains('?') { "&" } else { "?" };
    let url = format!(
        "{tracker_url}{separator}info_hash={}&peer_id={}&port=0&uploaded=0&downloaded=0&left=0&compact=1&numwant=30&event=started",
        url_encode_bytes(&info_hash),
        url_encode_bytes(peer_id.as_bytes()),
    );

    let response = reqwest::get(&url).await?;
    let bytes = response.bytes().await?;
    let tracker_response: TrackerResponse = serde_bencode::from_bytes(&bytes)
        .map_err(|e| anyhow!("bencode decode error: {e}"))?;

    Ok(match tracker_response.peers {
        Peers::Compact(bytes) => parse_compact_peers(&bytes),
        Peers::Absent => Vec::new(),
    })
}

/// RFC 3986 percent-encoding of unreserved-excluded bytes, used for the
/// binary `info_hash` and `peer_id` query parameters.
fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_leaves_unreserved_alone() {
        assert_eq!(url_encode_bytes(b"abc-._~"), "abc-._~");
    }

    #[test]
    fn url_encode_escapes_binary() {
        assert_eq!(url_encode_bytes(&[0x00, 0xFF]), "%00%FF");
    }

    #[test]
    fn decodes_bencoded_compact_peers() {
        let mut peers_bytes = Vec::new();
        peers_bytes.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        let encoded = serde_bencode::to_bytes(&TrackerResponse {
            interval: 1800,
            peers: Peers::Compact(peers_bytes),
        })
        .unwrap();
        let decoded: TrackerResponse = serde_bencode::from_bytes(&encoded).unwrap();
        match decoded.peers {
            Peers::Compact(bytes) => assert_eq!(parse_compact_peers(&bytes).len(), 1),
            Peers::Absent => panic!("expected compact peers"),
        }
    }
}
