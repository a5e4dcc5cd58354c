//! Tracker clients: resolve one tracker URL to a list of peer endpoints.
//!
//! Both variants share the same surface and the same failure posture: any
//! I/O or decode error returns an empty peer list rather than propagating,
//! so a bad tracker never blocks discovery on the others.
pub mod http;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tracing::{instrument, warn};

pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(20);

/// Compile-time list of trackers this node announces to.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "http://tracker.openbittorrent.com:80/announce",
    "http://open.acgnxtracker.com:80/announce",
    "udp://tracker.coppersurfer.tk:6969",
    "udp://tracker.leechers-paradise.org:6969",
    "udp://9.rarbg.to:2710",
    "udp://exodus.desync.com:6969",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

/// One configured tracker, either HTTP or UDP.
#[derive(Debug, Clone)]
pub enum Tracker {
    Http(String),
    Udp(String),
}

impl Tracker {
    pub fn parse(url: &str) -> Option<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(Tracker::Http(url.to_string()))
        } else if url.starts_with("udp://") {
            Some(Tracker::Udp(url.to_string()))
        } else {
            None
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(u) | Tracker::Udp(u) => u,
        }
    }

    /// Resolves this tracker to a peer list, with a 20s wall-clock budget.
    /// Any failure is swallowed and reported as an empty list.
    #[instrument(skip(self), fields(tracker = self.url()))]
    pub async fn announce(&self, address: &str) -> Vec<PeerEndpoint> {
        let result = tokio::time::timeout(ANNOUNCE_TIMEOUT, async {
            match self {
                Tracker::Http(url) => http::announce(url, address).await,
                Tracker::Udp(url) => udp::announce(url, address).await,
            }
        })
        .await;

        match result {
            Ok(Ok(peers)) => peers,
            Ok(Err(err)) => {
                warn!(error = %err, "tracker announce failed");
                Vec::new()
            }
            Err(_) => {
                warn!("tracker announce timed out");
                Vec::new()
            }
        }
    }
}

/// Decodes a compact peer list: 6-byte records of 4 big-endian IPv4 bytes
/// followed by a 2 big-endian byte port. Records with port 0 are dropped.
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<PeerEndpoint> {
    bytes
        .chunks_exact(6)
        .filter_map(|chunk| {
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            if port == 0 {
                return None;
            }
            let ip = IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]));
            Some(PeerEndpoint { ip, port })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers_and_drops_zero_port() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]); // 127.0.0.1:6881
        bytes.extend_from_slice(&[10, 0, 0, 5, 0, 0]); // port 0, dropped
        bytes.extend_from_slice(&[192, 168, 1, 1, 0x00, 0x50]); // .1:80

        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].port, 80);
    }

    #[test]
    fn tracker_parse_recognizes_scheme() {
        assert!(matches!(
            Tracker::parse("http://example.com/announce"),
            Some(Tracker::Http(_))
        ));
        assert!(matches!(
            Tracker::parse("udp://example.com:6969"),
            Some(Tracker::Udp(_))
        ));
        assert!(Tracker::parse("ftp://example.com").is_none());
    }
}
