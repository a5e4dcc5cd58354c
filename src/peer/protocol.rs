//! Wire types for the peer binary RPC: a MessagePack-framed request/response
//! protocol with a closed set of recognized commands, modeled as a tagged
//! sum type rather than a dynamic map.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct HandshakeParams {
    pub version: String,
    pub rev: i64,
    pub protocol: String,
    pub peer_id: String,
    pub fileserver_port: u16,
    pub port_opened: bool,
    pub target_ip: String,
    pub crypt_supported: bool,
    pub crypt: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PingParams {}

#[derive(Debug, Clone, Serialize)]
pub struct StreamFileParams {
    pub site: String,
    pub inner_path: String,
    pub location: u64,
}

/// The closed set of request payloads a peer connection can send.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestParams {
    Handshake(HandshakeParams),
    Ping(PingParams),
    StreamFile(StreamFileParams),
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub cmd: &'static str,
    pub req_id: u64,
    pub params: RequestParams,
}

impl Request {
    pub fn handshake(req_id: u64, peer_id: String, target_ip: String) -> Self {
        Self {
            cmd: "handshake",
            req_id,
            params: RequestParams::Handshake(HandshakeParams {
                version: crate::crypto::VERSION.to_string(),
                rev: crate::crypto::REV,
                protocol: "v2".to_string(),
                peer_id,
                fileserver_port: 0,
                port_opened: false,
                target_ip,
                crypt_supported: true,
                crypt: "tls-rsa".to_string(),
            }),
        }
    }

    pub fn ping(req_id: u64) -> Self {
        Self {
            cmd: "ping",
            req_id,
            params: RequestParams::Ping(PingParams::default()),
        }
    }

    pub fn stream_file(req_id: u64, site: String, inner_path: String, location: u64) -> Self {
        Self {
            cmd: "streamFile",
            req_id,
            params: RequestParams::StreamFile(StreamFileParams {
                site,
                inner_path,
                location,
            }),
        }
    }
}

/// A response header as it arrives over the wire, before any streamed
/// payload bytes have been read. `stream_bytes`, when greater than zero,
/// tells the reader to drain exactly that many raw bytes next.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Response {
    #[serde(default)]
    pub cmd: String,
    pub to: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub stream_bytes: u64,
    #[serde(default)]
    pub location: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_msgpack() {
        let req = Request::ping(42);
        let bytes = rmp_serde::to_vec_named(&req).unwrap();
        let value: rmpv::Value = rmp_serde::from_slice(&bytes).unwrap();
        let to = value
            .as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_str() == Some("req_id"))
            .unwrap()
            .1
            .as_u64()
            .unwrap();
        assert_eq!(to, 42);
    }

    #[test]
    fn response_decodes_stream_bytes() {
        #[derive(Serialize)]
        struct Wire {
            cmd: &'static str,
            to: u64,
            stream_bytes: u64,
            location: u64,
        }
        let wire = Wire {
            cmd: "response",
            to: 7,
            stream_bytes: 100,
            location: 0,
        };
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        let resp: Response = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(resp.to, 7);
        assert_eq!(resp.stream_bytes, 100);
    }
}
