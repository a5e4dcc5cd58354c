//! Domain error types shared across the crate.
//!
//! Library code that callers branch on returns `NodeError`; call sites that
//! only need to propagate a failure (CLI bootstrap, the UI server's request
//! handlers) use `anyhow::Result` and let `#[from]` do the conversion.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol decode error: {0}")]
    Decode(String),

    #[error("digest mismatch for {inner_path}: expected {expected}, got {actual}")]
    DigestMismatch {
        inner_path: String,
        expected: String,
        actual: String,
    },

    #[error("no peers discovered for site {0}")]
    NoPeers(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("indexing error: {0}")]
    Indexing(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;
