//! Progress events a `Site` broadcasts as its download proceeds.
//!
//! The UI server's WebSocket layer is the main consumer: it forwards these
//! onto a subscribed browser socket verbatim.
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SiteEvent {
    PeersAdded(usize),
    FileDone(String),
    FileFailed(String),
}
