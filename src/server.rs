//! Local-only HTTP file server plus a WebSocket control channel for the
//! browser UI. Bound to localhost; every handler reaches the registry only
//! through its read-only getters.
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::NodeResult;
use crate::events::SiteEvent;
use crate::registry::SiteRegistry;

pub const VERSION: &str = crate::crypto::VERSION;

#[derive(Clone)]
struct AppState {
    registry: Arc<SiteRegistry>,
    started_at: std::time::Instant,
    data_root: std::path::PathBuf,
}

/// Binds a TCP listener on `port` (0 for ephemeral) and serves until the
/// process is torn down. Returns the bound address so callers/tests can
/// reach an ephemeral port.
pub async fn serve(
    registry: Arc<SiteRegistry>,
    data_root: std::path::PathBuf,
    port: u16,
) -> NodeResult<SocketAddr> {
    let state = AppState {
        registry,
        started_at: std::time::Instant::now(),
        data_root,
    };

    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/{address}/", get(serve_index))
        .route("/{address}/{*inner_path}", get(serve_file))
        .with_state(state);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(crate::error::NodeError::Io)?;
    let addr = listener.local_addr().map_err(crate::error::NodeError::Io)?;
    info!(%addr, "UI server listening");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!(error = %err, "UI server stopped");
        }
    });
    Ok(addr)
}

async fn serve_index(
    State(state): State<AppState>,
    AxumPath(address): AxumPath<String>,
) -> Response {
    serve_path(&state, &address, "index.html").await
}

async fn serve_file(
    State(state): State<AppState>,
    AxumPath((address, inner_path)): AxumPath<(String, String)>,
) -> Response {
    serve_path(&state, &address, &inner_path).await
}

/// Resolves `<data_root>/<address>/<inner_path>`, rejecting any path that
/// escapes the site root via `..` components.
async fn serve_path(state: &AppState, address: &str, inner_path: &str) -> Response {
    let site_root = state.data_root.join(address);
    let requested = site_root.join(inner_path);

    let Ok(canonical_root) = site_root.canonicalize() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(canonical) = requested.canonicalize() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !canonical.starts_with(&canonical_root) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match tokio::fs::read(&canonical).await {
        Ok(bytes) => {
            if inner_path == "index.html" {
                Html(String::from_utf8_lossy(&bytes).to_string()).into_response()
            } else {
                bytes.into_response()
            }
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    cmd: String,
    #[serde(default)]
    to: Option<u64>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Reply {
    cmd: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<u64>,
    result: Value,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut subscription: Option<tokio::sync::broadcast::Receiver<SiteEvent>> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(Message::Text(text))) = incoming else { break };
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(err) => { warn!(error = %err, "malformed ws command"); continue; }
                };
                if envelope.cmd == "subscribe" {
                    if let Some(address) = envelope.params.get("address").and_then(Value::as_str) {
                        let site = state.registry.open(address).await;
                        subscription = Some(site.subscribe());
                    }
                    continue;
                }
                let result = dispatch(&state, &envelope).await;
                let reply = Reply { cmd: "response", to: envelope.to, result };
                if socket.send(Message::Text(serde_json::to_string(&reply).unwrap().into())).await.is_err() {
                    break;
                }
            }
            Some(event) = recv_subscription(&mut subscription) => {
                let payload = serde_json::to_string(&event).unwrap();
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn recv_subscription(
    subscription: &mut Option<tokio::sync::broadcast::Receiver<SiteEvent>>,
) -> Option<SiteEvent> {
    match subscription {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

/// Handles every recognized command except `subscribe` (handled inline by
/// the caller since it mutates the socket's subscription state).
async fn dispatch(state: &AppState, envelope: &Envelope) -> Value {
    match envelope.cmd.as_str() {
        "siteInfo" => {
            let Some(address) = envelope.params.get("address").and_then(Value::as_str) else {
                return serde_json::json!({"error": "missing address"});
            };
            let site = state.registry.open(address).await;
            serde_json::json!({
                "ready": site.is_ready(),
                "success": site.is_success(),
                "peers": site.peer_count(),
                "files-done": site.files_done().await,
                "total-files": site.total_files().await,
            })
        }
        "siteList" => {
            let sites = state.registry.list().await;
            serde_json::to_value(sites).unwrap_or(Value::Null)
        }
        "serverInfo" => serde_json::json!({
            "version": VERSION,
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "data_root": state.data_root.display().to_string(),
        }),
        "siteDelete" => {
            let Some(address) = envelope.params.get("address").and_then(Value::as_str) else {
                return serde_json::json!({"error": "missing address"});
            };
            match state.registry.delete(address).await {
                Ok(()) => serde_json::json!({"deleted": true}),
                Err(err) => serde_json::json!({"error": err.to_string()}),
            }
        }
        "fileQuery" => {
            let (Some(address), Some(glob)) = (
                envelope.params.get("address").and_then(Value::as_str),
                envelope.params.get("glob").and_then(Value::as_str),
            ) else {
                return serde_json::json!({"error": "missing address or glob"});
            };
            let site = state.registry.open(address).await;
            let matches = site.matching_files(glob).await;
            serde_json::json!({"address": address, "matches": matches})
        }
        "dbQuery" => {
            let (Some(address), Some(query)) = (
                envelope.params.get("address").and_then(Value::as_str),
                envelope.params.get("query").and_then(Value::as_str),
            ) else {
                return serde_json::json!({"error": "missing address or query"});
            };
            let site_root = state.data_root.join(address);
            match crate::indexer::run_select(&site_root, query) {
                Ok(rows) => serde_json::json!({"rows": rows}),
                Err(err) => serde_json::json!({"error": err.to_string()}),
            }
        }
        other => serde_json::json!({"error": format!("unrecognized command: {other}")}),
    }
}
