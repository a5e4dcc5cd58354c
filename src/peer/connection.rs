//! TLS dial, handshake, and the per-peer frame reader/writer.
use std::io::Cursor;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::crypto::ClientCredential;
use crate::error::{NodeError, NodeResult};
use crate::task::FileTask;

use super::protocol::{Request, Response};
use super::{Peer, PeerReply, PeerState, SharedPeer};

const TLS_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(20);
const READ_CHUNK: usize = 16 * 1024;

pub type FrameWriter = TlsStream<TcpStream>;

/// Accepts any server certificate: the protocol authenticates peers by the
/// shared site address, not by PKI.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds the TLS client config: self-signed client cert, server
/// verification disabled, restricted to the two AES-128-GCM ECDHE suites.
fn build_tls_connector(credential: &ClientCredential) -> NodeResult<TlsConnector> {
    let suites = [
        rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        rustls::crypto::ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ];
    let provider = Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: suites.to_vec(),
        ..rustls::crypto::ring::default_provider()
    });

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| NodeError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(
            vec![credential.cert_der.clone()],
            credential.key_der.clone_key(),
        )
        .map_err(|e| NodeError::Tls(e.to_string()))?;
    config.enable_sni = false;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Dials `ip:port`, completes the TLS handshake and the ZeroNode handshake
/// RPC, and spawns the reader task. Returns a connected, ready-to-use peer.
#[instrument(skip(credential), fields(%ip, %port))]
pub async fn connect(
    ip: IpAddr,
    port: u16,
    sequence: u64,
    credential: &ClientCredential,
    peer_id: &str,
) -> NodeResult<SharedPeer> {
    let peer = Arc::new(Peer::new(ip, port, sequence));
    peer.set_state(PeerState::Connecting);

    let connector = build_tls_connector(credential)?;
    let server_name = ServerName::IpAddress(ip.into());

    let tls_stream = timeout(TLS_DIAL_TIMEOUT, async {
        let tcp = TcpStream::connect((ip, port)).await?;
        tcp.set_nodelay(true).ok();
        let stream = connector.connect(server_name, tcp).await?;
        Ok::<_, std::io::Error>(stream)
    })
    .await
    .map_err(|_| NodeError::Transport("TLS dial timed out".into()))?
    .map_err(|e| NodeError::Transport(e.to_string()))?;

    peer.set_state(PeerState::Connected);
    *peer.writer.lock().await = Some(tls_stream);

    spawn_reader(Arc::clone(&peer));

    let req_id = peer.next_id();
    let req = Request::handshake(req_id, peer_id.to_string(), ip.to_string());
    send_request(&peer, req_id, req).await?;

    Ok(peer)
}

/// Runs the background reader loop for one peer until the connection errs
/// out, at which point the peer transitions to `Disconnected` and every
/// outstanding reply channel is notified of failure.
fn spawn_reader(peer: SharedPeer) {
    tokio::spawn(async move {
        let mut leftover = Vec::new();
        loop {
            match read_frame(&peer, &mut leftover).await {
                Ok((response, buffer)) => {
                    let to = response.to;
                    let mut pending = peer.pending.lock().await;
                    if let Some(tx) = pending.remove(&to) {
                        drop(pending);
                        let _ = tx.send(Ok(PeerReply { response, buffer }));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "peer reader terminating");
                    peer.set_state(PeerState::Disconnected);
                    let mut pending = peer.pending.lock().await;
                    for (_, tx) in pending.drain() {
                        let _ = tx.send(Err(NodeError::Transport(err.to_string())));
                    }
                    return;
                }
            }
        }
    });
}

/// Reads one response frame (header plus any streamed payload) from the
/// peer's TLS stream, using `leftover` as a carry-over buffer between calls.
async fn read_frame(peer: &Peer, leftover: &mut Vec<u8>) -> NodeResult<(Response, Vec<u8>)> {
    let mut writer_guard = peer.writer.lock().await;
    let stream = writer_guard
        .as_mut()
        .ok_or_else(|| NodeError::Transport("peer has no connection".into()))?;

    let (response, header_len) = loop {
        match try_decode_response(leftover) {
            Some(result) => break result,
            None => {
                let mut chunk = vec![0u8; READ_CHUNK];
                let n = timeout(READ_DEADLINE, stream.read(&mut chunk))
                    .await
                    .map_err(|_| NodeError::Transport("read deadline exceeded".into()))?
                    .map_err(|e| NodeError::Transport(e.to_string()))?;
                if n == 0 {
                    return Err(NodeError::Transport("connection closed".into()));
                }
                leftover.extend_from_slice(&chunk[..n]);
            }
        }
    };
    leftover.drain(..header_len);

    let mut buffer = Vec::new();
    if response.stream_bytes > 0 {
        let want = response.stream_bytes as usize;
        while (buffer.len() as u64) < response.stream_bytes {
            if !leftover.is_empty() {
                let take = leftover.len().min(want - buffer.len());
                buffer.extend(leftover.drain(..take));
                continue;
            }
            let mut chunk = vec![0u8; READ_CHUNK];
            let n = timeout(READ_DEADLINE, stream.read(&mut chunk))
                .await
                .map_err(|_| NodeError::Transport("read deadline exceeded".into()))?
                .map_err(|e| NodeError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(NodeError::Transport("connection closed mid-stream".into()));
            }
            leftover.extend_from_slice(&chunk[..n]);
        }
        buffer.truncate(want);
    }
    Ok((response, buffer))
}

/// Attempts to decode one `Response` map from the front of `buf`. Returns
/// `None` if `buf` doesn't yet contain a complete MessagePack value.
fn try_decode_response(buf: &[u8]) -> Option<(Response, usize)> {
    let mut cursor = Cursor::new(buf);
    let value = rmpv::decode::read_value(&mut cursor).ok()?;
    let consumed = cursor.position() as usize;
    let response: Response = rmpv::ext::from_value(value).ok()?;
    Some((response, consumed))
}

/// Serializes and writes `request`, registering a reply channel for its
/// `req_id` before releasing the writer lock, then awaits the reply.
async fn send_request(peer: &Peer, req_id: u64, request: Request) -> NodeResult<PeerReply> {
    let (tx, rx) = oneshot::channel();
    {
        let mut pending = peer.pending.lock().await;
        pending.insert(req_id, tx);
    }
    {
        let mut writer_guard = peer.writer.lock().await;
        let stream = writer_guard
            .as_mut()
            .ok_or_else(|| NodeError::Transport("peer has no connection".into()))?;
        let bytes = rmp_serde::to_vec_named(&request)?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;
    }
    debug!(cmd = request.cmd, req_id, "sent request");
    rx.await
        .map_err(|_| NodeError::Transport("peer disconnected before reply".into()))?
}

/// Sends a `ping` and checks for the expected `"Pong!"` body. Used once
/// right after a successful connect to confirm liveness.
pub async fn ping(peer: &Peer) -> NodeResult<bool> {
    let req_id = peer.next_id();
    let reply = send_request(peer, req_id, Request::ping(req_id)).await?;
    Ok(reply.response.body.as_deref() == Some("Pong!"))
}

/// Downloads one [`FileTask`] from this peer: issues `streamFile` requests
/// until the task's declared size is reached, then returns the accumulated
/// bytes. Digest verification and persistence happen in the scheduler.
pub async fn download_task(peer: &Peer, task: &mut FileTask) -> NodeResult<()> {
    task.mark_started();
    peer.inc_active();
    let result = download_task_inner(peer, task).await;
    peer.dec_active();
    result
}

async fn download_task_inner(peer: &Peer, task: &mut FileTask) -> NodeResult<()> {
    loop {
        let req_id = peer.next_id();
        let request = Request::stream_file(
            req_id,
            task.site_address.clone(),
            task.inner_path.clone(),
            task.offset_bytes,
        );
        let reply = send_request(peer, req_id, request).await?;
        task.append_chunk(reply.response.location, &reply.buffer);
        if task.is_complete() {
            return Ok(());
        }
    }
}
