//! UDP tracker announce, BEP-15's two-step connect/announce handshake.
use std::time::Duration;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::crypto;

use super::{parse_compact_peers, PeerEndpoint};

const MAGIC_CONNECTION_ID: i64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const EVENT_STARTED: i32 = 2;
const READ_TIMEOUT: Duration = Duration::from_secs(20);

pub async fn announce(tracker_url: &str, address: &str) -> Result<Vec<PeerEndpoint>> {
    let host = tracker_url
        .strip_prefix("udp://")
        .ok_or_else(|| anyhow!("not a udp:// tracker URL"))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(host).await?;
    let local_port = socket.local_addr()?.port();

    let transaction_id: i32 = rand::rng().random();

    let connection_id = timeout(READ_TIMEOUT, connect(&socket, transaction_id)).await??;
    let peers = timeout(
        READ_TIMEOUT,
        do_announce(
            &socket,
            connection_id,
            transaction_id,
            address,
            local_port,
        ),
    )
    .await??;
    Ok(peers)
}

/// Step 1: exchange a connect request/response to obtain a `connection_id`.
async fn connect(socket: &UdpSocket, transaction_id: i32) -> Result<i64> {
    let mut request = [0u8; 16];
    BigEndian::write_i64(&mut request[0..8], MAGIC_CONNECTION_ID);
    BigEndian::write_u32(&mut request[8..12], ACTION_CONNECT);
    BigEndian::write_i32(&mut request[12..16], transaction_id);
    socket.send(&request).await?;

    let mut reply = [0u8; 16];
    socket.recv(&mut reply).await?;

    let reply_action = BigEndian::read_u32(&reply[0..4]);
    let reply_transaction = BigEndian::read_i32(&reply[4..8]);
    if reply_action != ACTION_CONNECT || reply_transaction != transaction_id {
        return Err(anyhow!("unexpected connect reply"));
    }
    Ok(BigEndian::read_i64(&reply[8..16]))
}

/// Step 2: announce with the connection id, returning whatever peers the
/// tracker hands back (up to the 10240-byte read budget).
async fn do_announce(
    socket: &UdpSocket,
    connection_id: i64,
    transaction_id: i32,
    address: &str,
    local_port: u16,
) -> Result<Vec<PeerEndpoint>> {
    let info_hash = crypto::info_hash(address);
    let peer_id = crypto::generate_peer_id();

    let mut request = Vec::with_capacity(98);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(&info_hash);
    request.extend_from_slice(&peer_id.as_bytes()[..20]);
    request.extend_from_slice(&0i64.to_be_bytes()); // downloaded
    request.extend_from_slice(&0i64.to_be_bytes()); // left
    request.extend_from_slice(&0i64.to_be_bytes()); // uploaded
    request.extend_from_slice(&EVENT_STARTED.to_be_bytes());
    request.extend_from_slice(&0i32.to_be_bytes()); // ip
    request.extend_from_slice(&0i32.to_be_bytes()); // key
    request.extend_from_slice(&50i32.to_be_bytes()); // num_want
    request.extend_from_slice(&(local_port as i16).to_be_bytes());

    socket.send(&request).await?;

    let mut buf = vec![0u8; 10240];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);

    if buf.len() < 20 {
        return Err(anyhow!("announce reply too short"));
    }
    // Skip action, transaction_id, interval, leechers, seeders (4 bytes each).
    Ok(parse_compact_peers(&buf[20..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_request_round_trips_against_a_fake_tracker() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(tracker_addr).await.unwrap();

        let client_task = tokio::spawn(async move { connect(&client, 1234).await });

        let mut buf = [0u8; 16];
        let (_, from) = tracker.recv_from(&mut buf).await.unwrap();
        let transaction_id = BigEndian::read_i32(&buf[12..16]);

        let mut reply = [0u8; 16];
        BigEndian::write_u32(&mut reply[0..4], ACTION_CONNECT);
        BigEndian::write_i32(&mut reply[4..8], transaction_id);
        BigEndian::write_i64(&mut reply[8..16], 999);
        tracker.send_to(&reply, from).await.unwrap();

        let connection_id = client_task.await.unwrap().unwrap();
        assert_eq!(connection_id, 999);
    }
}
