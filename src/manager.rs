//! Peer manager: owns the known-peer set for one site, orchestrates
//! tracker announces, and hands out the least-loaded peer to the scheduler.
//!
//! The reference implementation's peer heap has a no-op `Swap`, which
//! silently breaks heap ordering (see the design notes on priority-heap
//! correctness). This implementation uses a real binary heap ordered by
//! ascending `active_task_count`, arrival order breaking ties.
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::crypto::ClientCredential;
use crate::peer::{connection, PeerState, SharedPeer};
use crate::tracker::{PeerEndpoint, Tracker};

/// Min-heap entry: compares by ascending active task count, then by
/// ascending arrival sequence so ties resolve to whichever peer connected
/// first.
struct HeapEntry(SharedPeer);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.active_tasks() == other.0.active_tasks() && self.0.sequence == other.0.sequence
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so `pop()` yields the
        // least-loaded peer.
        other
            .0
            .active_tasks()
            .cmp(&self.0.active_tasks())
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

struct PeerHeap {
    heap: std::sync::Mutex<BinaryHeap<HeapEntry>>,
    known: std::sync::Mutex<Vec<IpAddr>>,
    notify: Notify,
}

impl PeerHeap {
    fn new() -> Self {
        Self {
            heap: std::sync::Mutex::new(BinaryHeap::new()),
            known: std::sync::Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, peer: SharedPeer) {
        self.known.lock().unwrap().push(peer.ip);
        self.heap.lock().unwrap().push(HeapEntry(peer));
        self.notify.notify_one();
    }

    fn is_known(&self, ip: IpAddr) -> bool {
        self.known.lock().unwrap().contains(&ip)
    }

    fn count(&self) -> usize {
        self.known.lock().unwrap().len()
    }

    /// Blocks until at least one connected peer is available, then pops the
    /// least-loaded one.
    async fn get(&self) -> SharedPeer {
        loop {
            if let Some(entry) = self.heap.lock().unwrap().pop() {
                return entry.0;
            }
            self.notify.notified().await;
        }
    }

    /// Returns a peer to the heap after the scheduler is done with it (if
    /// it's still connected).
    fn free(&self, peer: SharedPeer) {
        if peer.state() == PeerState::Connected {
            self.heap.lock().unwrap().push(HeapEntry(peer));
            self.notify.notify_one();
        }
    }
}

/// External HTTP echo service used to learn the node's own public IP, so
/// trackers that hand back our own address don't make us connect to
/// ourselves. Fetched lazily, once, and cached for the process lifetime.
const EXTERNAL_IP_ECHO_URL: &str = "https://api.ipify.org";

type ExternalIpCache = Arc<std::sync::Mutex<Option<IpAddr>>>;

pub struct PeerManager {
    address: String,
    trackers: Vec<Tracker>,
    peers: Arc<PeerHeap>,
    credential: Arc<ClientCredential>,
    external_ip: ExternalIpCache,
}

impl PeerManager {
    pub fn new(address: String, tracker_urls: &[&str], credential: Arc<ClientCredential>) -> Self {
        let trackers = tracker_urls
            .iter()
            .filter_map(|u| Tracker::parse(u))
            .collect();
        Self {
            address,
            trackers,
            peers: Arc::new(PeerHeap::new()),
            credential,
            external_ip: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Fans out to every configured tracker concurrently. `on_peer` receives
    /// every newly learned, connected peer; `on_announce_count` receives the
    /// raw peer count each tracker returned (before dedup/connect), in the
    /// order trackers complete.
    pub async fn announce(
        &self,
        on_peer: mpsc::UnboundedSender<SharedPeer>,
        on_announce_count: mpsc::UnboundedSender<usize>,
    ) {
        let mut handles = Vec::new();
        for tracker in &self.trackers {
            let tracker = tracker.clone();
            let address = self.address.clone();
            let peers = Arc::clone(&self.peers);
            let credential = Arc::clone(&self.credential);
            let external_ip = Arc::clone(&self.external_ip);
            let on_peer = on_peer.clone();
            let on_announce_count = on_announce_count.clone();
            let peer_id = crate::crypto::generate_peer_id();

            handles.push(tokio::spawn(async move {
                let endpoints = tracker.announce(&address).await;
                let _ = on_announce_count.send(endpoints.len());
                for endpoint in endpoints {
                    if peers.is_known(endpoint.ip) || is_own_address(endpoint.ip, &external_ip).await {
                        continue;
                    }
                    connect_and_register(
                        endpoint,
                        &peers,
                        &credential,
                        &peer_id,
                        &on_peer,
                    )
                    .await;
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Blocks until a connected peer is available, then pops the
    /// least-loaded one. Caller must call `free` when done with it.
    pub async fn get(&self) -> SharedPeer {
        self.peers.get().await
    }

    pub fn free(&self, peer: SharedPeer) {
        self.peers.free(peer);
    }

    /// True if `ip` is already tracked, is `0.0.0.0`, or is this node's own
    /// public IP (resolved lazily via `is_own_address`, cached thereafter).
    pub async fn known(&self, ip: IpAddr) -> bool {
        self.peers.is_known(ip) || is_own_address(ip, &self.external_ip).await
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    /// Number of peers currently tracked for this site (connected or
    /// momentarily checked out by the scheduler), for UI progress reporting.
    pub fn peer_count(&self) -> usize {
        self.peers.count()
    }
}

/// True if `ip` is unspecified (`0.0.0.0`) or matches this node's own public
/// IP. The public IP is resolved at most once per process via
/// `EXTERNAL_IP_ECHO_URL` and cached in `cache` for every later call.
async fn is_own_address(ip: IpAddr, cache: &ExternalIpCache) -> bool {
    if ip.is_unspecified() {
        return true;
    }
    resolve_own_ip(cache).await == Some(ip)
}

async fn resolve_own_ip(cache: &ExternalIpCache) -> Option<IpAddr> {
    if let Some(ip) = *cache.lock().unwrap() {
        return Some(ip);
    }
    let ip = fetch_external_ip().await;
    if let Some(ip) = ip {
        *cache.lock().unwrap() = Some(ip);
    }
    ip
}

async fn fetch_external_ip() -> Option<IpAddr> {
    let body = reqwest::get(EXTERNAL_IP_ECHO_URL).await.ok()?.text().await.ok()?;
    body.trim().parse().ok()
}

async fn connect_and_register(
    endpoint: PeerEndpoint,
    peers: &Arc<PeerHeap>,
    credential: &Arc<ClientCredential>,
    peer_id: &str,
    on_peer: &mpsc::UnboundedSender<SharedPeer>,
) {
    if peers.is_known(endpoint.ip) {
        return;
    }
    let sequence = next_sequence();
    match connection::connect(endpoint.ip, endpoint.port, sequence, credential, peer_id).await {
        Ok(peer) => {
            debug!(ip = %endpoint.ip, port = endpoint.port, "peer connected");
            let _ = connection::ping(&peer).await;
            peers.push(Arc::clone(&peer));
            let _ = on_peer.send(peer);
        }
        Err(err) => {
            info!(ip = %endpoint.ip, port = endpoint.port, error = %err, "peer connect failed");
        }
    }
}

static GLOBAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);
fn next_sequence() -> u64 {
    GLOBAL_SEQUENCE.fetch_add(1, AtomicOrdering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;

    fn fake_peer(tasks: u32, sequence: u64) -> SharedPeer {
        let peer = Arc::new(Peer::new("127.0.0.1".parse().unwrap(), 1000, sequence));
        for _ in 0..tasks {
            peer.inc_active();
        }
        peer
    }

    #[tokio::test]
    async fn get_returns_least_loaded_peer() {
        let heap = PeerHeap::new();
        heap.push(fake_peer(3, 0));
        heap.push(fake_peer(1, 1));
        heap.push(fake_peer(2, 2));

        let peer = heap.get().await;
        assert_eq!(peer.active_tasks(), 1);
    }

    #[tokio::test]
    async fn ties_broken_by_arrival_order() {
        let heap = PeerHeap::new();
        heap.push(fake_peer(0, 5));
        heap.push(fake_peer(0, 2));

        let peer = heap.get().await;
        assert_eq!(peer.sequence, 2);
    }

    #[tokio::test]
    async fn known_treats_unspecified_as_known() {
        let credential_dir = tempfile::tempdir().unwrap();
        let credential = Arc::new(ClientCredential::load_or_generate(credential_dir.path()).unwrap());
        let manager = PeerManager::new("addr".into(), &[], credential);
        assert!(manager.known("0.0.0.0".parse().unwrap()).await);
    }
}
