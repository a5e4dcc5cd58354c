//! A single connection to another node serving a site.
//!
//! One background reader task per connected peer continuously reads
//! MessagePack frames and demultiplexes them to whichever in-flight request
//! they answer. Outgoing frames are serialized by a mutex guarding
//! "allocate `req_id` + write bytes".
pub mod connection;
pub mod protocol;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::error::NodeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reply to an in-flight request: the decoded header plus, if the response
/// streamed a file payload, the accumulated raw bytes.
#[derive(Debug)]
pub struct PeerReply {
    pub response: protocol::Response,
    pub buffer: Vec<u8>,
}

type PendingReplies = Mutex<HashMap<u64, oneshot::Sender<NodeResult<PeerReply>>>>;

/// A connection to one remote peer, shared by the peer manager (owner) and
/// the scheduler (borrower) for the lifetime of a single request.
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
    state: std::sync::Mutex<PeerState>,
    next_request_id: AtomicU64,
    pub active_task_count: AtomicU32,
    writer: Mutex<Option<connection::FrameWriter>>,
    pending: PendingReplies,
    /// Arrival sequence, used to break ties in the peer heap.
    pub sequence: u64,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16, sequence: u64) -> Self {
        let mut rng = rand::rng();
        use rand::Rng;
        let seed: u64 = rng.random_range(0..1000);
        Self {
            ip,
            port,
            state: std::sync::Mutex::new(PeerState::Disconnected),
            next_request_id: AtomicU64::new(seed),
            active_task_count: AtomicU32::new(0),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            sequence,
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn active_tasks(&self) -> u32 {
        self.active_task_count.load(Ordering::SeqCst)
    }

    pub fn inc_active(&self) {
        self.active_task_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_active(&self) {
        self.active_task_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Two peers are equal iff their IPs match; duplicate addresses are
/// silently dropped by the peer manager's `known` check.
impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
    }
}
impl Eq for Peer {}

pub type SharedPeer = Arc<Peer>;
