//! Download scheduler: drives the full download of one site.
//!
//! Phase 1 bootstraps `content.json` off the first connected peer, enumerates
//! every file (including `includes`) into the task list, then phase 3 is a
//! single dispatch loop that assigns the highest-priority unfinished task to
//! each newly connected peer and reacts to task completions until the
//! pending count reaches zero.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

use crate::error::{NodeError, NodeResult};
use crate::events::SiteEvent;
use crate::manager::PeerManager;
use crate::manifest::{Manifest, INCLUDE_SIZE_CAP};
use crate::peer::connection;
use crate::task::FileTask;

const CONTENT_JSON: &str = "content.json";

struct TaskList {
    tasks: Mutex<Vec<Arc<Mutex<FileTask>>>>,
    sequence: AtomicU64,
}

impl TaskList {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    async fn push(
        &self,
        inner_path: impl Into<String>,
        site_address: &str,
        digest: impl Into<String>,
        size: u64,
    ) -> Arc<Mutex<FileTask>> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(Mutex::new(FileTask::new(
            inner_path,
            site_address,
            digest,
            size,
            seq,
        )));
        self.tasks.lock().await.push(Arc::clone(&task));
        task
    }

    /// Pushes a task belonging to an `includes` descriptor (its sub-manifest,
    /// or an archived user directory's `content.json`/`data.json`): priority
    /// `PRIORITY_INCLUDE`, per the spec's "includes = >=9000" rule, regardless
    /// of what `priority_for` would infer from the inner path alone.
    async fn push_include(
        &self,
        inner_path: impl Into<String>,
        site_address: &str,
        digest: impl Into<String>,
        size: u64,
    ) -> Arc<Mutex<FileTask>> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut task = FileTask::new(inner_path, site_address, digest, size, seq);
        task.priority = crate::task::PRIORITY_INCLUDE;
        let task = Arc::new(Mutex::new(task));
        self.tasks.lock().await.push(Arc::clone(&task));
        task
    }

    async fn snapshot(&self) -> Vec<Arc<Mutex<FileTask>>> {
        self.tasks.lock().await.clone()
    }

    /// Highest-priority task that hasn't been started yet, if any.
    async fn next_pending(&self) -> Option<Arc<Mutex<FileTask>>> {
        let tasks = self.tasks.lock().await;
        let mut best: Option<(i32, u64, Arc<Mutex<FileTask>>)> = None;
        for task in tasks.iter() {
            let guard = task.lock().await;
            if guard.started || guard.done {
                continue;
            }
            let key = (guard.priority, guard.sequence);
            if best.as_ref().map(|(p, s, _)| (*p, *s) < key).unwrap_or(true) {
                best = Some((key.0, key.1, Arc::clone(task)));
            }
        }
        best.map(|(_, _, t)| t)
    }

    async fn pending_count(&self) -> usize {
        let tasks = self.tasks.lock().await;
        let mut n = 0;
        for task in tasks.iter() {
            if !task.lock().await.done {
                n += 1;
            }
        }
        n
    }

    async fn find(&self, inner_path: &str) -> Option<Arc<Mutex<FileTask>>> {
        let tasks = self.tasks.lock().await;
        for task in tasks.iter() {
            if task.lock().await.inner_path == inner_path {
                return Some(Arc::clone(task));
            }
        }
        None
    }

    async fn total_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    async fn finished_count(&self) -> usize {
        let tasks = self.tasks.lock().await;
        let mut n = 0;
        for task in tasks.iter() {
            if task.lock().await.done {
                n += 1;
            }
        }
        n
    }
}

pub struct Downloader {
    address: String,
    data_root: PathBuf,
    peers: Arc<PeerManager>,
    tasks: Arc<TaskList>,
    events_tx: broadcast::Sender<SiteEvent>,
}

impl Downloader {
    pub fn new(address: String, data_root: PathBuf, peers: Arc<PeerManager>) -> Self {
        let (events_tx, _) = broadcast::channel(400);
        Self {
            address,
            data_root,
            peers,
            tasks: Arc::new(TaskList::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SiteEvent> {
        self.events_tx.subscribe()
    }

    /// Total file tasks enumerated so far (0 before the manifest bootstraps).
    pub async fn total_files(&self) -> usize {
        self.tasks.total_count().await
    }

    /// File tasks that have reached a terminal state (success or failure).
    pub async fn files_done(&self) -> usize {
        self.tasks.finished_count().await
    }

    /// Peers currently tracked for this site, for UI progress reporting.
    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    fn site_root(&self) -> PathBuf {
        self.data_root.join(&self.address)
    }

    /// Runs the full download: announce, bootstrap the manifest, enumerate
    /// tasks, and dispatch until every task is terminal. Returns whether the
    /// site downloaded successfully as a whole.
    pub async fn run(&self, modified_baseline: Option<f64>) -> NodeResult<bool> {
        fs::create_dir_all(self.site_root()).await.ok();

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let (announce_tx, mut announce_rx) = mpsc::unbounded_channel();
        let peers = Arc::clone(&self.peers);
        let announce_handle = tokio::spawn(async move {
            peers.announce(peer_tx, announce_tx).await;
        });

        // Wait for the first peer to bootstrap the manifest, but give up if
        // every tracker reports in with zero total peers.
        let mut trackers_done = 0;
        let tracker_count = self.peers.tracker_count();
        let first_peer = loop {
            tokio::select! {
                Some(peer) = peer_rx.recv() => break Some(peer),
                Some(count) = announce_rx.recv() => {
                    let _ = self.events_tx.send(SiteEvent::PeersAdded(count));
                    trackers_done += 1;
                    if trackers_done >= tracker_count && tracker_count > 0 {
                        break None;
                    }
                }
                else => break None,
            }
        };

        let Some(first_peer) = first_peer else {
            warn!(address = %self.address, "no peers discovered");
            return Err(NodeError::NoPeers(self.address.clone()));
        };

        let manifest = self.bootstrap_manifest(&first_peer).await?;
        self.peers.free(Arc::clone(&first_peer));

        if let Some(baseline) = modified_baseline {
            if baseline == manifest.modified {
                self.mark_all_done_success().await;
                return Ok(true);
            }
        }

        self.enumerate_files(&manifest).await;
        self.fetch_includes(&manifest, &first_peer).await;

        let total_tasks = self.tasks.snapshot().await.len();
        info!(address = %self.address, total_tasks, "manifest enumerated, dispatching");

        let site_success = self
            .dispatch_loop(peer_rx, announce_rx, announce_handle)
            .await;

        Ok(site_success)
    }

    /// Phase 1: fetch `content.json` off the first connected peer.
    async fn bootstrap_manifest(&self, peer: &crate::peer::SharedPeer) -> NodeResult<Manifest> {
        let task = self
            .tasks
            .push(CONTENT_JSON, &self.address, "", 0)
            .await;
        {
            let mut guard = task.lock().await;
            connection::download_task(peer, &mut guard).await?;
            let manifest = Manifest::parse(&guard.buffer)?;
            guard.finish();
            self.persist(&guard).await?;
            drop(guard);
            let _ = self.events_tx.send(SiteEvent::FileDone(CONTENT_JSON.into()));
            Ok(manifest)
        }
    }

    async fn enumerate_files(&self, manifest: &Manifest) {
        for (inner_path, entry) in &manifest.files {
            if self.site_root().join(inner_path).exists() {
                let task = self
                    .tasks
                    .push(inner_path.clone(), &self.address, entry.sha512.clone(), entry.size)
                    .await;
                let mut guard = task.lock().await;
                guard.success = true;
                guard.done = true;
                let _ = self
                    .events_tx
                    .send(SiteEvent::FileDone(inner_path.clone()));
                continue;
            }
            self.tasks
                .push(inner_path.clone(), &self.address, entry.sha512.clone(), entry.size)
                .await;
        }
    }

    /// Recursively resolves `includes`: each descriptor points at another
    /// site's manifest, size-capped, plus optional archived user content.
    async fn fetch_includes(&self, manifest: &Manifest, peer: &crate::peer::SharedPeer) {
        for inner_path in manifest.includes.keys() {
            let include_path = format!("{}/{}", parent_of(inner_path), CONTENT_JSON);
            let task = self
                .tasks
                .push_include(include_path.clone(), &self.address, "", 0)
                .await;
            let mut guard = task.lock().await;
            if let Err(err) = connection::download_task(peer, &mut guard).await {
                warn!(include = %include_path, error = %err, "include unreachable, skipping");
                guard.fail();
                continue;
            }
            if guard.buffer.len() > INCLUDE_SIZE_CAP {
                warn!(include = %include_path, "include exceeds size cap, truncating");
                guard.buffer.truncate(INCLUDE_SIZE_CAP);
            }
            let included = match Manifest::parse(&guard.buffer) {
                Ok(m) => m,
                Err(err) => {
                    warn!(include = %include_path, error = %err, "include manifest invalid");
                    guard.fail();
                    continue;
                }
            };
            guard.finish();
            drop(guard);

            for dir in included.archived_user_dirs() {
                for leaf in ["content.json", "data.json"] {
                    let archived_path = format!("{dir}/{leaf}");
                    self.tasks
                        .push_include(archived_path, &self.address, "", 0)
                        .await;
                }
            }
        }
    }

    async fn mark_all_done_success(&self) {
        for task in self.tasks.snapshot().await {
            let mut guard = task.lock().await;
            if !guard.done {
                guard.success = true;
                guard.done = true;
            }
        }
    }

    /// Phase 3: assign the highest-priority pending task to each arriving
    /// peer, and react to completions until nothing is left pending.
    async fn dispatch_loop(
        &self,
        mut peer_rx: mpsc::UnboundedReceiver<crate::peer::SharedPeer>,
        mut announce_rx: mpsc::UnboundedReceiver<usize>,
        announce_handle: tokio::task::JoinHandle<()>,
    ) -> bool {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<bool>();
        let mut overall_success = true;
        let mut in_flight = 0usize;

        loop {
            if self.tasks.pending_count().await == 0 && in_flight == 0 {
                break;
            }
            tokio::select! {
                Some(peer) = peer_rx.recv() => {
                    if let Some(task) = self.tasks.next_pending().await {
                        in_flight += 1;
                        let site_root = self.site_root();
                        let events_tx = self.events_tx.clone();
                        let peers = Arc::clone(&self.peers);
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let success = run_one_task(&peer, &task, &site_root, &events_tx).await;
                            peers.free(peer);
                            let _ = done_tx.send(success);
                        });
                    } else {
                        self.peers.free(peer);
                    }
                }
                Some(count) = announce_rx.recv() => {
                    let _ = self.events_tx.send(SiteEvent::PeersAdded(count));
                }
                Some(success) = done_rx.recv() => {
                    in_flight -= 1;
                    overall_success &= success;
                }
                else => break,
            }
        }

        announce_handle.abort();
        overall_success
    }

    /// Blocks until `inner_path`'s task reaches a terminal state, bumping its
    /// priority every 100ms it waits and resubmitting it for reassignment
    /// after 20 ticks without progress. Returns its final `success` flag, or
    /// `false` if no such task was ever enumerated.
    pub async fn wait_file(&self, inner_path: &str) -> bool {
        let mut stalled_ticks = 0u32;
        let mut last_offset = None;
        loop {
            let Some(task) = self.tasks.find(inner_path).await else {
                return false;
            };
            {
                let mut guard = task.lock().await;
                if guard.done {
                    return guard.success;
                }
                guard.priority += 1;
                if last_offset == Some(guard.offset_bytes) {
                    stalled_ticks += 1;
                } else {
                    stalled_ticks = 0;
                }
                last_offset = Some(guard.offset_bytes);
                if stalled_ticks >= 20 {
                    guard.started = false;
                    stalled_ticks = 0;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    async fn persist(&self, task: &FileTask) -> NodeResult<()> {
        if task.inner_path == CONTENT_JSON && !task.success {
            return Ok(());
        }
        let path = self.site_root().join(&task.inner_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        fs::write(&path, &task.buffer).await.map_err(NodeError::Io)
    }
}

/// Downloads and finalizes one task on one peer: streams the file, verifies
/// its digest, persists it, and emits the matching `file_done`/`file_failed`
/// event. Returns whether the task succeeded.
async fn run_one_task(
    peer: &crate::peer::SharedPeer,
    task: &Arc<Mutex<FileTask>>,
    site_root: &Path,
    events_tx: &broadcast::Sender<SiteEvent>,
) -> bool {
    let mut guard = task.lock().await;
    if let Err(err) = connection::download_task(peer, &mut guard).await {
        warn!(inner_path = %guard.inner_path, error = %err, "peer failed mid-transfer");
        guard.fail();
        let _ = events_tx.send(SiteEvent::FileFailed(guard.inner_path.clone()));
        return false;
    }

    let path = site_root.join(&guard.inner_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent).await;
    }

    let digest_ok = guard.finish();
    if digest_ok && fs::write(&path, &guard.buffer).await.is_err() {
        guard.success = false;
    }

    if guard.success {
        let _ = events_tx.send(SiteEvent::FileDone(guard.inner_path.clone()));
    } else {
        let _ = events_tx.send(SiteEvent::FileFailed(guard.inner_path.clone()));
    }
    guard.success
}

fn parent_of(inner_path: &str) -> String {
    Path::new(inner_path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ClientCredential;
    use crate::manifest::{FileEntry, Manifest};

    fn downloader(data_root: &Path) -> Downloader {
        let credential = Arc::new(ClientCredential::load_or_generate(data_root).unwrap());
        let peers = Arc::new(PeerManager::new("addr".into(), &[], credential));
        Downloader::new("addr".into(), data_root.to_path_buf(), peers)
    }

    #[tokio::test]
    async fn push_include_outranks_ordinary_files() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        let include_task = dl.tasks.push_include("news/content.json", "addr", "", 0).await;
        let ordinary_task = dl.tasks.push("style.css", "addr", "", 0).await;
        assert!(include_task.lock().await.priority >= crate::task::PRIORITY_INCLUDE);
        assert!(ordinary_task.lock().await.priority < crate::task::PRIORITY_INCLUDE);
    }

    #[tokio::test]
    async fn enumerate_files_short_circuits_existing_files_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        std::fs::create_dir_all(dl.site_root()).unwrap();
        std::fs::write(dl.site_root().join("hello.txt"), b"already here").unwrap();

        let mut files = std::collections::BTreeMap::new();
        files.insert(
            "hello.txt".to_string(),
            FileEntry {
                sha512: "deadbeef".to_string(),
                size: 12,
            },
        );
        let manifest = Manifest {
            modified: 1.0,
            files,
            includes: std::collections::BTreeMap::new(),
            extra: std::collections::BTreeMap::new(),
        };

        let mut events = dl.subscribe();
        dl.enumerate_files(&manifest).await;

        let task = dl.tasks.find("hello.txt").await.unwrap();
        let guard = task.lock().await;
        assert!(guard.done);
        assert!(guard.success);
        drop(guard);

        assert_eq!(dl.tasks.pending_count().await, 0);
        match events.try_recv().unwrap() {
            SiteEvent::FileDone(path) => assert_eq!(path, "hello.txt"),
            other => panic!("expected FileDone, got {other:?}"),
        }
    }
}
