//! Top-level site lifecycle: owns one `Downloader`, exposes waitable
//! progress, and persists the final manifest summary.
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::crypto::ClientCredential;
use crate::downloader::Downloader;
use crate::error::NodeResult;
use crate::events::SiteEvent;
use crate::indexer;
use crate::manager::PeerManager;
use crate::manifest::Manifest;
use crate::tracker::DEFAULT_TRACKERS;

pub struct Site {
    pub address: String,
    pub path: PathBuf,
    downloader: Downloader,
    manifest: Mutex<Option<Manifest>>,
    ready: std::sync::atomic::AtomicBool,
    success: std::sync::atomic::AtomicBool,
    ready_notify: Notify,
}

impl Site {
    pub fn new(address: &str, data_root: &std::path::Path, credential: Arc<ClientCredential>) -> Self {
        let path = data_root.join(address);
        let peers = Arc::new(PeerManager::new(
            address.to_string(),
            DEFAULT_TRACKERS,
            credential,
        ));
        let downloader = Downloader::new(address.to_string(), data_root.to_path_buf(), peers);

        let manifest = std::fs::read(path.join("content.json"))
            .ok()
            .and_then(|bytes| Manifest::parse(&bytes).ok());

        Self {
            address: address.to_string(),
            path,
            downloader,
            manifest: Mutex::new(manifest),
            ready: std::sync::atomic::AtomicBool::new(false),
            success: std::sync::atomic::AtomicBool::new(false),
            ready_notify: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SiteEvent> {
        self.downloader.subscribe()
    }

    /// Drives the scheduler to completion. Reuses the site's previously
    /// persisted `modified` timestamp as the freshness baseline, if any.
    pub async fn download(&self) -> NodeResult<bool> {
        let baseline = self.manifest.lock().await.as_ref().map(|m| m.modified);
        let success = self.downloader.run(baseline).await?;

        self.success
            .store(success, std::sync::atomic::Ordering::SeqCst);
        self.ready
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.ready_notify.notify_waiters();

        if let Ok(bytes) = std::fs::read(self.path.join("content.json")) {
            if let Ok(manifest) = Manifest::parse(&bytes) {
                *self.manifest.lock().await = Some(manifest);
            }
        }

        if success {
            let site_root = self.path.clone();
            tokio::task::spawn_blocking(move || indexer::index_site(&site_root));
        }

        info!(address = %self.address, success, "site download finished");
        Ok(success)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn is_success(&self) -> bool {
        self.success.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Peers currently tracked for this site, for the `siteInfo` UI command.
    pub fn peer_count(&self) -> usize {
        self.downloader.peer_count()
    }

    /// Total file tasks enumerated so far, for the `siteInfo` UI command.
    pub async fn total_files(&self) -> usize {
        self.downloader.total_files().await
    }

    /// File tasks that have reached a terminal state, for `siteInfo`.
    pub async fn files_done(&self) -> usize {
        self.downloader.files_done().await
    }

    /// Blocks until the manifest is downloaded and every task is terminal.
    pub async fn wait(&self) {
        while !self.is_ready() {
            self.ready_notify.notified().await;
        }
    }

    pub async fn manifest_modified(&self) -> Option<f64> {
        self.manifest.lock().await.as_ref().map(|m| m.modified)
    }

    /// Blocks until the named file's task reaches a terminal state.
    pub async fn wait_file(&self, inner_path: &str) -> bool {
        self.downloader.wait_file(inner_path).await
    }

    /// Inner paths from the site's current manifest matching `glob`.
    pub async fn matching_files(&self, glob: &str) -> Vec<String> {
        self.manifest
            .lock()
            .await
            .as_ref()
            .map(|m| {
                m.files
                    .keys()
                    .filter(|path| indexer::glob_match(glob, path))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
