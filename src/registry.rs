//! Process-wide home for every open `Site`: lookup by address, alias
//! resolution, and the `sites.json` summary persisted on each completion.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::crypto::ClientCredential;
use crate::error::{NodeError, NodeResult};
use crate::site::Site;

const SITES_FILE: &str = "sites.json";
const ALIASES_FILE: &str = "aliases.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteSummary {
    pub peers: usize,
    pub modified: f64,
}

pub struct SiteRegistry {
    data_root: PathBuf,
    credential: Arc<ClientCredential>,
    sites: Mutex<BTreeMap<String, Arc<Site>>>,
    aliases: BTreeMap<String, String>,
}

impl SiteRegistry {
    pub fn new(data_root: PathBuf, credential: Arc<ClientCredential>) -> Self {
        let aliases = load_aliases(&data_root);
        Self {
            data_root,
            credential,
            sites: Mutex::new(BTreeMap::new()),
            aliases,
        }
    }

    /// Returns the existing handle for `address` if one is open, otherwise
    /// constructs (loading any prior manifest from disk) and registers one.
    /// Does not itself trigger a download.
    pub async fn open(&self, address: &str) -> Arc<Site> {
        let mut sites = self.sites.lock().await;
        if let Some(site) = sites.get(address) {
            return Arc::clone(site);
        }
        let site = Arc::new(Site::new(address, &self.data_root, Arc::clone(&self.credential)));
        sites.insert(address.to_string(), Arc::clone(&site));
        site
    }

    /// Opens the site (if needed) and drives its download, writing a fresh
    /// `sites.json` summary for the whole registry on completion.
    pub async fn download(&self, address: &str) -> NodeResult<bool> {
        let site = self.open(address).await;
        let result = site.download().await;
        if let Err(err) = self.persist_summary().await {
            warn!(error = %err, "failed to persist sites.json");
        }
        result
    }

    /// Read-only snapshot of every known site's summary, as currently held
    /// in memory.
    pub async fn list(&self) -> BTreeMap<String, SiteSummary> {
        let sites = self.sites.lock().await;
        let mut out = BTreeMap::new();
        for (address, site) in sites.iter() {
            out.insert(
                address.clone(),
                SiteSummary {
                    peers: site.peer_count(),
                    modified: site.manifest_modified().await.unwrap_or(0.0),
                },
            );
        }
        out
    }

    pub fn resolve_alias(&self, name: &str) -> Option<String> {
        self.aliases.get(name).cloned()
    }

    /// Removes an open site's registry entry and its on-disk directory.
    pub async fn delete(&self, address: &str) -> NodeResult<()> {
        self.sites.lock().await.remove(address);
        let path = self.data_root.join(address);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(NodeError::Io)?;
        }
        info!(address, "site deleted");
        Ok(())
    }

    async fn persist_summary(&self) -> NodeResult<()> {
        let summary = self.list().await;
        let bytes = serde_json::to_vec_pretty(&summary)?;
        std::fs::write(self.data_root.join(SITES_FILE), bytes).map_err(NodeError::Io)
    }
}

fn load_aliases(data_root: &Path) -> BTreeMap<String, String> {
    std::fs::read(data_root.join(ALIASES_FILE))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SiteRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let credential = Arc::new(ClientCredential::load_or_generate(dir.path()).unwrap());
        let registry = SiteRegistry::new(dir.path().to_path_buf(), credential);
        (dir, registry)
    }

    #[tokio::test]
    async fn open_is_idempotent_per_address() {
        let (_dir, registry) = registry();
        let first = registry.open("siteaddr").await;
        let second = registry.open("siteaddr").await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn resolve_alias_reads_aliases_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(ALIASES_FILE),
            br#"{"home": "1HomeAddressHere"}"#,
        )
        .unwrap();
        let credential = Arc::new(ClientCredential::load_or_generate(dir.path()).unwrap());
        let registry = SiteRegistry::new(dir.path().to_path_buf(), credential);
        assert_eq!(
            registry.resolve_alias("home"),
            Some("1HomeAddressHere".to_string())
        );
        assert_eq!(registry.resolve_alias("missing"), None);
    }

    #[tokio::test]
    async fn delete_removes_site_directory() {
        let (dir, registry) = registry();
        let site_dir = dir.path().join("siteaddr");
        std::fs::create_dir_all(&site_dir).unwrap();
        registry.open("siteaddr").await;
        registry.delete("siteaddr").await.unwrap();
        assert!(!site_dir.exists());
        assert!(registry.list().await.is_empty());
    }
}
