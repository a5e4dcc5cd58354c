//! Command-line configuration.
use std::path::PathBuf;

use clap::Parser;

/// A client node for a peer-to-peer content-addressed web.
#[derive(Debug, Parser)]
#[command(name = "zeronode", version)]
pub struct Cli {
    /// Directory holding downloaded sites, TLS credentials, and sites.json.
    #[arg(long, value_name = "PATH")]
    pub data_root: Option<PathBuf>,

    /// Address or alias to download and open on startup.
    pub address: Option<String>,

    /// Overrides the default homepage address the UI server opens.
    #[arg(long, value_name = "ADDRESS")]
    pub homepage: Option<String>,

    /// Raises log verbosity to debug regardless of RUST_LOG.
    #[arg(long)]
    pub debug: bool,

    /// Port the local UI server binds (0 selects an ephemeral port).
    #[arg(long, default_value_t = 43110)]
    pub ui_port: u16,
}

impl Cli {
    pub fn data_root(&self) -> PathBuf {
        self.data_root.clone().unwrap_or_else(default_data_root)
    }
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("zeronode")
}
