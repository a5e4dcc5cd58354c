use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use zeronode::config::Cli;
use zeronode::crypto::ClientCredential;
use zeronode::logging;
use zeronode::registry::SiteRegistry;
use zeronode::server;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let data_root = cli.data_root();
    if let Err(err) = std::fs::create_dir_all(&data_root) {
        error!(error = %err, data_root = %data_root.display(), "failed to create data root");
        return ExitCode::FAILURE;
    }

    let credential = match ClientCredential::load_or_generate(&data_root) {
        Ok(cred) => Arc::new(cred),
        Err(err) => {
            error!(error = %err, "failed to load or generate TLS credentials");
            return ExitCode::FAILURE;
        }
    };

    let registry = Arc::new(SiteRegistry::new(data_root.clone(), credential));

    if let Err(err) = server::serve(Arc::clone(&registry), data_root, cli.ui_port).await {
        error!(error = %err, "failed to start UI server");
        return ExitCode::FAILURE;
    }

    let requested = cli
        .address
        .clone()
        .or(cli.homepage.clone())
        .map(|addr| registry.resolve_alias(&addr).unwrap_or(addr));

    if let Some(address) = requested {
        info!(address, "opening site");
        match registry.download(&address).await {
            Ok(true) => info!(address, "site downloaded successfully"),
            Ok(false) => {
                error!(address, "site download finished with failures");
            }
            Err(err) => {
                error!(address, error = %err, "site download failed outright");
                return ExitCode::FAILURE;
            }
        }
    }

    info!("idling; press Ctrl+C to exit");
    let _ = tokio::signal::ctrl_c().await;
    ExitCode::SUCCESS
}
