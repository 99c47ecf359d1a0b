use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use proton_core::admin::{self, AdminCommand};
use proton_core::config::DashboardConfig;
use proton_core::notify::TracingSink;
use proton_core::provision::DirectoryProvisioner;
use proton_core::registry::{DefinitionStore, ServerRegistry};
use proton_core::runtime::JavaHomeResolver;

/// Per-server wait when shutting down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("Dashboard core starting");

    let cfg = DashboardConfig::load()?;
    let roots = cfg.roots();
    tracing::info!(
        "Servers root {}, backups root {}",
        roots.servers_root.display(),
        roots.backups_root.display()
    );

    let registry = ServerRegistry::new(
        DefinitionStore::new(cfg.servers_file(), roots),
        Arc::new(DirectoryProvisioner::new()),
        Arc::new(JavaHomeResolver::new(cfg.java_home.clone())),
        Arc::new(TracingSink::new(cfg.language)),
        cfg.process_options(),
    );
    registry.load()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", admin::HELP);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // stdin closed: keep serving until Ctrl+C
                    Ok(None) => {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            tracing::error!("Cannot listen for Ctrl+C: {}", e);
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("stdin read error: {}", e);
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match admin::parse_command(&line) {
                    Ok(AdminCommand::Quit) => break,
                    Ok(cmd) => match admin::execute(&registry, cmd).await {
                        Ok(reply) => println!("{}", reply),
                        Err(e) => println!("error: {}", e),
                    },
                    Err(e) => println!("error: {}", e),
                }
            }
        }
    }

    tracing::info!("Stopping running servers...");
    registry.stop_all(SHUTDOWN_TIMEOUT).await;
    tracing::info!("Dashboard core shut down");
    Ok(())
}
