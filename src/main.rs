//! guestnet - guest VM network reconciliation daemon
//!
//! Keeps the wireserver firewall policy in place and reapplies routes when the
//! DHCP client restarts. Log verbosity is controlled with `RUST_LOG`.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use guestnet::{Config, SystemAgent};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !is_root() {
        tracing::warn!("Not running as root; firewall changes will fail");
    }

    let config = Config::load();
    tracing::debug!(?config, "Loaded configuration");

    let mut agent = SystemAgent::from_config(&config);
    agent
        .startup()
        .await
        .with_context(|| format!("Failed to read {}", config.route_table_path.display()))?;

    let mut interval = tokio::time::interval(config.tick_interval());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                agent.tick().await;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
