//! `pgrant serve`: run the proxy until Ctrl-C.

use anyhow::{Context, Result};
use pgrant_audit::AuditLogger;
use pgrant_core::PgrantConfig;
use pgrant_proxy::PgrantProxy;
use tracing::{info, warn};

pub async fn run(config: PgrantConfig) -> Result<()> {
    config.validate().context("configuration is invalid")?;

    let audit = AuditLogger::new(config.audit.clone())
        .await
        .context("failed to open audit log")?;

    info!(
        upstreams = config.upstreams.len(),
        users = config.users.len(),
        grants = config.grants.len(),
        "Configuration loaded"
    );
    if config.grants.is_empty() {
        warn!("No grants configured; every login will be refused");
    }

    let proxy = PgrantProxy::from_config(&config, audit);
    proxy
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl-C");
        })
        .await?;

    Ok(())
}
