//! FUOTA worker binary.
//!
//! Claims due deployments and advances them until interrupted.

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fuota_control::{FuotaConfig, WorkerService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fuota_control=info".parse()?)
                .add_directive("fuota_worker=info".parse()?),
        )
        .init();

    info!("fuota worker starting");

    let config = FuotaConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        FuotaConfig::default()
    });

    info!(
        collaborator = %config.collaborator.url,
        batch_size = config.scheduler.batch_size,
        poll_interval_secs = config.scheduler.poll_interval_secs,
        "configuration loaded"
    );

    let service = WorkerService::new(config);
    if let Err(e) = service.run().await {
        error!(error = %e, "fuota worker failed");
        return Err(e.into());
    }

    Ok(())
}
