use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use wallbox_sync::logging::init_logging;
use wallbox_sync::{Config, CoordinatorEvent, Wallbox};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    info!("Wallbox Sync {} starting up", env!("APP_VERSION"));

    let wallbox = Wallbox::start(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start: {}", e))?;

    let mut events = wallbox.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    wallbox.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Updated(snapshot) => {
            let absent = snapshot.absent_keys().count();
            info!(
                "Snapshot {}: {} fields, {} absent",
                snapshot.sequence,
                snapshot.values.len(),
                absent
            );
        }
        CoordinatorEvent::UpdateFailed { reason } => warn!("Update failed: {}", reason),
        CoordinatorEvent::PersistentFailure {
            consecutive_failures,
            reason,
        } => error!(
            "Wallbox unreachable for {} cycles: {}",
            consecutive_failures, reason
        ),
        other => info!("{:?}", other),
    }
}
