//! Periodic expiry of overdue impersonation sessions.
//!
//! Housekeeping only: token validation expires overdue sessions on its own.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::middleware::tenant::with_context;
use crate::models::TenantContext;
use crate::services::ImpersonationManager;

pub fn spawn_expiry_sweep(
    manager: ImpersonationManager,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(with_context(TenantContext::system(), async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = every.as_secs(), "Impersonation expiry sweep started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match manager.expire_due().await {
                        Ok(0) => tracing::debug!("Expiry sweep found nothing due"),
                        Ok(expired) => tracing::info!(expired, "Expiry sweep expired sessions"),
                        Err(e) => tracing::error!(error = %e, "Expiry sweep failed"),
                    }
                }
            }
        }

        tracing::info!("Impersonation expiry sweep stopped");
    }))
}
