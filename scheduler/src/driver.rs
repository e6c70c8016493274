use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::lease::{CycleLease, LeaseError};
use crate::reconciler::{CycleReport, ReconcileError, Reconciler};

/// Lease name guarding the reconciliation command.
pub static RECONCILE_LEASE: &str = "reconcile";

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Runs one cycle under the lease. `Ok(None)` means another holder is active.
pub async fn run_once(
    reconciler: &mut Reconciler,
    lease: &dyn CycleLease,
    lease_ttl: Duration,
) -> Result<Option<CycleReport>, CycleError> {
    let Some(guard) = lease.try_acquire(RECONCILE_LEASE, lease_ttl).await? else {
        debug!("Reconciliation lease is held elsewhere, skipping");
        return Ok(None);
    };

    let result = reconciler.run_cycle().await;

    if guard.is_expired() {
        warn!(lease = guard.name(), "Reconciliation cycle outlived its lease of {lease_ttl:?}");
    }
    if let Err(error) = lease.release(guard).await {
        error!("Failed to release reconciliation lease: {error}");
    }

    Ok(Some(result?))
}

/// Runs a cycle every `interval` until `shutdown` resolves. A cycle that
/// overruns delays the next tick instead of stacking up.
pub async fn run(
    mut reconciler: Reconciler,
    lease: &dyn CycleLease,
    interval: Duration,
    lease_ttl: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!("Reconciling every {interval:?}");
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutting down reconciliation driver");
                break;
            }
            _ = ticker.tick() => {
                match run_once(&mut reconciler, lease, lease_ttl).await {
                    Ok(Some(report)) => debug!(?report, "Cycle report"),
                    Ok(None) => {}
                    Err(error) => error!("Reconciliation cycle aborted: {error}"),
                }
            }
        }
    }
}
