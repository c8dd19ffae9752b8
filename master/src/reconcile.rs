use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::JobStore;

/// Pasada de arranque: los jobs que otro proceso dejó en QUEUED o RUNNING ya
/// no tienen quién los termine, pasan a FAILED.
pub fn reconcile_interrupted_jobs(store: &dyn JobStore) -> Result<usize, StoreError> {
    let orphans = store.reconcile_interrupted()?;
    for job_id in &orphans {
        warn!(job_id = %job_id, "job interrumpido por un reinicio del master, marcado FAILED");
    }
    if orphans.is_empty() {
        info!("no hay jobs interrumpidos");
    }
    Ok(orphans.len())
}
