//! # Orphan Reaper
//!
//! Checkouts that are never completed leave pending records behind. They never count toward
//! a ledger, but they pile up, so anything pending longer than the TTL is failed.
//!
//! Reaping goes through [`ContributionStore::mark_outcome`], so a confirmation racing the
//! reaper either settles first (the reaper skips it) or finds the record failed and is queued
//! for reconciliation.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, error, info, warn};

use crate::records::{ContributionStore, Outcome, RecordError};

/// Fails one orphaned order. `Ok(false)` when something else settled it first.
pub async fn reap_order(
    records: &dyn ContributionStore,
    order_id: &str,
) -> Result<bool, RecordError> {
    match records.mark_outcome(order_id, Outcome::Failed).await {
        Ok(()) => Ok(true),
        Err(RecordError::AlreadySettled(_) | RecordError::NotFound(_)) => {
            debug!("Order {order_id} settled before the reaper reached it");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Fails every record still pending that was created before `cutoff`.
pub async fn reap_orphans(
    records: &dyn ContributionStore,
    cutoff: DateTime<Utc>,
) -> Result<usize, RecordError> {
    let mut reaped = 0;

    for order_id in records.pending_before(cutoff).await? {
        if reap_order(records, &order_id).await? {
            reaped += 1;
        }
    }

    Ok(reaped)
}

/// `now - ttl`, or `None` when that falls outside the calendar.
pub fn cutoff(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(chrono::Duration::from_std(ttl).ok()?)
}

pub fn spawn_reaper(
    records: Arc<dyn ContributionStore>,
    ttl: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);

        loop {
            ticker.tick().await;

            let Some(cutoff) = cutoff(Utc::now(), ttl) else {
                error!("Pending TTL {ttl:?} out of range, reaper stopped");
                return;
            };

            match reap_orphans(records.as_ref(), cutoff).await {
                Ok(0) => debug!("No orphaned contributions"),
                Ok(reaped) => info!("Reaped {reaped} orphaned contributions"),
                Err(e) => warn!("Reaper pass failed: {e}"),
            }
        }
    })
}
