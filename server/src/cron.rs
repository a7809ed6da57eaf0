use std::time::Duration;

use tracing::{error, info, warn};

use crate::blob::BlobStore;
use crate::deadline::{bounded, Deadlines};
use crate::errors::AppResult;
use crate::state::AppState;
use crate::store::OrphanStore;

/// How often recorded orphans are retried
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Orphans handled per sweep
const ORPHAN_SWEEP_BATCH: usize = 100;

pub async fn run_cron(app_state: AppState) -> color_eyre::Result<()> {
    let mut interval = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let swept = sweep_orphans(
            app_state.orphans.as_ref(),
            app_state.blobs.as_ref(),
            app_state.deadlines,
            ORPHAN_SWEEP_BATCH,
        )
        .await;

        if let Err(err) = swept {
            error!("Failed to run orphan sweep: {:?}", err);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    /// Still referenced by a record, forgotten without deleting
    pub retained: usize,
    pub failed: usize,
}

/// Delete up to `batch` recorded orphans, forgetting each one once its delete succeeds
///
/// A blob some record points at is never deleted, only dropped from the ledger.
pub async fn sweep_orphans(
    orphans: &dyn OrphanStore,
    blobs: &dyn BlobStore,
    deadlines: Deadlines,
    batch: usize,
) -> AppResult<SweepReport> {
    let pending = bounded(deadlines.record, "orphan listing", orphans.list_orphans(batch)).await?;
    info!("Found {} orphaned blob(s) to sweep", pending.len());

    let mut report = SweepReport::default();
    for orphan in pending {
        let referenced = bounded(
            deadlines.record,
            "orphan reference check",
            orphans.is_referenced(&orphan.blob_id),
        )
        .await;

        match referenced {
            Ok(true) => {
                info!("Blob {} is referenced by a record, keeping it", orphan.blob_id);
                bounded(
                    deadlines.record,
                    "orphan bookkeeping",
                    orphans.forget_orphan(&orphan.blob_id),
                )
                .await?;
                report.retained += 1;
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                warn!("Could not tell whether blob {} is referenced: {}", orphan.blob_id, err);
                report.failed += 1;
                continue;
            }
        }

        let deleted = bounded(deadlines.blob, "orphan delete", blobs.delete(&orphan.blob_id)).await;
        if let Err(err) = deleted {
            warn!("Orphaned blob {} is still not deletable: {}", orphan.blob_id, err);
            report.failed += 1;
            continue;
        }

        bounded(
            deadlines.record,
            "orphan bookkeeping",
            orphans.forget_orphan(&orphan.blob_id),
        )
        .await?;
        report.deleted += 1;
    }

    info!(
        "Orphan sweep finished: {} deleted, {} retained, {} still pending",
        report.deleted, report.retained, report.failed
    );
    Ok(report)
}
