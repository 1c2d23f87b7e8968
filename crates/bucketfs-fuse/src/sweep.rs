//! Background cleanup of abandoned large-file uploads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{ObjectStore, StoreError};
use crate::ticket::Ticket;

/// Uploads started at least this long ago are cancelled.
pub const UPLOAD_EXPIRY: Duration = Duration::from_secs(48 * 3600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cancelled: usize,
    pub kept: usize,
    pub failed: usize,
    /// Expired uploads left alone because the credentials cannot cancel.
    pub skipped: usize,
}

enum Outcome {
    Cancelled,
    Failed,
    Skipped,
}

/// Cancels every unfinished upload older than [`UPLOAD_EXPIRY`].
pub async fn cleanup_old_uploads(store: Arc<dyn ObjectStore>, ticket: Ticket) -> Result<SweepReport> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    cleanup_uploads_before(store, ticket, now_ms).await
}

pub async fn cleanup_uploads_before(store: Arc<dyn ObjectStore>, ticket: Ticket, now_ms: u64) -> Result<SweepReport> {
    let uploads = store.list_unfinished_uploads().await?;
    let expiry_ms = UPLOAD_EXPIRY.as_millis() as u64;
    let denied = Arc::new(AtomicBool::new(false));
    let mut report = SweepReport::default();
    let mut tasks = JoinSet::new();

    for upload in uploads {
        if upload.started_at_ms.saturating_add(expiry_ms) > now_ms {
            debug!("keeping upload key={} id={}", upload.key, upload.upload_id);
            report.kept += 1;
            continue;
        }

        let store = Arc::clone(&store);
        let ticket = ticket.clone();
        let denied = Arc::clone(&denied);
        tasks.spawn(async move {
            let _permit = ticket.take().await;
            if denied.load(Ordering::Acquire) {
                return Outcome::Skipped;
            }
            match store.cancel_upload(&upload.upload_id).await {
                Ok(()) => {
                    debug!("cancelled upload key={} id={}", upload.key, upload.upload_id);
                    Outcome::Cancelled
                }
                Err(StoreError::AccessDenied { msg }) => {
                    warn!("not allowed to cancel uploads: {}", msg);
                    denied.store(true, Ordering::Release);
                    Outcome::Skipped
                }
                Err(e) => {
                    warn!("cancel upload id={} failed: {}", upload.upload_id, e);
                    Outcome::Failed
                }
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Outcome::Cancelled) => report.cancelled += 1,
            Ok(Outcome::Skipped) => report.skipped += 1,
            Ok(Outcome::Failed) => report.failed += 1,
            Err(e) => {
                warn!("upload cancel task failed: {}", e);
                report.failed += 1;
            }
        }
    }

    info!(
        "upload sweep: cancelled={} kept={} failed={} skipped={}",
        report.cancelled, report.kept, report.failed, report.skipped
    );
    Ok(report)
}
