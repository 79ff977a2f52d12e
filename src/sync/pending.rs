// =============================================================================
// Pending-Sync Store (System B)
// =============================================================================
//
// Once a report has a row in the authoritative cache it is tracked here by id
// only. The index is a pointer list: the cache row carries all the state.
//
// Per id, one sync pass does:
//
//   row missing           -> drop id (already resolved)
//   confirmed             -> drop id
//   submitted             -> keep; the webhook cycle owns it
//   failed, under cap     -> failed -> pending, then submit
//   failed, cap reached   -> keep for manual retry, counted as failed
//   pending               -> submit
//
// Submitting: accepted -> submitted (+ confirmation delivery, dropping the id
// once confirmed); rejected -> failed with the error recorded.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use super::local_queue::LocalQueue;
use super::webhook::{deliver_confirmation, Delivery};
use crate::cache::{ReportCache, Transition};
use crate::db::{keys, LocalStore};
use crate::dmf::{DmfReceipt, RegulatorEndpoint, SubmitStatus};
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::model::{DmfStatus, QueuedReport, ReportId, StoredReport};

/// Counters from one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub synced: u32,
    pub failed: u32,
}

/// The persisted id list
#[derive(Clone)]
pub struct PendingIndex {
    store: LocalStore,
}

impl PendingIndex {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn ids(&self) -> Vec<ReportId> {
        self.store.list(keys::PENDING_SYNC).await
    }

    pub async fn contains(&self, id: ReportId) -> bool {
        self.ids().await.contains(&id)
    }

    /// Add an id; returns false if it was already tracked
    pub async fn track(&self, id: ReportId) -> Result<bool> {
        self.store
            .update_list::<ReportId, _, _>(keys::PENDING_SYNC, |ids| {
                if ids.contains(&id) {
                    false
                } else {
                    ids.push(id);
                    true
                }
            })
            .await
    }

    pub async fn untrack(&self, id: ReportId) -> Result<()> {
        self.store
            .update_list::<ReportId, _, _>(keys::PENDING_SYNC, |ids| ids.retain(|i| *i != id))
            .await
    }
}

#[derive(Clone)]
pub struct PendingSync {
    index: PendingIndex,
    cache: Arc<dyn ReportCache>,
    regulator: Arc<dyn RegulatorEndpoint>,
    identity: IdentityResolver,
    queue: LocalQueue,
    max_dmf_attempts: u32,
    sync_lock: Arc<Mutex<()>>,
}

impl PendingSync {
    pub fn new(
        index: PendingIndex,
        cache: Arc<dyn ReportCache>,
        regulator: Arc<dyn RegulatorEndpoint>,
        identity: IdentityResolver,
        queue: LocalQueue,
        max_dmf_attempts: u32,
    ) -> Self {
        Self {
            index,
            cache,
            regulator,
            identity,
            queue,
            max_dmf_attempts,
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn index(&self) -> &PendingIndex {
        &self.index
    }

    /// Run one pass over the index. Never fails; problems become counters.
    pub async fn sync(&self) -> SyncCounts {
        let mut counts = SyncCounts::default();

        let Ok(_guard) = self.sync_lock.try_lock() else {
            log::debug!("Pending sync already running, skipping");
            return counts;
        };

        self.adopt_orphans().await;

        let ids = self.index.ids().await;
        if ids.is_empty() {
            return counts;
        }
        log::info!("Pending sync: {} tracked report(s)", ids.len());

        for id in ids {
            match self.sync_one(id).await {
                Ok(Some(true)) => counts.synced += 1,
                Ok(Some(false)) => counts.failed += 1,
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Pending sync of {} failed: {}", id, e);
                    counts.failed += 1;
                }
            }
        }

        log::info!(
            "Pending sync complete: {} synced, {} failed",
            counts.synced,
            counts.failed
        );
        counts
    }

    /// Manually retry a report, starting its attempt budget over
    pub async fn retry_report(&self, id: ReportId) -> Result<StoredReport> {
        let report = self
            .cache
            .transition(id, Transition::Retry { reset_attempts: true })
            .await?;
        self.index.track(id).await?;
        Ok(report)
    }

    /// `Some(true)` submitted, `Some(false)` attempt failed, `None` nothing to do
    async fn sync_one(&self, id: ReportId) -> Result<Option<bool>> {
        let Some(report) = self.cache.get(id).await? else {
            log::info!("Pending report {} no longer exists, dropping", id);
            self.index.untrack(id).await?;
            return Ok(None);
        };

        if report.dmf_status.is_terminal() {
            self.index.untrack(id).await?;
            return Ok(None);
        }

        match report.dmf_status {
            DmfStatus::Submitted | DmfStatus::Confirmed => Ok(None),
            DmfStatus::Failed => {
                if report.dmf_attempts >= self.max_dmf_attempts {
                    log::debug!(
                        "Report {} reached {} DMF attempts, waiting for manual retry",
                        id,
                        report.dmf_attempts
                    );
                    return Ok(None);
                }
                let report = self
                    .cache
                    .transition(id, Transition::Retry { reset_attempts: false })
                    .await?;
                self.submit(report).await.map(Some)
            }
            DmfStatus::Pending => self.submit(report).await.map(Some),
        }
    }

    async fn submit(&self, report: StoredReport) -> Result<bool> {
        let id = report.id;

        // A receipt in history means the regulator already has this report even
        // though the cache never heard about it. Record it instead of resubmitting.
        let known_receipt = self.queue.history_for(id).await.map(|entry| DmfReceipt {
            confirmation_number: entry.dmf_confirmation_number,
            object_id: entry.dmf_object_id,
        });

        let result = match known_receipt {
            Some(receipt) => {
                log::info!("Report {} already accepted as {}", id, receipt.confirmation_number);
                Ok(receipt)
            }
            None => self.regulator.submit_report(&report).await,
        };

        let status = SubmitStatus::of(&result);
        match result {
            Ok(receipt) => {
                let submitted = self
                    .cache
                    .transition(id, Transition::Submitted { receipt, at: Utc::now() })
                    .await?;
                match deliver_confirmation(self.cache.as_ref(), self.regulator.as_ref(), &submitted).await {
                    Ok(Delivery::Confirmed) => self.index.untrack(id).await?,
                    Ok(Delivery::Failed { .. }) => {}
                    Err(e) => log::warn!("Confirmation delivery for {} failed: {}", id, e),
                }
                Ok(true)
            }
            Err(e) => {
                log::warn!("DMF submission of {} failed ({:?}): {}", id, status, e);
                self.cache
                    .transition(id, Transition::Failed { error: e.to_string() })
                    .await?;
                Ok(false)
            }
        }
    }

    /// Track cache rows of the current identity that still need the regulator
    /// but are referenced by neither store (e.g. the process died between
    /// leaving the local queue and entering the index).
    async fn adopt_orphans(&self) {
        let owner = match self.identity.current().await {
            Ok(identity) => identity.owner(),
            Err(e) => {
                log::warn!("Identity unavailable, skipping untracked report scan: {}", e);
                return;
            }
        };

        // Cache first, queue second: anything inserted by a drain in between
        // is still visible in the queue and is left to that drain.
        let unresolved: Vec<StoredReport> = match self.cache.list_owned_by(&owner).await {
            Ok(reports) => reports
                .into_iter()
                .filter(|r| matches!(r.dmf_status, DmfStatus::Pending | DmfStatus::Failed))
                .collect(),
            Err(e) => {
                log::warn!("Failed to scan cache for untracked reports: {}", e);
                return;
            }
        };
        if unresolved.is_empty() {
            return;
        }

        let queued: HashSet<ReportId> = self
            .queue
            .queued()
            .await
            .iter()
            .map(|q: &QueuedReport| q.local_id)
            .collect();
        let tracked: HashSet<ReportId> = self.index.ids().await.into_iter().collect();

        for report in unresolved {
            if queued.contains(&report.id) || tracked.contains(&report.id) {
                continue;
            }
            match self.index.track(report.id).await {
                Ok(_) => log::info!("Adopted untracked {} report {}", report.dmf_status, report.id),
                Err(e) => log::warn!("Failed to adopt report {}: {}", report.id, e),
            }
        }
    }
}
