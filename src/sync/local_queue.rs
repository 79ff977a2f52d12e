// =============================================================================
// Local Durable Queue (System A)
// =============================================================================
//
// Reports land here first, before they have a cache identity. Enqueue never
// touches the network and never fails from the caller's point of view. A drain
// walks a snapshot in FIFO order and merges each item's result back into the
// *current* persisted queue before moving on, so reports enqueued while a drain
// runs are kept and a killed process picks up where it stopped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use super::pending::PendingIndex;
use crate::confirmation;
use crate::db::{keys, LocalStore};
use crate::error::Result;
use crate::model::{FailedReport, HarvestPayload, HistoryEntry, QueuedReport, ReportId};

/// Result of handing one queued report to the submit function
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    /// The regulator accepted the report
    Submitted {
        entry: HistoryEntry,
        /// Confirmation delivery still outstanding; tracked by the pending index
        webhook_pending: bool,
    },
    /// The report now lives in the cache without a regulator confirmation and
    /// is tracked by the pending index from here on
    HandedOff {
        report_id: ReportId,
        error: Option<String>,
    },
    /// Nothing durable happened; the item stays queued
    Failed(String),
}

/// Counters from one drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    /// Accepted by the regulator and moved to history
    pub synced: u32,
    /// Moved to the pending index
    pub handed_off: u32,
    /// Attempts that did not reach the regulator successfully
    pub failed: u32,
    /// Items that exhausted their retries and left the queue
    pub dropped: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_retries: u32,
    pub max_history: usize,
    pub max_failed: usize,
}

#[derive(Clone)]
pub struct LocalQueue {
    store: LocalStore,
    pending: PendingIndex,
    limits: QueueLimits,
    drain_lock: Arc<Mutex<()>>,
}

impl LocalQueue {
    pub fn new(store: LocalStore, pending: PendingIndex, limits: QueueLimits) -> Self {
        Self {
            store,
            pending,
            limits,
            drain_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Stamp a local confirmation number and append the report to the queue.
    ///
    /// Always returns the queued report; a failed local write is logged.
    pub async fn enqueue(&self, payload: HarvestPayload) -> QueuedReport {
        let report = QueuedReport {
            local_id: ReportId::new(),
            local_confirmation_number: confirmation::generate(),
            payload,
            retry_count: 0,
            last_error: None,
            queued_at: Utc::now(),
        };

        let item = report.clone();
        match self
            .store
            .update_list::<QueuedReport, _, _>(keys::QUEUE, move |queue| {
                queue.push(item);
                queue.len()
            })
            .await
        {
            Ok(len) => log::info!(
                "Queued report {} ({}), queue length {}",
                report.local_id,
                report.local_confirmation_number,
                len
            ),
            Err(e) => log::error!("Failed to persist queued report {}: {}", report.local_id, e),
        }

        report
    }

    pub async fn queued(&self) -> Vec<QueuedReport> {
        self.store.list(keys::QUEUE).await
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.store.list(keys::HISTORY).await
    }

    pub async fn failed(&self) -> Vec<FailedReport> {
        self.store.list(keys::FAILED).await
    }

    /// Receipt recorded for a report, if the regulator accepted it
    pub async fn history_for(&self, report_id: ReportId) -> Option<HistoryEntry> {
        self.history()
            .await
            .into_iter()
            .find(|entry| entry.report_id == report_id)
    }

    /// Drain the queue through `submit_fn`.
    ///
    /// Returns zero counts without doing anything when another drain is
    /// already running.
    pub async fn drain<F, Fut>(&self, mut submit_fn: F) -> DrainOutcome
    where
        F: FnMut(QueuedReport) -> Fut,
        Fut: Future<Output = ForwardOutcome>,
    {
        let mut outcome = DrainOutcome::default();

        let Ok(_guard) = self.drain_lock.try_lock() else {
            log::debug!("Local queue drain already running, skipping");
            return outcome;
        };

        let snapshot: Vec<QueuedReport> = self.store.list(keys::QUEUE).await;
        if snapshot.is_empty() {
            return outcome;
        }
        log::info!("Draining {} queued report(s)", snapshot.len());

        let recorded: HashMap<ReportId, ReportId> = self
            .history()
            .await
            .into_iter()
            .map(|entry| (entry.local_id, entry.report_id))
            .collect();

        for item in snapshot {
            let local_id = item.local_id;

            // Accepted before; only the queue removal was lost
            if let Some(&report_id) = recorded.get(&local_id) {
                log::info!("Report {} already has a receipt, removing from queue", local_id);
                if let Err(e) = self.remove(local_id).await {
                    log::error!("Failed to remove recorded report {}: {}", local_id, e);
                    continue;
                }
                self.track_pending(report_id).await;
                continue;
            }

            match submit_fn(item).await {
                ForwardOutcome::Submitted {
                    entry,
                    webhook_pending,
                } => {
                    let report_id = entry.report_id;
                    if let Err(e) = self.record_submitted(entry).await {
                        log::error!("Failed to record submission of {}: {}", local_id, e);
                        continue;
                    }
                    if webhook_pending {
                        self.track_pending(report_id).await;
                    }
                    outcome.synced += 1;
                }
                ForwardOutcome::HandedOff { report_id, error } => {
                    if let Err(e) = self.remove(local_id).await {
                        log::error!("Failed to remove handed-off report {}: {}", local_id, e);
                        continue;
                    }
                    self.track_pending(report_id).await;
                    outcome.handed_off += 1;
                    if let Some(error) = error {
                        log::warn!("Report {} handed to pending sync after: {}", local_id, error);
                        outcome.failed += 1;
                    }
                }
                ForwardOutcome::Failed(reason) => {
                    outcome.failed += 1;
                    match self.record_failure(local_id, &reason).await {
                        Ok(true) => outcome.dropped += 1,
                        Ok(false) => {}
                        Err(e) => log::error!("Failed to record failure of {}: {}", local_id, e),
                    }
                }
            }
        }

        log::info!(
            "Local queue drain: {} synced, {} handed off, {} failed, {} dropped",
            outcome.synced,
            outcome.handed_off,
            outcome.failed,
            outcome.dropped
        );
        outcome
    }

    /// Move a dropped report back into the queue with a fresh retry budget
    pub async fn requeue_failed(&self, local_id: ReportId) -> Result<bool> {
        let restored = self
            .store
            .update_list::<FailedReport, _, _>(keys::FAILED, |failed| {
                let idx = failed.iter().position(|f| f.report.local_id == local_id)?;
                Some(failed.remove(idx).report)
            })
            .await?;

        let Some(mut report) = restored else {
            return Ok(false);
        };
        report.retry_count = 0;

        self.store
            .update_list::<QueuedReport, _, _>(keys::QUEUE, move |queue| {
                if !queue.iter().any(|q| q.local_id == report.local_id) {
                    queue.push(report);
                }
            })
            .await?;

        log::info!("Requeued failed report {}", local_id);
        Ok(true)
    }

    // History is written before the queue entry goes away, so an interrupted
    // drain can only ever leave a report in both places, never in neither.
    async fn record_submitted(&self, entry: HistoryEntry) -> Result<()> {
        let local_id = entry.local_id;
        let max_history = self.limits.max_history;
        self.store
            .update_list::<HistoryEntry, _, _>(keys::HISTORY, move |history| {
                if !history.iter().any(|h| h.local_id == entry.local_id) {
                    history.push(entry);
                }
                trim_front(history, max_history);
            })
            .await?;
        self.remove(local_id).await
    }

    async fn remove(&self, local_id: ReportId) -> Result<()> {
        self.store
            .update_list::<QueuedReport, _, _>(keys::QUEUE, |queue| {
                queue.retain(|q| q.local_id != local_id)
            })
            .await
    }

    /// Bump the retry count; returns true when the item was dropped
    async fn record_failure(&self, local_id: ReportId, reason: &str) -> Result<bool> {
        let max_retries = self.limits.max_retries;
        let dropped = self
            .store
            .update_list::<QueuedReport, _, _>(keys::QUEUE, |queue| {
                let idx = queue.iter().position(|q| q.local_id == local_id)?;
                let item = &mut queue[idx];
                item.retry_count += 1;
                item.last_error = Some(reason.to_string());
                if item.retry_count >= max_retries {
                    Some(queue.remove(idx))
                } else {
                    None
                }
            })
            .await?;

        let Some(report) = dropped else {
            return Ok(false);
        };

        log::warn!(
            "Dropping report {} after {} attempts: {}",
            report.local_id,
            report.retry_count,
            reason
        );

        let max_failed = self.limits.max_failed;
        self.store
            .update_list::<FailedReport, _, _>(keys::FAILED, move |failed| {
                failed.push(FailedReport {
                    report,
                    failed_at: Utc::now(),
                });
                trim_front(failed, max_failed);
            })
            .await?;
        Ok(true)
    }

    async fn track_pending(&self, report_id: ReportId) {
        if let Err(e) = self.pending.track(report_id).await {
            // The cache row is still there; pending sync adopts it later
            log::error!("Failed to add {} to pending sync index: {}", report_id, e);
        }
    }
}

/// Keep the newest `max` entries
fn trim_front<T>(items: &mut Vec<T>, max: usize) {
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_payload, setup_test_db};

    fn limits() -> QueueLimits {
        QueueLimits {
            max_retries: 3,
            max_history: 50,
            max_failed: 50,
        }
    }

    async fn queue() -> LocalQueue {
        let store = LocalStore::new(setup_test_db().await);
        LocalQueue::new(store.clone(), PendingIndex::new(store), limits())
    }

    fn receipt_for(item: &QueuedReport, n: u32) -> ForwardOutcome {
        ForwardOutcome::Submitted {
            entry: HistoryEntry {
                local_id: item.local_id,
                local_confirmation_number: item.local_confirmation_number.clone(),
                report_id: item.local_id,
                dmf_confirmation_number: format!("DMF-{}", n),
                dmf_object_id: format!("obj-{}", n),
                submitted_at: Utc::now(),
            },
            webhook_pending: false,
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_successful_drain() {
        let queue = queue().await;
        let queued = queue.enqueue(sample_payload()).await;
        assert!(confirmation::is_local_confirmation(&queued.local_confirmation_number));
        assert_eq!(queue.queued().await.len(), 1);
        assert_eq!(queue.history().await.len(), 0);

        let outcome = queue.drain(|item| async move { receipt_for(&item, 42) }).await;
        assert_eq!(outcome.synced, 1);

        assert!(queue.queued().await.is_empty());
        let history = queue.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].dmf_confirmation_number, "DMF-42");
        assert_eq!(history[0].local_confirmation_number, queued.local_confirmation_number);
    }

    #[tokio::test]
    async fn test_drop_after_retry_cap() {
        let queue = queue().await;
        let queued = queue.enqueue(sample_payload()).await;

        for attempt in 1..=3u32 {
            let outcome = queue
                .drain(|_| async { ForwardOutcome::Failed("network unreachable".to_string()) })
                .await;
            assert_eq!(outcome.failed, 1);
            if attempt < 3 {
                let items = queue.queued().await;
                assert_eq!(items[0].retry_count, attempt);
                assert_eq!(outcome.dropped, 0);
            } else {
                assert_eq!(outcome.dropped, 1);
            }
        }

        assert!(queue.queued().await.is_empty());
        assert!(queue.history().await.is_empty());
        let failed = queue.failed().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].report.local_id, queued.local_id);
        assert_eq!(failed[0].report.last_error.as_deref(), Some("network unreachable"));
    }

    #[tokio::test]
    async fn test_requeue_failed_restores_item() {
        let queue = queue().await;
        let queued = queue.enqueue(sample_payload()).await;
        for _ in 0..3 {
            queue.drain(|_| async { ForwardOutcome::Failed("offline".to_string()) }).await;
        }
        assert!(queue.queued().await.is_empty());

        assert!(queue.requeue_failed(queued.local_id).await.unwrap());
        assert!(!queue.requeue_failed(queued.local_id).await.unwrap());

        let items = queue.queued().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 0);
        // Diagnostics survive the requeue
        assert_eq!(items[0].last_error.as_deref(), Some("offline"));
        assert!(queue.failed().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_is_fifo_and_keeps_items_enqueued_midway() {
        let queue = queue().await;
        let first = queue.enqueue(sample_payload()).await;
        let second = queue.enqueue(sample_payload()).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let late = Arc::new(Mutex::new(None));
        let outcome = queue
            .drain(|item| {
                let seen = seen.clone();
                let late = late.clone();
                let queue = queue.clone();
                async move {
                    seen.lock().unwrap().push(item.local_id);
                    let mut late = late.lock().await;
                    if late.is_none() {
                        *late = Some(queue.enqueue(sample_payload()).await);
                    }
                    receipt_for(&item, 1)
                }
            })
            .await;

        assert_eq!(outcome.synced, 2);
        assert_eq!(*seen.lock().unwrap(), vec![first.local_id, second.local_id]);

        // The report enqueued during the drain waits for the next one
        let remaining = queue.queued().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(Some(remaining[0].clone()), *late.lock().await);
    }

    #[tokio::test]
    async fn test_overlapping_drain_is_skipped() {
        let queue = queue().await;
        queue.enqueue(sample_payload()).await;

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let inner_outcome = Arc::new(Mutex::new(None));
        let outcome = queue
            .drain(|item| {
                let queue = queue.clone();
                let calls = calls.clone();
                let inner_outcome = inner_outcome.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    // A second trigger fires while this drain is mid-flight
                    let nested = queue
                        .drain(|_| async { ForwardOutcome::Failed("should not run".to_string()) })
                        .await;
                    *inner_outcome.lock().await = Some(nested);
                    receipt_for(&item, 7)
                }
            })
            .await;

        assert_eq!(outcome.synced, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(*inner_outcome.lock().await, Some(DrainOutcome::default()));
        assert_eq!(queue.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_handoff_moves_item_to_pending_index() {
        let store = LocalStore::new(setup_test_db().await);
        let pending = PendingIndex::new(store.clone());
        let queue = LocalQueue::new(store, pending.clone(), limits());
        let queued = queue.enqueue(sample_payload()).await;

        let outcome = queue
            .drain(|item| async move {
                ForwardOutcome::HandedOff {
                    report_id: item.local_id,
                    error: Some("HTTP 503".to_string()),
                }
            })
            .await;

        assert_eq!(outcome.handed_off, 1);
        assert_eq!(outcome.failed, 1);
        assert!(queue.queued().await.is_empty());
        assert!(queue.history().await.is_empty());
        assert_eq!(pending.ids().await, vec![queued.local_id]);
    }

    #[tokio::test]
    async fn test_recorded_item_is_not_submitted_again() {
        let store = LocalStore::new(setup_test_db().await);
        let pending = PendingIndex::new(store.clone());
        let queue = LocalQueue::new(store.clone(), pending.clone(), limits());
        let queued = queue.enqueue(sample_payload()).await;

        // History written, then the process died before the queue entry went away
        let entry = match receipt_for(&queued, 5) {
            ForwardOutcome::Submitted { entry, .. } => entry,
            other => panic!("unexpected outcome {:?}", other),
        };
        store
            .update_list::<HistoryEntry, _, _>(keys::HISTORY, move |history| history.push(entry))
            .await
            .unwrap();

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let outcome = queue
            .drain(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    ForwardOutcome::Failed("should not run".to_string())
                }
            })
            .await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(outcome, DrainOutcome::default());
        assert!(queue.queued().await.is_empty());
        assert_eq!(queue.history().await.len(), 1);
        // Pending sync decides whether a confirmation is still owed
        assert_eq!(pending.ids().await, vec![queued.local_id]);
    }

    #[test]
    fn test_trim_front_keeps_newest() {
        let mut items = vec![1, 2, 3, 4, 5];
        trim_front(&mut items, 3);
        assert_eq!(items, vec![3, 4, 5]);
        trim_front(&mut items, 10);
        assert_eq!(items.len(), 3);
    }
}
