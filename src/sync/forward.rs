//! Forwarding a queued report
//!
//! The submit function the local drain runs for each item. The cache row is
//! written before the regulator is called and is reused by every later
//! attempt. The queue keeps the item (counting retries and the last error)
//! until the regulator accepts it or the queue's retry cap is reached; only
//! then does the pending index take over.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;

use super::local_queue::ForwardOutcome;
use super::webhook::{deliver_confirmation, Delivery};
use crate::cache::{ReportCache, Transition};
use crate::dmf::{RegulatorEndpoint, SubmitStatus};
use crate::identity::{Identity, IdentityResolver};
use crate::model::{DmfStatus, HistoryEntry, QueuedReport, StoredReport};
use crate::rewards::RewardsLedger;

#[derive(Clone)]
pub struct Forwarder {
    cache: Arc<dyn ReportCache>,
    regulator: Arc<dyn RegulatorEndpoint>,
    identity: IdentityResolver,
    rewards: RewardsLedger,
    current_drawing_id: Option<String>,
    max_queue_retries: u32,
}

impl Forwarder {
    pub fn new(
        cache: Arc<dyn ReportCache>,
        regulator: Arc<dyn RegulatorEndpoint>,
        identity: IdentityResolver,
        rewards: RewardsLedger,
        current_drawing_id: Option<String>,
        max_queue_retries: u32,
    ) -> Self {
        Self {
            cache,
            regulator,
            identity,
            rewards,
            current_drawing_id,
            max_queue_retries,
        }
    }

    pub async fn forward(&self, item: QueuedReport) -> ForwardOutcome {
        let id = item.local_id;

        // An earlier attempt may already have written the row
        let row = match self.cache.get(id).await {
            Ok(Some(existing)) => match self.resume(&item, existing).await {
                ControlFlow::Continue(row) => row,
                ControlFlow::Break(outcome) => return outcome,
            },
            Ok(None) => match self.insert(&item).await {
                Ok(row) => row,
                Err(outcome) => return outcome,
            },
            Err(e) => return ForwardOutcome::Failed(format!("cache unavailable: {}", e)),
        };

        self.submit(&item, row).await
    }

    /// Write the pending row for a first attempt
    async fn insert(&self, item: &QueuedReport) -> Result<StoredReport, ForwardOutcome> {
        // Attribution is decided now, not at enqueue time
        let identity = self
            .identity
            .current()
            .await
            .map_err(|e| ForwardOutcome::Failed(format!("identity unavailable: {}", e)))?;
        let row = StoredReport::from_queued(item, identity.owner());
        self.cache
            .insert_pending(&row)
            .await
            .map_err(|e| ForwardOutcome::Failed(format!("cache write failed: {}", e)))?;

        self.record_rewards(&identity, item).await;
        Ok(row)
    }

    /// Pick up a row written by an earlier attempt
    async fn resume(&self, item: &QueuedReport, existing: StoredReport) -> ControlFlow<ForwardOutcome, StoredReport> {
        if let Some(entry) = accepted_entry(item, &existing) {
            log::info!("Report {} was already accepted, recording receipt", item.local_id);
            return ControlFlow::Break(ForwardOutcome::Submitted {
                entry,
                webhook_pending: existing.dmf_status == DmfStatus::Submitted,
            });
        }

        match existing.dmf_status {
            DmfStatus::Pending => ControlFlow::Continue(existing),
            DmfStatus::Failed => {
                match self
                    .cache
                    .transition(existing.id, Transition::Retry { reset_attempts: false })
                    .await
                {
                    Ok(row) => ControlFlow::Continue(row),
                    Err(e) => ControlFlow::Break(ForwardOutcome::Failed(format!("cache write failed: {}", e))),
                }
            }
            // Accepted but the receipt never made it to the row; pending sync reconciles
            _ => ControlFlow::Break(ForwardOutcome::HandedOff {
                report_id: existing.id,
                error: None,
            }),
        }
    }

    async fn submit(&self, item: &QueuedReport, row: StoredReport) -> ForwardOutcome {
        let id = row.id;
        let result = self.regulator.submit_report(&row).await;
        let status = SubmitStatus::of(&result);
        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                log::warn!("DMF submission of {} failed ({:?}): {}", id, status, e);
                if let Err(te) = self
                    .cache
                    .transition(id, Transition::Failed { error: e.to_string() })
                    .await
                {
                    log::warn!("Failed to record failure of {}: {}", id, te);
                }

                let attempts = item.retry_count + 1;
                if attempts < self.max_queue_retries {
                    return ForwardOutcome::Failed(e.to_string());
                }
                log::warn!("Report {} failed {} queued attempts, handing to pending sync", id, attempts);
                return ForwardOutcome::HandedOff {
                    report_id: id,
                    error: Some(e.to_string()),
                };
            }
        };

        let submitted_at = Utc::now();
        let entry = HistoryEntry {
            local_id: item.local_id,
            local_confirmation_number: item.local_confirmation_number.clone(),
            report_id: id,
            dmf_confirmation_number: receipt.confirmation_number.clone(),
            dmf_object_id: receipt.object_id.clone(),
            submitted_at,
        };
        log::info!(
            "Report {} accepted by DMF as {}",
            item.local_confirmation_number,
            receipt.confirmation_number
        );

        let submitted = match self
            .cache
            .transition(id, Transition::Submitted { receipt, at: submitted_at })
            .await
        {
            Ok(report) => report,
            Err(e) => {
                // History keeps the receipt; pending sync records it later
                log::error!("Failed to record DMF receipt for {}: {}", id, e);
                return ForwardOutcome::Submitted {
                    entry,
                    webhook_pending: true,
                };
            }
        };

        let confirmed = match deliver_confirmation(self.cache.as_ref(), self.regulator.as_ref(), &submitted).await {
            Ok(Delivery::Confirmed) => true,
            Ok(Delivery::Failed { .. }) => false,
            Err(e) => {
                log::warn!("Confirmation delivery for {} failed: {}", id, e);
                false
            }
        };

        ForwardOutcome::Submitted {
            entry,
            webhook_pending: !confirmed,
        }
    }

    async fn record_rewards(&self, identity: &Identity, item: &QueuedReport) {
        let Some(drawing_id) = self.current_drawing_id.as_deref() else {
            return;
        };

        if item.payload.enter_raffle {
            if let Err(e) = self.rewards.enter_drawing(identity, drawing_id).await {
                log::warn!("Failed to enter drawing {}: {}", drawing_id, e);
            }
        }
        if let Err(e) = self.rewards.associate_report(identity, drawing_id, item.local_id).await {
            log::warn!("Failed to attach report {} to drawing {}: {}", item.local_id, drawing_id, e);
        }
    }
}

/// History entry for a row the regulator already accepted
fn accepted_entry(item: &QueuedReport, existing: &StoredReport) -> Option<HistoryEntry> {
    match (&existing.dmf_confirmation_number, &existing.dmf_object_id) {
        (Some(number), Some(object_id)) if existing.dmf_status.is_accepted() => Some(HistoryEntry {
            local_id: item.local_id,
            local_confirmation_number: item.local_confirmation_number.clone(),
            report_id: existing.id,
            dmf_confirmation_number: number.clone(),
            dmf_object_id: object_id.clone(),
            submitted_at: existing.dmf_submitted_at.unwrap_or(existing.updated_at),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteReportCache;
    use crate::db::LocalStore;
    use crate::dmf::SubmitError;
    use crate::identity::Session;
    use crate::model::{Owner, UserId};
    use crate::testing::{queued_report, setup_test_db, ScriptedRegulator};

    struct Harness {
        forwarder: Forwarder,
        cache: Arc<SqliteReportCache>,
        regulator: Arc<ScriptedRegulator>,
        identity: IdentityResolver,
        store: LocalStore,
    }

    async fn harness(regulator: ScriptedRegulator, drawing: Option<&str>) -> Harness {
        let pool = setup_test_db().await;
        let store = LocalStore::new(pool.clone());
        let cache = Arc::new(SqliteReportCache::new(pool));
        let regulator = Arc::new(regulator);
        let identity = IdentityResolver::new(store.clone());
        let rewards = RewardsLedger::new(cache.clone(), store.clone());
        let forwarder = Forwarder::new(
            cache.clone(),
            regulator.clone(),
            identity.clone(),
            rewards,
            drawing.map(str::to_string),
            3,
        );
        Harness {
            forwarder,
            cache,
            regulator,
            identity,
            store,
        }
    }

    #[tokio::test]
    async fn test_accepted_report_is_confirmed() {
        let h = harness(ScriptedRegulator::accepting(), None).await;
        let item = queued_report();

        match h.forwarder.forward(item.clone()).await {
            ForwardOutcome::Submitted { entry, webhook_pending } => {
                assert_eq!(entry.report_id, item.local_id);
                assert_eq!(entry.dmf_confirmation_number, "DMF-00001");
                assert!(!webhook_pending);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let stored = h.cache.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(stored.dmf_status, DmfStatus::Confirmed);
        assert_eq!(stored.owner, Owner::Anonymous(h.identity.anonymous_id().await.unwrap()));
    }

    #[tokio::test]
    async fn test_rejected_report_stays_queued_until_cap() {
        let h = harness(ScriptedRegulator::accepting(), None).await;
        h.regulator.push_submit(Err(SubmitError::Rejected {
            status: 503,
            message: "maintenance".to_string(),
        }));
        let mut item = queued_report();

        let outcome = h.forwarder.forward(item.clone()).await;
        assert!(matches!(outcome, ForwardOutcome::Failed(ref reason) if reason.contains("503")));
        let stored = h.cache.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(stored.dmf_status, DmfStatus::Failed);
        assert_eq!(stored.dmf_attempts, 1);

        // Last attempt the queue allows
        item.retry_count = 2;
        h.regulator.push_submit(Err(SubmitError::Rejected {
            status: 503,
            message: "maintenance".to_string(),
        }));
        let outcome = h.forwarder.forward(item.clone()).await;
        assert!(matches!(
            outcome,
            ForwardOutcome::HandedOff { report_id, error: Some(_) } if report_id == item.local_id
        ));
        let stored = h.cache.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(stored.dmf_status, DmfStatus::Failed);
        assert_eq!(stored.dmf_attempts, 2);
        assert_eq!(h.regulator.submit_calls(), vec![item.local_id, item.local_id]);
    }

    #[tokio::test]
    async fn test_webhook_failure_leaves_confirmation_pending() {
        let h = harness(ScriptedRegulator::accepting(), None).await;
        h.regulator.set_webhook_ok(false);
        let item = queued_report();

        let outcome = h.forwarder.forward(item.clone()).await;
        assert!(matches!(outcome, ForwardOutcome::Submitted { webhook_pending: true, .. }));
        let stored = h.cache.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(stored.dmf_status, DmfStatus::Submitted);
        assert_eq!(stored.webhook_attempts, 1);
    }

    #[tokio::test]
    async fn test_accepted_row_is_not_resubmitted() {
        let h = harness(ScriptedRegulator::accepting(), None).await;
        let item = queued_report();
        h.forwarder.forward(item.clone()).await;
        assert_eq!(h.regulator.submit_calls().len(), 1);

        // Same item again, as after a crash before the queue entry was removed
        let outcome = h.forwarder.forward(item.clone()).await;
        assert!(matches!(outcome, ForwardOutcome::Submitted { webhook_pending: false, .. }));
        assert_eq!(h.regulator.submit_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unaccepted_row_is_resubmitted() {
        let h = harness(ScriptedRegulator::accepting(), None).await;
        let owner = Owner::Anonymous(h.identity.anonymous_id().await.unwrap());

        // Row written but the process died before the regulator was called
        let pending = queued_report();
        h.cache
            .insert_pending(&StoredReport::from_queued(&pending, owner.clone()))
            .await
            .unwrap();
        let outcome = h.forwarder.forward(pending.clone()).await;
        assert!(matches!(outcome, ForwardOutcome::Submitted { webhook_pending: false, .. }));

        // Row left failed by an earlier queued attempt
        let failed = queued_report();
        h.cache
            .insert_pending(&StoredReport::from_queued(&failed, owner))
            .await
            .unwrap();
        h.cache
            .transition(failed.local_id, Transition::Failed { error: "timeout".to_string() })
            .await
            .unwrap();
        let outcome = h.forwarder.forward(failed.clone()).await;
        assert!(matches!(outcome, ForwardOutcome::Submitted { .. }));

        assert_eq!(h.regulator.submit_calls(), vec![pending.local_id, failed.local_id]);
        let stored = h.cache.get(failed.local_id).await.unwrap().unwrap();
        assert_eq!(stored.dmf_status, DmfStatus::Confirmed);
        assert_eq!(stored.dmf_attempts, 2);
    }

    #[tokio::test]
    async fn test_unreadable_identity_leaves_item_queued() {
        let h = harness(ScriptedRegulator::accepting(), None).await;
        sqlx::query("ALTER TABLE kv_store RENAME TO kv_store_offline")
            .execute(h.store.pool())
            .await
            .unwrap();

        let item = queued_report();
        let outcome = h.forwarder.forward(item.clone()).await;
        assert!(matches!(outcome, ForwardOutcome::Failed(ref reason) if reason.starts_with("identity unavailable")));
        assert!(h.cache.get(item.local_id).await.unwrap().is_none());
        assert!(h.regulator.submit_calls().is_empty());
    }

    #[tokio::test]
    async fn test_member_opt_in_enters_current_drawing() {
        let h = harness(ScriptedRegulator::accepting(), Some("2026-Q4")).await;
        let user = UserId("member-9".to_string());
        h.identity
            .set_session(&Session {
                user_id: user.clone(),
                email: None,
                expires_at: None,
            })
            .await
            .unwrap();

        let mut item = queued_report();
        item.payload.enter_raffle = true;
        h.forwarder.forward(item.clone()).await;

        let stored = h.cache.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(stored.owner, Owner::User(user.clone()));
        let entry = h.cache.drawing_entry(&user, "2026-Q4").await.unwrap().unwrap();
        assert_eq!(entry.associated_report_ids, vec![item.local_id]);

        // Without the opt-in a report never creates an entry
        let other = harness(ScriptedRegulator::accepting(), Some("2026-Q4")).await;
        other.identity
            .set_session(&Session {
                user_id: user.clone(),
                email: None,
                expires_at: None,
            })
            .await
            .unwrap();
        other.forwarder.forward(queued_report()).await;
        assert!(other.cache.drawing_entries_for(&user).await.unwrap().is_empty());
    }
}
