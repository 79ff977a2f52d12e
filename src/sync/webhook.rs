//! Confirmation delivery and the webhook retry cycle
//!
//! A report the regulator accepted is `submitted` until the user's confirmation
//! email/SMS has been triggered; then it is `confirmed`. A failed trigger only
//! bumps `webhook_attempts`. The retry cycle picks up every submitted report
//! still under the attempt cap.

use std::sync::Arc;

use serde::Serialize;

use super::pending::PendingIndex;
use crate::cache::{ReportCache, Transition};
use crate::dmf::{RegulatorEndpoint, WebhookRequest};
use crate::error::{Result, SyncError};
use crate::model::{DeliveryPreference, DmfStatus, StoredReport};

/// What happened to one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Confirmed,
    Failed { attempts: u32, error: String },
}

/// Trigger the confirmation for a submitted report and record the result.
///
/// Reports that asked for no confirmation are confirmed without a call.
pub async fn deliver_confirmation(
    cache: &dyn ReportCache,
    regulator: &dyn RegulatorEndpoint,
    report: &StoredReport,
) -> Result<Delivery> {
    if report.dmf_status != DmfStatus::Submitted {
        return Err(SyncError::IllegalTransition {
            from: report.dmf_status,
            to: DmfStatus::Confirmed,
        });
    }

    let request = WebhookRequest::for_report(report).ok_or_else(|| {
        SyncError::InvalidRow(format!("report {} is submitted without DMF identifiers", report.id))
    })?;

    if request.delivery != DeliveryPreference::None {
        if let Err(e) = regulator.trigger_webhook(&request).await {
            let attempts = cache.record_webhook_failure(report.id).await?;
            log::warn!(
                "Confirmation webhook for {} failed (attempt {}): {}",
                report.id,
                attempts,
                e
            );
            return Ok(Delivery::Failed {
                attempts,
                error: e.to_string(),
            });
        }
    }

    cache.transition(report.id, Transition::Confirmed).await?;
    log::info!("Report {} confirmed ({:?})", report.id, request.delivery);
    Ok(Delivery::Confirmed)
}

/// Counters from one webhook cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WebhookCounts {
    pub retried: u32,
    pub succeeded: u32,
}

#[derive(Clone)]
pub struct WebhookRetry {
    cache: Arc<dyn ReportCache>,
    regulator: Arc<dyn RegulatorEndpoint>,
    index: PendingIndex,
    max_attempts: u32,
}

impl WebhookRetry {
    pub fn new(
        cache: Arc<dyn ReportCache>,
        regulator: Arc<dyn RegulatorEndpoint>,
        index: PendingIndex,
        max_attempts: u32,
    ) -> Self {
        Self {
            cache,
            regulator,
            index,
            max_attempts,
        }
    }

    pub async fn run(&self) -> WebhookCounts {
        let mut counts = WebhookCounts::default();

        let due = match self.cache.list_webhook_due(self.max_attempts).await {
            Ok(due) => due,
            Err(e) => {
                log::warn!("Failed to list reports awaiting confirmation: {}", e);
                return counts;
            }
        };

        for report in due {
            counts.retried += 1;
            match deliver_confirmation(self.cache.as_ref(), self.regulator.as_ref(), &report).await {
                Ok(Delivery::Confirmed) => {
                    counts.succeeded += 1;
                    if let Err(e) = self.index.untrack(report.id).await {
                        log::warn!("Failed to untrack confirmed report {}: {}", report.id, e);
                    }
                }
                Ok(Delivery::Failed { attempts, .. }) if attempts >= self.max_attempts => {
                    // The regulator has the report; only the confirmation is lost
                    log::warn!("Giving up on confirmation for {} after {} attempts", report.id, attempts);
                    if let Err(e) = self.index.untrack(report.id).await {
                        log::warn!("Failed to untrack report {}: {}", report.id, e);
                    }
                }
                Ok(Delivery::Failed { .. }) => {}
                Err(e) => log::warn!("Confirmation retry for {} failed: {}", report.id, e),
            }
        }

        if counts.retried > 0 {
            log::info!(
                "Webhook retry: {} of {} confirmed",
                counts.succeeded,
                counts.retried
            );
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteReportCache;
    use crate::db::LocalStore;
    use crate::dmf::DmfReceipt;
    use crate::testing::{anonymous_report, setup_test_db, ScriptedRegulator};
    use chrono::Utc;

    async fn submitted_report(cache: &SqliteReportCache, email: bool) -> StoredReport {
        let mut report = anonymous_report("anon-1");
        if !email {
            report.payload.want_email_confirmation = false;
        }
        cache.insert_pending(&report).await.unwrap();
        cache
            .transition(
                report.id,
                Transition::Submitted {
                    receipt: DmfReceipt {
                        confirmation_number: "DMF-00031".to_string(),
                        object_id: "obj-31".to_string(),
                    },
                    at: Utc::now(),
                },
            )
            .await
            .unwrap()
    }

    async fn setup(regulator: ScriptedRegulator, max: u32) -> (WebhookRetry, Arc<SqliteReportCache>, PendingIndex, Arc<ScriptedRegulator>) {
        let pool = setup_test_db().await;
        let cache = Arc::new(SqliteReportCache::new(pool.clone()));
        let regulator = Arc::new(regulator);
        let index = PendingIndex::new(LocalStore::new(pool));
        let retry = WebhookRetry::new(cache.clone(), regulator.clone(), index.clone(), max);
        (retry, cache, index, regulator)
    }

    #[tokio::test]
    async fn test_failed_webhook_only_counts_attempt() {
        let (retry, cache, _, _) = setup(ScriptedRegulator::unreachable(), 5).await;
        let report = submitted_report(&cache, true).await;
        assert_eq!(report.webhook_attempts, 0);

        let counts = retry.run().await;
        assert_eq!(counts, WebhookCounts { retried: 1, succeeded: 0 });

        let stored = cache.get(report.id).await.unwrap().unwrap();
        assert_eq!(stored.webhook_attempts, 1);
        assert_eq!(stored.dmf_status, DmfStatus::Submitted);
    }

    #[tokio::test]
    async fn test_successful_retry_confirms_and_untracks() {
        let (retry, cache, index, regulator) = setup(ScriptedRegulator::accepting(), 5).await;
        let report = submitted_report(&cache, true).await;
        index.track(report.id).await.unwrap();

        let counts = retry.run().await;
        assert_eq!(counts, WebhookCounts { retried: 1, succeeded: 1 });
        assert_eq!(regulator.webhook_calls(), 1);
        assert_eq!(cache.get(report.id).await.unwrap().unwrap().dmf_status, DmfStatus::Confirmed);
        assert!(!index.contains(report.id).await);

        // Nothing left to retry
        assert_eq!(retry.run().await, WebhookCounts::default());
    }

    #[tokio::test]
    async fn test_cap_stops_retries_and_untracks() {
        let (retry, cache, index, regulator) = setup(ScriptedRegulator::unreachable(), 2).await;
        let report = submitted_report(&cache, true).await;
        index.track(report.id).await.unwrap();

        retry.run().await;
        assert!(index.contains(report.id).await);
        retry.run().await;
        assert!(!index.contains(report.id).await);
        assert_eq!(retry.run().await, WebhookCounts::default());
        assert_eq!(regulator.webhook_calls(), 2);
        assert_eq!(cache.get(report.id).await.unwrap().unwrap().dmf_status, DmfStatus::Submitted);
    }

    #[tokio::test]
    async fn test_no_delivery_preference_confirms_without_call() {
        let (retry, cache, _, regulator) = setup(ScriptedRegulator::unreachable(), 5).await;
        let report = submitted_report(&cache, false).await;

        let delivery = deliver_confirmation(cache.as_ref(), regulator.as_ref(), &report)
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Confirmed);
        assert_eq!(regulator.webhook_calls(), 0);
        assert_eq!(retry.run().await, WebhookCounts::default());
    }

    #[tokio::test]
    async fn test_delivery_requires_submitted_report() {
        let (_, cache, _, regulator) = setup(ScriptedRegulator::accepting(), 5).await;
        let report = anonymous_report("anon-1");
        cache.insert_pending(&report).await.unwrap();

        let result = deliver_confirmation(cache.as_ref(), regulator.as_ref(), &report).await;
        assert!(matches!(result, Err(SyncError::IllegalTransition { .. })));
        assert_eq!(regulator.webhook_calls(), 0);
    }
}
