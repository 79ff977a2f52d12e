//! Rewards drawing entries
//!
//! Entering a drawing is an explicit opt-in, separate from submitting a report.
//! Members are entered in the cache; anonymous users get a local flag that the
//! identity migration later turns into a real entry. Reports are attached to an
//! entry opportunistically and never enter anyone by themselves.

use std::sync::Arc;

use chrono::Utc;

use crate::cache::ReportCache;
use crate::db::{keys, LocalStore};
use crate::error::Result;
use crate::identity::Identity;
use crate::model::{LocalDrawingEntry, ReportId};

#[derive(Clone)]
pub struct RewardsLedger {
    cache: Arc<dyn ReportCache>,
    store: LocalStore,
}

impl RewardsLedger {
    pub fn new(cache: Arc<dyn ReportCache>, store: LocalStore) -> Self {
        Self { cache, store }
    }

    /// Enter `identity` into a drawing. Returns false if it was already entered.
    pub async fn enter_drawing(&self, identity: &Identity, drawing_id: &str) -> Result<bool> {
        let created = match identity {
            Identity::Member(user_id) => self.cache.upsert_drawing_entry(user_id, drawing_id, &[]).await?,
            Identity::Anonymous(_) => {
                self.store
                    .update_list::<LocalDrawingEntry, _, _>(keys::LOCAL_DRAWING_ENTRIES, |entries| {
                        if entries.iter().any(|e| e.drawing_id == drawing_id) {
                            return false;
                        }
                        entries.push(LocalDrawingEntry {
                            drawing_id: drawing_id.to_string(),
                            associated_report_ids: Vec::new(),
                            entered_at: Utc::now(),
                        });
                        true
                    })
                    .await?
            }
        };

        if created {
            log::info!("Entered drawing {} ({:?})", drawing_id, identity);
        }
        Ok(created)
    }

    /// Attach a report to an existing entry. No entry, no effect.
    pub async fn associate_report(
        &self,
        identity: &Identity,
        drawing_id: &str,
        report_id: ReportId,
    ) -> Result<bool> {
        match identity {
            Identity::Member(user_id) => self.cache.associate_report(user_id, drawing_id, report_id).await,
            Identity::Anonymous(_) => {
                self.store
                    .update_list::<LocalDrawingEntry, _, _>(keys::LOCAL_DRAWING_ENTRIES, |entries| {
                        match entries.iter_mut().find(|e| e.drawing_id == drawing_id) {
                            Some(entry) if !entry.associated_report_ids.contains(&report_id) => {
                                entry.associated_report_ids.push(report_id);
                                true
                            }
                            _ => false,
                        }
                    })
                    .await
            }
        }
    }

    /// Drawing opt-ins recorded while anonymous
    pub async fn local_entries(&self) -> Vec<LocalDrawingEntry> {
        self.store.list(keys::LOCAL_DRAWING_ENTRIES).await
    }

    /// Drop local opt-ins that now exist as member entries
    pub async fn clear_local_entries(&self, drawing_ids: &[String]) -> Result<()> {
        self.store
            .update_list::<LocalDrawingEntry, _, _>(keys::LOCAL_DRAWING_ENTRIES, |entries| {
                entries.retain(|e| !drawing_ids.contains(&e.drawing_id))
            })
            .await
    }
}
