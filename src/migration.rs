//! Anonymous to member migration
//!
//! When a device that has been reporting anonymously signs in, its cache rows
//! and local drawing opt-ins move to the member. Every step is conditional
//! (rows are only reassigned while still anonymous, entries are upserted), so a
//! migration that died halfway is finished by simply running it again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ReportCache;
use crate::db::{keys, LocalStore};
use crate::error::Result;
use crate::identity::Session;
use crate::model::{AnonymousId, Owner, UserId};
use crate::rewards::RewardsLedger;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub reports_migrated: u32,
    pub reports_failed: u32,
    pub entries_created: u32,
    pub entries_merged: u32,
    pub entries_failed: u32,
    /// Nothing was left behind
    pub complete: bool,
}

/// Last migration, kept for support diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub anonymous_id: AnonymousId,
    pub user_id: UserId,
    pub outcome: MigrationOutcome,
    pub migrated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct IdentityMigration {
    cache: Arc<dyn ReportCache>,
    rewards: RewardsLedger,
    store: LocalStore,
}

impl IdentityMigration {
    pub fn new(cache: Arc<dyn ReportCache>, rewards: RewardsLedger, store: LocalStore) -> Self {
        Self { cache, rewards, store }
    }

    /// Move everything `anonymous_id` owns to the session's member.
    ///
    /// Fails only if the member record cannot be written; per-item problems are
    /// counted and left for the next run.
    pub async fn migrate(&self, anonymous_id: &AnonymousId, session: &Session) -> Result<MigrationOutcome> {
        let user_id = &session.user_id;
        log::info!("Migrating anonymous {} to member {}", anonymous_id, user_id);

        self.cache.upsert_member(session, Some(anonymous_id)).await?;

        let mut outcome = MigrationOutcome::default();

        let reports = self
            .cache
            .list_owned_by(&Owner::Anonymous(anonymous_id.clone()))
            .await?;
        for report in reports {
            match self.cache.reassign_owner(report.id, anonymous_id, user_id).await {
                Ok(true) => outcome.reports_migrated += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Failed to migrate report {}: {}", report.id, e);
                    outcome.reports_failed += 1;
                }
            }
        }

        let mut migrated_drawings = Vec::new();
        for entry in self.rewards.local_entries().await {
            match self
                .cache
                .upsert_drawing_entry(user_id, &entry.drawing_id, &entry.associated_report_ids)
                .await
            {
                Ok(created) => {
                    if created {
                        outcome.entries_created += 1;
                    } else {
                        outcome.entries_merged += 1;
                    }
                    migrated_drawings.push(entry.drawing_id);
                }
                Err(e) => {
                    log::warn!("Failed to migrate drawing entry {}: {}", entry.drawing_id, e);
                    outcome.entries_failed += 1;
                }
            }
        }

        if !migrated_drawings.is_empty() {
            if let Err(e) = self.rewards.clear_local_entries(&migrated_drawings).await {
                // Harmless: the next run merges them again
                log::warn!("Failed to clear migrated drawing opt-ins: {}", e);
            }
        }

        outcome.complete = outcome.reports_failed == 0 && outcome.entries_failed == 0;

        let record = MigrationRecord {
            anonymous_id: anonymous_id.clone(),
            user_id: user_id.clone(),
            outcome: outcome.clone(),
            migrated_at: Utc::now(),
        };
        if let Err(e) = self.store.set(keys::LAST_MIGRATION, &record).await {
            log::warn!("Failed to record migration: {}", e);
        }

        log::info!(
            "Migration to {}: {} report(s) moved, {} entr(ies) created, {} merged{}",
            user_id,
            outcome.reports_migrated,
            outcome.entries_created,
            outcome.entries_merged,
            if outcome.complete { "" } else { " (incomplete, will retry)" }
        );
        Ok(outcome)
    }

    /// Whether anything owned by `anonymous_id` is still waiting to move
    pub async fn is_outstanding(&self, anonymous_id: &AnonymousId) -> Result<bool> {
        if !self.rewards.local_entries().await.is_empty() {
            return Ok(true);
        }
        let owned = self
            .cache
            .list_owned_by(&Owner::Anonymous(anonymous_id.clone()))
            .await?;
        Ok(!owned.is_empty())
    }

    pub async fn last_migration(&self) -> Option<MigrationRecord> {
        self.store.get(keys::LAST_MIGRATION).await
    }
}
