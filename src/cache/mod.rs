//! Authoritative report cache
//!
//! The cache is the single source of truth for `dmf_status`. Both the
//! pending-sync drain and the webhook retry cycle read it; status only changes
//! through `ReportCache::transition`, which refuses edges the state machine does
//! not have.

mod mapping;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dmf::DmfReceipt;
use crate::error::Result;
use crate::identity::Session;
use crate::model::{AnonymousId, DmfStatus, Owner, ReportId, RewardsEntry, StoredReport, UserId};

pub use mapping::{row_to_rewards_entry, row_to_stored_report};
pub use sqlite::SqliteReportCache;

/// A state machine edge plus the data recorded with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// pending -> submitted
    Submitted { receipt: DmfReceipt, at: DateTime<Utc> },
    /// pending -> failed
    Failed { error: String },
    /// submitted -> confirmed
    Confirmed,
    /// failed -> pending; `reset_attempts` starts the attempt budget over
    Retry { reset_attempts: bool },
}

impl Transition {
    pub fn target(&self) -> DmfStatus {
        match self {
            Transition::Submitted { .. } => DmfStatus::Submitted,
            Transition::Failed { .. } => DmfStatus::Failed,
            Transition::Confirmed => DmfStatus::Confirmed,
            Transition::Retry { .. } => DmfStatus::Pending,
        }
    }
}

#[async_trait]
pub trait ReportCache: Send + Sync {
    async fn get(&self, id: ReportId) -> Result<Option<StoredReport>>;

    /// Insert a `pending` row; an existing row with the same id is left alone.
    /// Returns whether a row was inserted.
    async fn insert_pending(&self, report: &StoredReport) -> Result<bool>;

    /// Apply a state machine edge, returning the updated row
    async fn transition(&self, id: ReportId, transition: Transition) -> Result<StoredReport>;

    /// Count a failed webhook attempt, returning the new total
    async fn record_webhook_failure(&self, id: ReportId) -> Result<u32>;

    async fn list_by_status(&self, status: DmfStatus) -> Result<Vec<StoredReport>>;

    /// `submitted` reports whose webhook has been tried fewer than `max_attempts` times
    async fn list_webhook_due(&self, max_attempts: u32) -> Result<Vec<StoredReport>>;

    async fn list_owned_by(&self, owner: &Owner) -> Result<Vec<StoredReport>>;

    /// Move one report from `from` to `to`. Returns false when the report is not
    /// owned by `from` (already moved, or someone else's).
    async fn reassign_owner(&self, id: ReportId, from: &AnonymousId, to: &UserId) -> Result<bool>;

    /// Removal by the data owner
    async fn delete(&self, id: ReportId) -> Result<bool>;

    /// Create or refresh the member record for an authenticated identity
    async fn upsert_member(&self, session: &Session, converted_from: Option<&AnonymousId>) -> Result<()>;

    async fn drawing_entry(&self, user_id: &UserId, drawing_id: &str) -> Result<Option<RewardsEntry>>;

    /// Enter a drawing. Entering twice keeps one entry and merges report ids.
    /// Returns whether a new entry was created.
    async fn upsert_drawing_entry(
        &self,
        user_id: &UserId,
        drawing_id: &str,
        report_ids: &[ReportId],
    ) -> Result<bool>;

    /// Attach a report to an existing entry; never creates one
    async fn associate_report(&self, user_id: &UserId, drawing_id: &str, report_id: ReportId) -> Result<bool>;

    async fn drawing_entries_for(&self, user_id: &UserId) -> Result<Vec<RewardsEntry>>;
}
