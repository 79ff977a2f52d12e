// Rewards drawing entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::report::{ReportId, UserId};

/// A member's entry in one drawing, keyed by `(user_id, drawing_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardsEntry {
    pub user_id: UserId,
    pub drawing_id: String,
    /// Reports seen while entered; growing this list never re-enters the drawing
    pub associated_report_ids: Vec<ReportId>,
    pub entered_at: DateTime<Utc>,
}

/// Opt-in recorded on the device while the user is still anonymous
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDrawingEntry {
    pub drawing_id: String,
    #[serde(default)]
    pub associated_report_ids: Vec<ReportId>,
    pub entered_at: DateTime<Utc>,
}
