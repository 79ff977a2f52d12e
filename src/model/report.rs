// =============================================================================
// Harvest Reports - Queue Items, Cache Rows and the DMF Status Machine
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a report in the authoritative cache.
///
/// A report keeps the `local_id` it was queued with, so inserting it into the
/// cache twice addresses the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub Uuid);

impl ReportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ReportId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Authenticated rewards member id (issued by the auth provider)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device-scoped id used before the user signs in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnonymousId(pub String);

impl fmt::Display for AnonymousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who owns a cached report. Exactly one of the two ownership columns is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Owner {
    User(UserId),
    Anonymous(AnonymousId),
}

impl Owner {
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Owner::User(id) => Some(id),
            Owner::Anonymous(_) => None,
        }
    }

    pub fn anonymous_id(&self) -> Option<&AnonymousId> {
        match self {
            Owner::Anonymous(id) => Some(id),
            Owner::User(_) => None,
        }
    }
}

// =============================================================================
// Harvest payload
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeciesCounts {
    pub red_drum: u32,
    pub flounder: u32,
    pub spotted_seatrout: u32,
    pub weakfish: u32,
    pub striped_bass: u32,
}

/// The fields a harvest report carries to the regulator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestPayload {
    // License status
    pub has_license: bool,
    pub wrc_id: Option<String>,

    // Identity as submitted
    pub first_name: String,
    pub last_name: String,
    pub zip_code: String,
    pub date_of_birth: Option<NaiveDate>,

    // Harvest
    pub harvest_date: NaiveDate,
    pub area_of_harvest: String,
    pub species: SpeciesCounts,

    // Gear
    pub used_hook_and_line: bool,
    pub gear_code: Option<String>,

    // Contact preferences
    pub want_text_confirmation: bool,
    pub phone: Option<String>,
    pub want_email_confirmation: bool,
    pub email: Option<String>,

    /// Opt-in for the current rewards drawing
    #[serde(default)]
    pub enter_raffle: bool,
}

/// How the user wants the regulator's confirmation delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPreference {
    Email,
    Sms,
    Both,
    None,
}

impl HarvestPayload {
    /// Only counts a channel when its address is actually present
    pub fn delivery_preference(&self) -> DeliveryPreference {
        let email = self.want_email_confirmation && has_text(&self.email);
        let sms = self.want_text_confirmation && has_text(&self.phone);
        match (email, sms) {
            (true, true) => DeliveryPreference::Both,
            (true, false) => DeliveryPreference::Email,
            (false, true) => DeliveryPreference::Sms,
            (false, false) => DeliveryPreference::None,
        }
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

// =============================================================================
// System A: local queue items
// =============================================================================

/// A report waiting in the local durable queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedReport {
    pub local_id: ReportId,
    pub local_confirmation_number: String,
    pub payload: HarvestPayload,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// Record of a report the regulator accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub local_id: ReportId,
    pub local_confirmation_number: String,
    pub report_id: ReportId,
    pub dmf_confirmation_number: String,
    pub dmf_object_id: String,
    pub submitted_at: DateTime<Utc>,
}

/// A queue item dropped after exhausting its retries, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedReport {
    pub report: QueuedReport,
    pub failed_at: DateTime<Utc>,
}

// =============================================================================
// DMF status machine
// =============================================================================

/// Regulator submission state of a cached report
///
/// ```text
/// pending --(submit ok)------> submitted --(webhook ok)--> confirmed
/// pending --(submit fails)---> failed
/// failed  --(retry)----------> pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmfStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl DmfStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmfStatus::Pending => "pending",
            DmfStatus::Submitted => "submitted",
            DmfStatus::Confirmed => "confirmed",
            DmfStatus::Failed => "failed",
        }
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: DmfStatus) -> bool {
        matches!(
            (self, next),
            (DmfStatus::Pending, DmfStatus::Submitted)
                | (DmfStatus::Pending, DmfStatus::Failed)
                | (DmfStatus::Submitted, DmfStatus::Confirmed)
                | (DmfStatus::Failed, DmfStatus::Pending)
        )
    }

    /// The regulator has the report
    pub fn is_accepted(&self) -> bool {
        matches!(self, DmfStatus::Submitted | DmfStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DmfStatus::Confirmed)
    }
}

impl fmt::Display for DmfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DmfStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DmfStatus::Pending),
            "submitted" => Ok(DmfStatus::Submitted),
            "confirmed" => Ok(DmfStatus::Confirmed),
            "failed" => Ok(DmfStatus::Failed),
            other => Err(format!("unknown dmf_status '{}'", other)),
        }
    }
}

// =============================================================================
// Authoritative cache row
// =============================================================================

/// A report as held by the authoritative report cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReport {
    pub id: ReportId,
    pub owner: Owner,
    pub local_confirmation_number: String,

    pub dmf_status: DmfStatus,
    pub dmf_confirmation_number: Option<String>,
    pub dmf_object_id: Option<String>,
    pub dmf_submitted_at: Option<DateTime<Utc>>,
    pub dmf_error: Option<String>,
    /// Regulator attempts made while the report sat in the pending-sync index
    pub dmf_attempts: u32,
    pub webhook_attempts: u32,

    pub payload: HarvestPayload,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredReport {
    /// A fresh `pending` row for a queued report
    pub fn from_queued(queued: &QueuedReport, owner: Owner) -> Self {
        let now = Utc::now();
        Self {
            id: queued.local_id,
            owner,
            local_confirmation_number: queued.local_confirmation_number.clone(),
            dmf_status: DmfStatus::Pending,
            dmf_confirmation_number: None,
            dmf_object_id: None,
            dmf_submitted_at: None,
            dmf_error: None,
            dmf_attempts: 0,
            webhook_attempts: 0,
            payload: queued.payload.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Work that has not reached the regulator yet.
///
/// A report is either only on the device or already in the cache, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Unsynced {
    LocalOnly(QueuedReport),
    CacheResident(ReportId),
}

impl Unsynced {
    pub fn report_id(&self) -> ReportId {
        match self {
            Unsynced::LocalOnly(queued) => queued.local_id,
            Unsynced::CacheResident(id) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use DmfStatus::*;

        assert!(Pending.can_transition_to(Submitted));
        assert!(Pending.can_transition_to(Failed));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Failed.can_transition_to(Pending));

        // Confirmed is terminal
        for next in [Pending, Submitted, Failed, Confirmed] {
            assert!(!Confirmed.can_transition_to(next));
        }
        assert!(!Submitted.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Submitted));
        assert!(!Pending.can_transition_to(Confirmed));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("SUBMITTED".parse::<DmfStatus>(), Ok(DmfStatus::Submitted));
        assert!("lost".parse::<DmfStatus>().is_err());
    }

    #[test]
    fn test_delivery_preference_requires_address() {
        let mut payload = HarvestPayload {
            want_email_confirmation: true,
            want_text_confirmation: true,
            phone: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(payload.delivery_preference(), DeliveryPreference::None);

        payload.email = Some("angler@example.com".to_string());
        assert_eq!(payload.delivery_preference(), DeliveryPreference::Email);

        payload.phone = Some("9195550100".to_string());
        assert_eq!(payload.delivery_preference(), DeliveryPreference::Both);
    }

    #[test]
    fn test_queued_report_tolerates_missing_counters() {
        // Older queue entries were written without retryCount/lastError
        let json = serde_json::json!({
            "localId": "6f1c0a52-3d0e-4b53-9a36-8f3c2a1b7e10",
            "localConfirmationNumber": "HRV-20261019-ABCDEF-0001",
            "payload": serde_json::to_value(HarvestPayload::default()).unwrap(),
            "queuedAt": "2026-10-19T12:00:00Z"
        });
        let queued: QueuedReport = serde_json::from_value(json).unwrap();
        assert_eq!(queued.retry_count, 0);
        assert!(queued.last_error.is_none());
    }
}
