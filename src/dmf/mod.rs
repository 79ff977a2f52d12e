pub mod client; // HTTP client for the regulator's report + webhook endpoints

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DeliveryPreference, ReportId, StoredReport};

// Re-export commonly used types
pub use client::DmfClient;

/// Identifiers the regulator issues when it accepts a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmfReceipt {
    pub confirmation_number: String,
    pub object_id: String,
}

/// Request to (re)send the user's confirmation email/SMS
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub report_id: ReportId,
    pub confirmation_number: String,
    pub object_id: String,
    pub delivery: DeliveryPreference,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl WebhookRequest {
    /// Build the request for an accepted report; `None` before the regulator
    /// has issued identifiers
    pub fn for_report(report: &StoredReport) -> Option<Self> {
        Some(Self {
            report_id: report.id,
            confirmation_number: report.dmf_confirmation_number.clone()?,
            object_id: report.dmf_object_id.clone()?,
            delivery: report.payload.delivery_preference(),
            email: report.payload.email.clone(),
            phone: report.payload.phone.clone(),
        })
    }
}

/// Error types for regulator calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Request never produced a response
    #[error("Network error: {0}")]
    Network(String),
    /// No response in time. The regulator may still have accepted the write.
    #[error("Timed out: {0}")]
    Timeout(String),
    /// The regulator answered with an error status
    #[error("DMF rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Authentication error: {0}")]
    Auth(String),
    /// Response arrived but could not be understood
    #[error("Parse error: {0}")]
    Parse(String),
}

impl SubmitError {
    /// Whether retrying could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SubmitError::Network(_) | SubmitError::Timeout(_) | SubmitError::Parse(_) => true,
            SubmitError::Rejected { status, .. } => *status >= 500 || *status == 429,
            SubmitError::Auth(_) => false,
        }
    }
}

/// Outcome classification used for logging and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    TransientFailure,
    PermanentFailure,
}

impl SubmitStatus {
    pub fn of<T>(result: &Result<T, SubmitError>) -> Self {
        match result {
            Ok(_) => SubmitStatus::Accepted,
            Err(e) if e.is_transient() => SubmitStatus::TransientFailure,
            Err(_) => SubmitStatus::PermanentFailure,
        }
    }
}

/// The regulator as seen by the sync engine.
///
/// Neither call is assumed idempotent; callers bound retries with caps.
#[async_trait]
pub trait RegulatorEndpoint: Send + Sync {
    /// Forward a harvest report
    async fn submit_report(&self, report: &StoredReport) -> Result<DmfReceipt, SubmitError>;

    /// Trigger the confirmation email/SMS for an accepted report
    async fn trigger_webhook(&self, request: &WebhookRequest) -> Result<(), SubmitError>;
}
