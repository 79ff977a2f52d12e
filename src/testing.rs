//! Test helpers: in-memory databases, sample reports and scripted collaborators

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::connectivity::ConnectivityProbe;
use crate::dmf::{DmfReceipt, RegulatorEndpoint, SubmitError, WebhookRequest};
use crate::model::{
    AnonymousId, HarvestPayload, Owner, QueuedReport, ReportId, SpeciesCounts, StoredReport,
};

/// In-memory database with every migration applied
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

pub fn sample_payload() -> HarvestPayload {
    HarvestPayload {
        has_license: true,
        wrc_id: Some("WRC-55120".to_string()),
        first_name: "Jordan".to_string(),
        last_name: "Reyes".to_string(),
        zip_code: "27954".to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1988, 4, 2),
        harvest_date: NaiveDate::from_ymd_opt(2026, 10, 18).expect("valid date"),
        area_of_harvest: "Pamlico Sound".to_string(),
        species: SpeciesCounts {
            red_drum: 1,
            flounder: 2,
            ..Default::default()
        },
        used_hook_and_line: true,
        gear_code: None,
        want_text_confirmation: false,
        phone: None,
        want_email_confirmation: true,
        email: Some("jordan@example.com".to_string()),
        enter_raffle: false,
    }
}

pub fn queued_report() -> QueuedReport {
    QueuedReport {
        local_id: ReportId::new(),
        local_confirmation_number: crate::confirmation::generate(),
        payload: sample_payload(),
        retry_count: 0,
        last_error: None,
        queued_at: chrono::Utc::now(),
    }
}

/// A pending cache row owned by an anonymous device
pub fn anonymous_report(anonymous_id: &str) -> StoredReport {
    StoredReport::from_queued(
        &queued_report(),
        Owner::Anonymous(AnonymousId(anonymous_id.to_string())),
    )
}

/// Regulator double that replays scripted submit outcomes, then falls back to a default
pub struct ScriptedRegulator {
    submits: Mutex<VecDeque<Result<DmfReceipt, SubmitError>>>,
    submit_ok_by_default: AtomicBool,
    webhook_ok_by_default: AtomicBool,
    submit_calls: Mutex<Vec<ReportId>>,
    webhook_calls: AtomicUsize,
    receipts_issued: AtomicUsize,
}

impl ScriptedRegulator {
    /// Accepts every report and every webhook
    pub fn accepting() -> Self {
        Self {
            submits: Mutex::new(VecDeque::new()),
            submit_ok_by_default: AtomicBool::new(true),
            webhook_ok_by_default: AtomicBool::new(true),
            submit_calls: Mutex::new(Vec::new()),
            webhook_calls: AtomicUsize::new(0),
            receipts_issued: AtomicUsize::new(0),
        }
    }

    /// Fails every report and every webhook with a network error
    pub fn unreachable() -> Self {
        let regulator = Self::accepting();
        regulator.set_submit_ok(false);
        regulator.set_webhook_ok(false);
        regulator
    }

    pub fn set_submit_ok(&self, ok: bool) {
        self.submit_ok_by_default.store(ok, Ordering::SeqCst);
    }

    pub fn set_webhook_ok(&self, ok: bool) {
        self.webhook_ok_by_default.store(ok, Ordering::SeqCst);
    }

    pub fn push_submit(&self, result: Result<DmfReceipt, SubmitError>) {
        self.submits.lock().unwrap().push_back(result);
    }

    pub fn submit_calls(&self) -> Vec<ReportId> {
        self.submit_calls.lock().unwrap().clone()
    }

    pub fn webhook_calls(&self) -> usize {
        self.webhook_calls.load(Ordering::SeqCst)
    }

    fn next_receipt(&self) -> DmfReceipt {
        let n = self.receipts_issued.fetch_add(1, Ordering::SeqCst) + 1;
        DmfReceipt {
            confirmation_number: format!("DMF-{:05}", n),
            object_id: format!("obj-{}", n),
        }
    }
}

#[async_trait]
impl RegulatorEndpoint for ScriptedRegulator {
    async fn submit_report(&self, report: &StoredReport) -> Result<DmfReceipt, SubmitError> {
        self.submit_calls.lock().unwrap().push(report.id);
        let scripted = self.submits.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None if self.submit_ok_by_default.load(Ordering::SeqCst) => Ok(self.next_receipt()),
            None => Err(SubmitError::Network("connection reset".to_string())),
        }
    }

    async fn trigger_webhook(&self, _request: &WebhookRequest) -> Result<(), SubmitError> {
        self.webhook_calls.fetch_add(1, Ordering::SeqCst);
        if self.webhook_ok_by_default.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SubmitError::Timeout("webhook".to_string()))
        }
    }
}

/// Connectivity probe with a fixed answer
pub struct StaticProbe(pub AtomicBool);

impl StaticProbe {
    pub fn online() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn offline() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
