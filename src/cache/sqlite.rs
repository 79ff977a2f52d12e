// SQLite-backed report cache

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::mapping::{parse_report_ids, row_to_rewards_entry, row_to_stored_report};
use super::{ReportCache, Transition};
use crate::error::{Result, SyncError};
use crate::identity::Session;
use crate::model::{AnonymousId, DmfStatus, Owner, ReportId, RewardsEntry, StoredReport, UserId};

#[derive(Clone)]
pub struct SqliteReportCache {
    pool: SqlitePool,
}

impl SqliteReportCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }
}

#[async_trait]
impl ReportCache for SqliteReportCache {
    async fn get(&self, id: ReportId) -> Result<Option<StoredReport>> {
        let row = sqlx::query("SELECT * FROM reports WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stored_report).transpose()
    }

    async fn insert_pending(&self, report: &StoredReport) -> Result<bool> {
        let p = &report.payload;
        let result = sqlx::query(
            r#"INSERT INTO reports (
                id, user_id, anonymous_user_id, local_confirmation_number,
                dmf_status, dmf_attempts, webhook_attempts,
                has_license, wrc_id, first_name, last_name, zip_code, date_of_birth,
                harvest_date, area_of_harvest,
                red_drum_count, flounder_count, spotted_seatrout_count, weakfish_count, striped_bass_count,
                used_hook_and_line, gear_code,
                want_text_confirmation, phone, want_email_confirmation, email, enter_raffle,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'pending', 0, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(report.id.to_string())
        .bind(report.owner.user_id().map(|u| u.0.clone()))
        .bind(report.owner.anonymous_id().map(|a| a.0.clone()))
        .bind(&report.local_confirmation_number)
        .bind(p.has_license)
        .bind(&p.wrc_id)
        .bind(&p.first_name)
        .bind(&p.last_name)
        .bind(&p.zip_code)
        .bind(p.date_of_birth.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(p.harvest_date.format("%Y-%m-%d").to_string())
        .bind(&p.area_of_harvest)
        .bind(p.species.red_drum as i64)
        .bind(p.species.flounder as i64)
        .bind(p.species.spotted_seatrout as i64)
        .bind(p.species.weakfish as i64)
        .bind(p.species.striped_bass as i64)
        .bind(p.used_hook_and_line)
        .bind(&p.gear_code)
        .bind(p.want_text_confirmation)
        .bind(&p.phone)
        .bind(p.want_email_confirmation)
        .bind(&p.email)
        .bind(p.enter_raffle)
        .bind(report.created_at.to_rfc3339())
        .bind(report.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn transition(&self, id: ReportId, transition: Transition) -> Result<StoredReport> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("report {}", id)))?;

        let from = current.dmf_status;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(SyncError::IllegalTransition { from, to });
        }

        // Guarded on the status we read, so a concurrent writer cannot be overrun
        let query = match &transition {
            Transition::Submitted { receipt, at } => sqlx::query(
                r#"UPDATE reports SET
                   dmf_status = 'submitted',
                   dmf_confirmation_number = ?,
                   dmf_object_id = ?,
                   dmf_submitted_at = ?,
                   dmf_error = NULL,
                   dmf_attempts = dmf_attempts + 1,
                   updated_at = ?
                   WHERE id = ? AND dmf_status = ?"#,
            )
            .bind(&receipt.confirmation_number)
            .bind(&receipt.object_id)
            .bind(at.to_rfc3339()),
            Transition::Failed { error } => sqlx::query(
                r#"UPDATE reports SET
                   dmf_status = 'failed',
                   dmf_error = ?,
                   dmf_attempts = dmf_attempts + 1,
                   updated_at = ?
                   WHERE id = ? AND dmf_status = ?"#,
            )
            .bind(error),
            Transition::Confirmed => sqlx::query(
                r#"UPDATE reports SET
                   dmf_status = 'confirmed',
                   updated_at = ?
                   WHERE id = ? AND dmf_status = ?"#,
            ),
            Transition::Retry { reset_attempts } => sqlx::query(
                r#"UPDATE reports SET
                   dmf_status = 'pending',
                   dmf_attempts = CASE WHEN ? THEN 0 ELSE dmf_attempts END,
                   updated_at = ?
                   WHERE id = ? AND dmf_status = ?"#,
            )
            .bind(*reset_attempts),
        };

        let result = query
            .bind(Self::now())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Lost a race: report whatever state the row is in now
            let now_status = self
                .get(id)
                .await?
                .map(|r| r.dmf_status)
                .ok_or_else(|| SyncError::NotFound(format!("report {}", id)))?;
            return Err(SyncError::IllegalTransition { from: now_status, to });
        }

        log::debug!("Report {}: {} -> {}", id, from, to);

        self.get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("report {}", id)))
    }

    async fn record_webhook_failure(&self, id: ReportId) -> Result<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"UPDATE reports SET
               webhook_attempts = webhook_attempts + 1,
               updated_at = ?
               WHERE id = ?
               RETURNING webhook_attempts"#,
        )
        .bind(Self::now())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|a| u32::try_from(a).unwrap_or(u32::MAX))
            .ok_or_else(|| SyncError::NotFound(format!("report {}", id)))
    }

    async fn list_by_status(&self, status: DmfStatus) -> Result<Vec<StoredReport>> {
        let rows = sqlx::query("SELECT * FROM reports WHERE dmf_status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_stored_report).collect()
    }

    async fn list_webhook_due(&self, max_attempts: u32) -> Result<Vec<StoredReport>> {
        let rows = sqlx::query(
            r#"SELECT * FROM reports
               WHERE dmf_status = 'submitted' AND webhook_attempts < ?
               ORDER BY dmf_submitted_at"#,
        )
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_stored_report).collect()
    }

    async fn list_owned_by(&self, owner: &Owner) -> Result<Vec<StoredReport>> {
        let rows = match owner {
            Owner::User(user) => {
                sqlx::query("SELECT * FROM reports WHERE user_id = ? ORDER BY created_at")
                    .bind(&user.0)
                    .fetch_all(&self.pool)
                    .await?
            }
            Owner::Anonymous(anon) => {
                sqlx::query("SELECT * FROM reports WHERE anonymous_user_id = ? ORDER BY created_at")
                    .bind(&anon.0)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_stored_report).collect()
    }

    async fn reassign_owner(&self, id: ReportId, from: &AnonymousId, to: &UserId) -> Result<bool> {
        // One statement per report: it either moves entirely or not at all
        let result = sqlx::query(
            r#"UPDATE reports SET
               user_id = ?,
               anonymous_user_id = NULL,
               updated_at = ?
               WHERE id = ? AND anonymous_user_id = ?"#,
        )
        .bind(&to.0)
        .bind(Self::now())
        .bind(id.to_string())
        .bind(&from.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: ReportId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM reports WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_member(&self, session: &Session, converted_from: Option<&AnonymousId>) -> Result<()> {
        let now = Self::now();
        sqlx::query(
            r#"INSERT INTO members (user_id, email, anonymous_user_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                 email = COALESCE(excluded.email, email),
                 anonymous_user_id = COALESCE(anonymous_user_id, excluded.anonymous_user_id),
                 updated_at = excluded.updated_at"#,
        )
        .bind(&session.user_id.0)
        .bind(&session.email)
        .bind(converted_from.map(|a| a.0.clone()))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drawing_entry(&self, user_id: &UserId, drawing_id: &str) -> Result<Option<RewardsEntry>> {
        let row = sqlx::query("SELECT * FROM rewards_entries WHERE user_id = ? AND drawing_id = ?")
            .bind(&user_id.0)
            .bind(drawing_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_rewards_entry).transpose()
    }

    async fn upsert_drawing_entry(
        &self,
        user_id: &UserId,
        drawing_id: &str,
        report_ids: &[ReportId],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT associated_report_ids FROM rewards_entries WHERE user_id = ? AND drawing_id = ?",
        )
        .bind(&user_id.0)
        .bind(drawing_id)
        .fetch_optional(&mut *tx)
        .await?;

        let created = match existing {
            Some(json) => {
                let mut ids = parse_report_ids(Some(&json));
                let before = ids.len();
                merge_ids(&mut ids, report_ids);
                if ids.len() != before {
                    sqlx::query(
                        "UPDATE rewards_entries SET associated_report_ids = ? WHERE user_id = ? AND drawing_id = ?",
                    )
                    .bind(serde_json::to_string(&ids)?)
                    .bind(&user_id.0)
                    .bind(drawing_id)
                    .execute(&mut *tx)
                    .await?;
                }
                false
            }
            None => {
                let mut ids = Vec::new();
                merge_ids(&mut ids, report_ids);
                sqlx::query(
                    r#"INSERT INTO rewards_entries (user_id, drawing_id, associated_report_ids, entered_at)
                       VALUES (?, ?, ?, ?)"#,
                )
                .bind(&user_id.0)
                .bind(drawing_id)
                .bind(serde_json::to_string(&ids)?)
                .bind(Self::now())
                .execute(&mut *tx)
                .await?;
                true
            }
        };

        tx.commit().await?;
        Ok(created)
    }

    async fn associate_report(&self, user_id: &UserId, drawing_id: &str, report_id: ReportId) -> Result<bool> {
        match self.drawing_entry(user_id, drawing_id).await? {
            Some(entry) if !entry.associated_report_ids.contains(&report_id) => {
                self.upsert_drawing_entry(user_id, drawing_id, &[report_id]).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn drawing_entries_for(&self, user_id: &UserId) -> Result<Vec<RewardsEntry>> {
        let rows = sqlx::query("SELECT * FROM rewards_entries WHERE user_id = ? ORDER BY entered_at")
            .bind(&user_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_rewards_entry).collect()
    }
}

fn merge_ids(target: &mut Vec<ReportId>, extra: &[ReportId]) {
    for id in extra {
        if !target.contains(id) {
            target.push(*id);
        }
    }
}
