// Row -> model mapping for the report cache
//
// One function per entity, total over every column. Defaulting rules:
// NULL counters read as 0, NULL flags as false, NULL/invalid report id lists as
// empty. Anything that would break an invariant (bad id, unknown status, both
// or neither owner set) is an `InvalidRow` error instead of a guess.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{Result, SyncError};
use crate::model::{
    AnonymousId, DmfStatus, HarvestPayload, Owner, ReportId, RewardsEntry, SpeciesCounts,
    StoredReport, UserId,
};

pub fn row_to_stored_report(row: &SqliteRow) -> Result<StoredReport> {
    let id_text: String = row.try_get("id")?;
    let id: ReportId = id_text
        .parse()
        .map_err(|e| SyncError::InvalidRow(format!("report id '{}': {}", id_text, e)))?;

    let owner = owner_from_columns(
        &id_text,
        row.try_get::<Option<String>, _>("user_id")?,
        row.try_get::<Option<String>, _>("anonymous_user_id")?,
    )?;

    let status_text: String = row.try_get("dmf_status")?;
    let dmf_status: DmfStatus = status_text
        .parse()
        .map_err(|e: String| SyncError::InvalidRow(format!("report {}: {}", id_text, e)))?;

    let payload = HarvestPayload {
        has_license: flag(row, "has_license")?,
        wrc_id: row.try_get("wrc_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        zip_code: row.try_get("zip_code")?,
        date_of_birth: optional_date(&id_text, row.try_get("date_of_birth")?)?,
        harvest_date: required_date(&id_text, row.try_get("harvest_date")?)?,
        area_of_harvest: row.try_get("area_of_harvest")?,
        species: SpeciesCounts {
            red_drum: count(row, "red_drum_count")?,
            flounder: count(row, "flounder_count")?,
            spotted_seatrout: count(row, "spotted_seatrout_count")?,
            weakfish: count(row, "weakfish_count")?,
            striped_bass: count(row, "striped_bass_count")?,
        },
        used_hook_and_line: flag(row, "used_hook_and_line")?,
        gear_code: row.try_get("gear_code")?,
        want_text_confirmation: flag(row, "want_text_confirmation")?,
        phone: row.try_get("phone")?,
        want_email_confirmation: flag(row, "want_email_confirmation")?,
        email: row.try_get("email")?,
        enter_raffle: flag(row, "enter_raffle")?,
    };

    Ok(StoredReport {
        id,
        owner,
        local_confirmation_number: row.try_get("local_confirmation_number")?,
        dmf_status,
        dmf_confirmation_number: row.try_get("dmf_confirmation_number")?,
        dmf_object_id: row.try_get("dmf_object_id")?,
        dmf_submitted_at: optional_timestamp(&id_text, row.try_get("dmf_submitted_at")?)?,
        dmf_error: row.try_get("dmf_error")?,
        dmf_attempts: count(row, "dmf_attempts")?,
        webhook_attempts: count(row, "webhook_attempts")?,
        payload,
        created_at: required_timestamp(&id_text, row.try_get("created_at")?)?,
        updated_at: required_timestamp(&id_text, row.try_get("updated_at")?)?,
    })
}

pub fn row_to_rewards_entry(row: &SqliteRow) -> Result<RewardsEntry> {
    let user_id: String = row.try_get("user_id")?;
    let drawing_id: String = row.try_get("drawing_id")?;
    let ids_json: Option<String> = row.try_get("associated_report_ids")?;
    let associated_report_ids = parse_report_ids(ids_json.as_deref());
    let entered_at = required_timestamp(&drawing_id, row.try_get("entered_at")?)?;

    Ok(RewardsEntry {
        user_id: UserId(user_id),
        drawing_id,
        associated_report_ids,
        entered_at,
    })
}

/// NULL or unreadable JSON reads as an empty list
pub(crate) fn parse_report_ids(json: Option<&str>) -> Vec<ReportId> {
    json.and_then(|j| serde_json::from_str(j).ok()).unwrap_or_default()
}

fn owner_from_columns(
    id: &str,
    user_id: Option<String>,
    anonymous_user_id: Option<String>,
) -> Result<Owner> {
    let user_id = user_id.filter(|v| !v.is_empty());
    let anonymous_user_id = anonymous_user_id.filter(|v| !v.is_empty());
    match (user_id, anonymous_user_id) {
        (Some(user), None) => Ok(Owner::User(UserId(user))),
        (None, Some(anon)) => Ok(Owner::Anonymous(AnonymousId(anon))),
        (Some(_), Some(_)) => Err(SyncError::InvalidRow(format!(
            "report {} has both user_id and anonymous_user_id",
            id
        ))),
        (None, None) => Err(SyncError::InvalidRow(format!("report {} has no owner", id))),
    }
}

fn flag(row: &SqliteRow, column: &str) -> Result<bool> {
    Ok(row.try_get::<Option<i64>, _>(column)?.unwrap_or(0) != 0)
}

fn count(row: &SqliteRow, column: &str) -> Result<u32> {
    let value = row.try_get::<Option<i64>, _>(column)?.unwrap_or(0);
    Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
}

fn required_date(id: &str, value: String) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map_err(|e| SyncError::InvalidRow(format!("{}: date '{}': {}", id, value, e)))
}

fn optional_date(id: &str, value: Option<String>) -> Result<Option<NaiveDate>> {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => required_date(id, v).map(Some),
        None => Ok(None),
    }
}

/// RFC 3339, or SQLite's `datetime('now')` format (UTC)
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

fn required_timestamp(id: &str, value: String) -> Result<DateTime<Utc>> {
    parse_timestamp(&value)
        .ok_or_else(|| SyncError::InvalidRow(format!("{}: timestamp '{}'", id, value)))
}

fn optional_timestamp(id: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => required_timestamp(id, v).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_requires_exactly_one_column() {
        assert_eq!(
            owner_from_columns("r", Some("u1".into()), None).unwrap(),
            Owner::User(UserId("u1".into()))
        );
        assert_eq!(
            owner_from_columns("r", Some(String::new()), Some("a1".into())).unwrap(),
            Owner::Anonymous(AnonymousId("a1".into()))
        );
        assert!(owner_from_columns("r", Some("u1".into()), Some("a1".into())).is_err());
        assert!(owner_from_columns("r", None, None).is_err());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2026-10-19T12:00:00+00:00").is_some());
        assert!(parse_timestamp("2026-10-19 12:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_report_ids_default_to_empty() {
        assert!(parse_report_ids(None).is_empty());
        assert!(parse_report_ids(Some("not json")).is_empty());
        let id = ReportId::new();
        let json = serde_json::to_string(&vec![id]).unwrap();
        assert_eq!(parse_report_ids(Some(&json)), vec![id]);
    }
}
