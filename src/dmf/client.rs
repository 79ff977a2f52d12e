// DMF API Client
// Forwards harvest reports to the regulator and triggers confirmation delivery.
//
// The regulator's payload format is owned by the regulator; this client only
// maps our report onto a JSON body and the response onto `DmfReceipt` or a
// `SubmitError`. A timeout is reported as `SubmitError::Timeout`, never as
// success: the caller retries within its cap.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{DmfReceipt, RegulatorEndpoint, SubmitError, WebhookRequest};
use crate::config::EngineConfig;
use crate::model::{HarvestPayload, StoredReport};

const USER_AGENT: &str = concat!("HarvestSync/", env!("CARGO_PKG_VERSION"));

/// Body posted to the report endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionBody<'a> {
    client_report_id: String,
    local_confirmation_number: &'a str,
    #[serde(flatten)]
    payload: &'a HarvestPayload,
}

/// Success response from the report endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionResponse {
    confirmation_number: Option<String>,
    object_id: Option<String>,
    error: Option<String>,
}

/// DMF API client
pub struct DmfClient {
    http: Client,
    submit_url: String,
    webhook_url: String,
}

impl DmfClient {
    pub fn new(config: &EngineConfig) -> Result<Self, SubmitError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SubmitError::Network(e.to_string()))?;

        Ok(Self {
            http,
            submit_url: config.dmf_submit_url.clone(),
            webhook_url: config.dmf_webhook_url.clone(),
        })
    }

    async fn read_error(response: Response) -> SubmitError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }
}

#[async_trait]
impl RegulatorEndpoint for DmfClient {
    async fn submit_report(&self, report: &StoredReport) -> Result<DmfReceipt, SubmitError> {
        let body = SubmissionBody {
            client_report_id: report.id.to_string(),
            local_confirmation_number: &report.local_confirmation_number,
            payload: &report.payload,
        };

        log::info!("Submitting report {} to DMF", report.id);

        let response = self
            .http
            .post(&self.submit_url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        log::info!("DMF response status: {}", status);

        if !status.is_success() {
            return Err(Self::read_error(response).await);
        }

        let text = response.text().await.map_err(map_transport_error)?;
        parse_receipt(&text)
    }

    async fn trigger_webhook(&self, request: &WebhookRequest) -> Result<(), SubmitError> {
        log::info!(
            "Triggering {:?} confirmation for report {} ({})",
            request.delivery,
            request.report_id,
            request.confirmation_number
        );

        let response = self
            .http
            .post(&self.webhook_url)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }
}

fn map_transport_error(e: reqwest::Error) -> SubmitError {
    if e.is_timeout() {
        SubmitError::Timeout(e.to_string())
    } else {
        SubmitError::Network(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> SubmitError {
    let message = truncate_string(body.trim(), 500);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SubmitError::Auth(message),
        _ => SubmitError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

/// Map a 2xx body onto a receipt. A 2xx without both identifiers is not a
/// success: the report cannot move to `submitted` without them.
fn parse_receipt(body: &str) -> Result<DmfReceipt, SubmitError> {
    let parsed: SubmissionResponse = serde_json::from_str(body)
        .map_err(|e| SubmitError::Parse(format!("{}: {}", e, truncate_string(body, 200))))?;

    if let Some(error) = parsed.error.filter(|e| !e.is_empty()) {
        return Err(SubmitError::Rejected {
            status: 200,
            message: error,
        });
    }

    match (parsed.confirmation_number, parsed.object_id) {
        (Some(confirmation_number), Some(object_id))
            if !confirmation_number.is_empty() && !object_id.is_empty() =>
        {
            Ok(DmfReceipt {
                confirmation_number,
                object_id,
            })
        }
        _ => Err(SubmitError::Parse(
            "response missing confirmationNumber or objectId".to_string(),
        )),
    }
}

/// Truncate a string for error messages
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_receipt() {
        let receipt = parse_receipt(r#"{"confirmationNumber":"DMF-88213","objectId":"4471"}"#).unwrap();
        assert_eq!(receipt.confirmation_number, "DMF-88213");
        assert_eq!(receipt.object_id, "4471");
    }

    #[test]
    fn test_parse_receipt_missing_ids() {
        assert!(matches!(
            parse_receipt(r#"{"confirmationNumber":"DMF-1"}"#),
            Err(SubmitError::Parse(_))
        ));
        assert!(matches!(parse_receipt("<html>"), Err(SubmitError::Parse(_))));
    }

    #[test]
    fn test_parse_receipt_embedded_error() {
        let err = parse_receipt(r#"{"error":"invalid area of harvest"}"#).unwrap_err();
        assert_eq!(
            err,
            SubmitError::Rejected {
                status: 200,
                message: "invalid area of harvest".to_string()
            }
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "token expired"),
            SubmitError::Auth(_)
        ));
        let err = classify_status(StatusCode::BAD_GATEWAY, "upstream");
        assert!(err.is_transient());
    }

    #[test]
    fn test_submission_body_flattens_payload() {
        let payload = HarvestPayload {
            first_name: "Ada".to_string(),
            area_of_harvest: "Pamlico Sound".to_string(),
            ..Default::default()
        };
        let body = SubmissionBody {
            client_report_id: "abc".to_string(),
            local_confirmation_number: "HRV-20261019-ABCDEF-0001",
            payload: &payload,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["clientReportId"], "abc");
        assert_eq!(json["firstName"], "Ada");
        assert_eq!(json["areaOfHarvest"], "Pamlico Sound");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("abcdefghij", 4), "abcd...");
    }
}
