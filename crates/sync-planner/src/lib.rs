//! Outbound planner REST client (§4.4, §6): the production
//! `PlannerApi` implementation, rate-governed and token-cached. Every
//! mutating call feeds its outcome back into the shared `RateGovernor`
//! so the Sync Engine's batch drain and `/health` status stay in step
//! with what the planner is actually telling us.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use tracing::warn;

use sync_core::planner_api::{IfMatch, PlannerApi, Versioned};
use sync_core::token_cache::{TokenCache, TokenKind};
use sync_core::{PlannerError, RateGovernor, TokenError};
use sync_wire::{
    BucketSummary, PlanSummary, PlannerCreateBody, PlannerDetailsBody, PlannerTask,
    PlannerTaskDetails,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Scopes this client ever needs — a subset of the delegated superset the
/// Token Cache mints once and reuses (§4.1).
const TASK_SCOPES: &[&str] = &["Tasks.ReadWrite", "Group.ReadWrite.All"];

fn token_err_to_planner(err: TokenError) -> PlannerError {
    match err {
        TokenError::ConsentRequired => PlannerError::ConsentRequired,
        TokenError::BadCredentials => PlannerError::BadCredentials,
        TokenError::Throttled => PlannerError::Throttled { retry_after_secs: None },
        TokenError::Transient(msg) => PlannerError::Transient(msg),
    }
}

/// Production `PlannerApi`: REST against a versioned base URL using
/// bearer tokens from the shared `TokenCache`, with `$select` on reads
/// and `If-Match` on writes (§6).
pub struct PlannerClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCache>,
    governor: Arc<RateGovernor>,
}

impl PlannerClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenCache>, governor: Arc<RateGovernor>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("planner http client"),
            base_url: base_url.into(),
            tokens,
            governor,
        }
    }

    async fn bearer(&self) -> Result<String, PlannerError> {
        self.tokens
            .acquire(TokenKind::Delegated, TASK_SCOPES)
            .await
            .map(|t| t.access_token)
            .map_err(token_err_to_planner)
    }

    /// Issues one request and classifies the response, feeding the
    /// outcome back into the rate governor (§4.2). Retry/backoff
    /// decisions above this belong to the caller — this function
    /// performs exactly one HTTP round trip.
    async fn send(
        &self,
        method: Method,
        path: &str,
        if_match: Option<&IfMatch>,
        body: Option<&Value>,
    ) -> Result<Response, PlannerError> {
        let token = self.bearer().await?;
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).bearer_auth(token);

        if let Some(if_match) = if_match {
            request = match if_match {
                IfMatch::Etag(etag) => request.header("If-Match", etag),
                IfMatch::Any => request.header("If-Match", "*"),
            };
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| {
            self.governor.report_result(false, None);
            PlannerError::Transient(err.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            self.governor.report_result(false, None);
            return Ok(response);
        }

        let retry_after = retry_after_duration(&response);
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                self.governor.report_result(true, retry_after);
                Err(PlannerError::Throttled {
                    retry_after_secs: retry_after.map(|d| d.as_secs()),
                })
            }
            StatusCode::PRECONDITION_FAILED => {
                self.governor.report_result(false, None);
                Err(PlannerError::PreconditionFailed)
            }
            StatusCode::NOT_FOUND => {
                self.governor.report_result(false, None);
                Err(PlannerError::NotFound)
            }
            StatusCode::FORBIDDEN => {
                self.governor.report_result(false, None);
                let body = response.text().await.unwrap_or_default();
                Err(PlannerError::from_forbidden_body(&body))
            }
            StatusCode::BAD_REQUEST => {
                self.governor.report_result(false, None);
                let body = response.text().await.unwrap_or_default();
                Err(PlannerError::BadRequest(body))
            }
            status if status.is_server_error() => {
                self.governor.report_result(false, None);
                Err(PlannerError::Transient(format!("planner returned {status}")))
            }
            status => {
                self.governor.report_result(false, None);
                let body = response.text().await.unwrap_or_default();
                Err(PlannerError::Transient(format!("unexpected status {status}: {body}")))
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, PlannerError> {
        let response = self.send(Method::GET, path, None, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PlannerError::Transient(format!("malformed planner response: {e}")))
    }
}

fn retry_after_duration(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn etag_of(value: &Value) -> String {
    value
        .get("@odata.etag")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl PlannerApi for PlannerClient {
    async fn list_accessible_plans(&self) -> Result<Vec<PlanSummary>, PlannerError> {
        #[derive(serde::Deserialize)]
        struct Page {
            value: Vec<PlanSummary>,
        }
        let page: Page = self
            .get_json("/me/planner/plans?$select=id,title")
            .await?;
        Ok(page.value)
    }

    async fn list_plan_buckets(&self, plan_id: &str) -> Result<Vec<BucketSummary>, PlannerError> {
        #[derive(serde::Deserialize)]
        struct Page {
            value: Vec<BucketSummary>,
        }
        let page: Page = self
            .get_json(&format!("/planner/plans/{plan_id}/buckets?$select=id,name,planId"))
            .await?;
        Ok(page.value)
    }

    async fn list_plan_tasks(&self, plan_id: &str) -> Result<Vec<PlannerTask>, PlannerError> {
        #[derive(serde::Deserialize)]
        struct Page {
            value: Vec<PlannerTask>,
        }
        let page: Page = self
            .get_json(&format!(
                "/planner/plans/{plan_id}/tasks?$select=id,planId,bucketId,title,percentComplete,priority,assignments,dueDateTime,createdDateTime,completedDateTime,lastModifiedDateTime,conversationThreadId"
            ))
            .await?;
        Ok(page.value)
    }

    async fn get_task(&self, external_id: &str) -> Result<Versioned<PlannerTask>, PlannerError> {
        let response = self
            .send(Method::GET, &format!("/planner/tasks/{external_id}"), None, None)
            .await?;
        let raw: Value = response
            .json()
            .await
            .map_err(|e| PlannerError::Transient(format!("malformed task response: {e}")))?;
        let etag = etag_of(&raw);
        let task: PlannerTask = serde_json::from_value(raw)
            .map_err(|e| PlannerError::Transient(format!("malformed task body: {e}")))?;
        Ok(Versioned { value: task, etag })
    }

    async fn get_task_details(
        &self,
        external_id: &str,
    ) -> Result<Versioned<PlannerTaskDetails>, PlannerError> {
        let response = self
            .send(Method::GET, &format!("/planner/tasks/{external_id}/details"), None, None)
            .await?;
        let raw: Value = response
            .json()
            .await
            .map_err(|e| PlannerError::Transient(format!("malformed details response: {e}")))?;
        let etag = etag_of(&raw);
        let details: PlannerTaskDetails = serde_json::from_value(raw)
            .map_err(|e| PlannerError::Transient(format!("malformed details body: {e}")))?;
        Ok(Versioned { value: details, etag })
    }

    async fn create_task(
        &self,
        body: &PlannerCreateBody,
    ) -> Result<Versioned<PlannerTask>, PlannerError> {
        let payload = serde_json::to_value(body)
            .map_err(|e| PlannerError::BadRequest(format!("cannot serialize create body: {e}")))?;
        let response = self.send(Method::POST, "/planner/tasks", None, Some(&payload)).await?;
        let raw: Value = response
            .json()
            .await
            .map_err(|e| PlannerError::Transient(format!("malformed create response: {e}")))?;
        let etag = etag_of(&raw);
        let task: PlannerTask = serde_json::from_value(raw)
            .map_err(|e| PlannerError::Transient(format!("malformed created task: {e}")))?;
        Ok(Versioned { value: task, etag })
    }

    async fn update_task(
        &self,
        external_id: &str,
        patch: &Value,
        if_match: &IfMatch,
    ) -> Result<String, PlannerError> {
        let response = self
            .send(
                Method::PATCH,
                &format!("/planner/tasks/{external_id}"),
                Some(if_match),
                Some(patch),
            )
            .await?;
        Ok(response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string())
    }

    async fn update_task_details(
        &self,
        external_id: &str,
        body: &PlannerDetailsBody,
        if_match: &IfMatch,
    ) -> Result<String, PlannerError> {
        let payload = serde_json::to_value(body)
            .map_err(|e| PlannerError::BadRequest(format!("cannot serialize details body: {e}")))?;
        let response = self
            .send(
                Method::PATCH,
                &format!("/planner/tasks/{external_id}/details"),
                Some(if_match),
                Some(&payload),
            )
            .await?;
        Ok(response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string())
    }

    async fn delete_task(&self, external_id: &str, if_match: &IfMatch) -> Result<(), PlannerError> {
        match self
            .send(Method::DELETE, &format!("/planner/tasks/{external_id}"), Some(if_match), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(PlannerError::NotFound) => {
                warn!(external_id, "delete target already gone upstream");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_error_maps_to_matching_planner_error() {
        assert!(matches!(
            token_err_to_planner(TokenError::ConsentRequired),
            PlannerError::ConsentRequired
        ));
        assert!(matches!(
            token_err_to_planner(TokenError::BadCredentials),
            PlannerError::BadCredentials
        ));
    }

    #[test]
    fn etag_extraction_reads_odata_etag_field() {
        let value = serde_json::json!({ "@odata.etag": "W/\"abc\"", "id": "T1" });
        assert_eq!(etag_of(&value), "W/\"abc\"");
    }

    #[test]
    fn etag_extraction_defaults_to_empty_when_absent() {
        let value = serde_json::json!({ "id": "T1" });
        assert_eq!(etag_of(&value), "");
    }
}
