//! Outbound HTTP client to the external application ("External HTTP to
//! external app"). Generalizes `lib_common::retrieve::ky_http::ApiClient`
//! into a typed surface for the five calls the hub makes: fetching lobby
//! lists and match configs, persisting debounced snapshots, and notifying
//! join/leave.
//!
//! Every call here is a plain `async fn`; none of them are ever invoked
//! while a room's mutex is held.

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::validator::MatchConfig;
use crate::wire::messages::{LobbySummary, Timeline, TrackSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum ExternalApiError {
    #[error("request to external app failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("external app returned status {0}")]
    Status(u16),
    #[error("failed to decode external app response: {0}")]
    Decode(#[from] reqwest::Error),
}

/// Shape of `GET /api/matches/{id}`: the match's fixed timeline skeleton
/// (duration + predefined tracks) alongside its constraint config.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchConfigResponse {
    pub duration: f64,
    pub tracks: Vec<TrackSnapshot>,
    #[serde(flatten)]
    pub config: MatchConfig,
}

#[derive(Debug, Serialize)]
struct PatchMatchBody<'a> {
    timeline: &'a Timeline,
    #[serde(rename = "editCount")]
    edit_count: u64,
}

#[derive(Debug, Serialize)]
struct UserIdBody<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct LobbiesResponse {
    lobbies: Vec<LobbySummary>,
}

/// Thin wrapper over a `reqwest_middleware` client with retry, mirroring
/// `lib_common::retrieve::ky_http::ApiClient` but with one typed method per
/// endpoint rather than a generic `request`.
pub struct ExternalApiClient {
    inner: ClientWithMiddleware,
    base_url: String,
    auth_token: Option<String>,
}

impl ExternalApiClient {
    pub fn new(base_url: String, auth_token: Option<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let inner = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        ExternalApiClient {
            inner,
            base_url,
            auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: reqwest_middleware::RequestBuilder) -> reqwest_middleware::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn get_lobbies(&self, status: Option<&str>) -> Result<Vec<LobbySummary>, ExternalApiError> {
        let mut url = self.url("/api/lobbies");
        if let Some(status) = status {
            url = format!("{url}?status={status}");
        }
        let resp = self.inner.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ExternalApiError::Status(resp.status().as_u16()));
        }
        let body: LobbiesResponse = resp.json().await?;
        Ok(body.lobbies)
    }

    pub async fn get_match_config(&self, match_id: &str) -> Result<MatchConfigResponse, ExternalApiError> {
        let resp = self
            .inner
            .get(self.url(&format!("/api/matches/{match_id}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ExternalApiError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    /// Persists a debounced timeline snapshot. Failures are
    /// logged by the caller and retried on the next debounce tick — this
    /// method itself just reports the outcome.
    pub async fn patch_match(
        &self,
        match_id: &str,
        timeline: &Timeline,
        edit_count: u64,
    ) -> Result<(), ExternalApiError> {
        let req = self
            .inner
            .patch(self.url(&format!("/api/matches/{match_id}")))
            .json(&PatchMatchBody { timeline, edit_count });
        let resp = self.authed(req).send().await?;
        if !resp.status().is_success() {
            return Err(ExternalApiError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    pub async fn notify_leave(&self, match_id: &str, user_id: &str) -> Result<(), ExternalApiError> {
        let req = self
            .inner
            .post(self.url(&format!("/api/matches/{match_id}/leave")))
            .json(&UserIdBody { user_id });
        let resp = self.authed(req).send().await?;
        if !resp.status().is_success() {
            return Err(ExternalApiError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    pub async fn notify_join(&self, match_id: &str, user_id: &str) -> Result<(), ExternalApiError> {
        let req = self
            .inner
            .post(self.url(&format!("/api/matches/{match_id}/join")))
            .json(&UserIdBody { user_id });
        let resp = self.authed(req).send().await?;
        if !resp.status().is_success() {
            return Err(ExternalApiError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Logs and swallows an `ExternalApiError`; used at call sites where
/// says upstream failures are "logged; cached state remains" rather than
/// surfaced to the client.
pub fn log_external_error(context: &str, err: ExternalApiError) {
    warn!(context, error = %err, "external app request failed");
}
