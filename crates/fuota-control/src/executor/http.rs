//! HTTP bridge to the network server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::config::CollaboratorConfig;
use crate::error::{FuotaError, FuotaResult};

use super::{ActionReport, StepAction, StepRequest};

/// Step action that posts each request to an HTTP bridge.
///
/// The bridge receives `POST {base_url}/fuota/steps/{state}` with the JSON
/// [`StepRequest`] and answers with an [`ActionReport`].
#[derive(Debug, Clone)]
pub struct HttpStepAction {
    client: Client,
    base_url: String,
}

impl HttpStepAction {
    /// Create a new action from configuration.
    pub fn new(config: &CollaboratorConfig) -> FuotaResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(FuotaError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    /// Create a new action with a custom base URL.
    pub fn with_url(url: impl Into<String>) -> FuotaResult<Self> {
        Self::new(&CollaboratorConfig {
            url: url.into(),
            ..CollaboratorConfig::default()
        })
    }

    fn step_url(&self, request: &StepRequest) -> String {
        format!("{}/fuota/steps/{}", self.base_url, request.state)
    }
}

#[async_trait]
impl StepAction for HttpStepAction {
    async fn execute(&self, request: &StepRequest) -> FuotaResult<ActionReport> {
        let response = self
            .client
            .post(self.step_url(request))
            .json(request)
            .send()
            .await
            .map_err(FuotaError::Http)?;

        match response.status() {
            status if status.is_success() => {
                let body = response.bytes().await.map_err(FuotaError::Http)?;
                serde_json::from_slice(&body).map_err(|e| {
                    FuotaError::collaborator(format!(
                        "invalid {} step report: {e}",
                        request.state
                    ))
                })
            }
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let reason = if body.trim().is_empty() {
                    format!("rejected with {status}")
                } else {
                    body
                };
                Ok(ActionReport::rejected(reason))
            }
            status => Err(FuotaError::collaborator(format!(
                "{} step failed: {status}",
                request.state
            ))),
        }
    }
}
