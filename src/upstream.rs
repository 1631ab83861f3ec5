//! Remote item source, answer sink and verification endpoint.
//!
//! The dispatcher never talks to the network itself. The [`Upstream`] trait
//! is the seam: [`HttpUpstream`] is the production implementation, tests
//! plug in an in-memory double.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::UpstreamConfig;
use crate::error::{DispatchError, Result};
use crate::scheduler::WorkItem;

/// Answers forwarded to the sink after every submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerUpload {
    pub session_id: String,
    pub item_id: String,
    pub url: String,
    pub answers: BTreeMap<u32, String>,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch the complete current item set.
    async fn fetch_items(&self) -> Result<Vec<WorkItem>>;

    /// Forward a partial or complete answer set.
    async fn upload_answers(&self, upload: &AnswerUpload) -> Result<()>;

    /// Ask whether a finished session was accepted.
    async fn verify(&self, session_id: &str) -> Result<bool>;
}

/// Parse the item source's response body.
///
/// Accepts a bare array or an object carrying the array under `items` or
/// `Captchas`. Entries without an id or url are skipped.
pub fn parse_items(body: &Value) -> Result<Vec<WorkItem>> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(fields) => fields
            .get("items")
            .or_else(|| fields.get("Captchas"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                DispatchError::SourceUnavailable("response carries no item list".to_string())
            })?,
        _ => {
            return Err(DispatchError::SourceUnavailable(
                "response is neither a list nor an object".to_string(),
            ))
        }
    };

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        match WorkItem::from_source(entry) {
            Some(item) => items.push(item),
            None => tracing::warn!(entry = %entry, "Skipping malformed captcha entry"),
        }
    }
    Ok(items)
}

/// JSON-over-HTTP upstream. Every channel is a POST to the same URL.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    async fn post(&self, body: &Value) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.client.post(&self.url).json(body).send().await
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch_items(&self) -> Result<Vec<WorkItem>> {
        let body: Value = self
            .post(&json!({ "channel": "items", "selector": "Captchas" }))
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_items(&body)
    }

    async fn upload_answers(&self, upload: &AnswerUpload) -> Result<()> {
        let response = self
            .post(&json!({ "channel": "answers", "payload": upload }))
            .await
            .map_err(|e| DispatchError::SinkFailure(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            session_id = %upload.session_id,
            status = %status,
            body = %body,
            "Answer sink responded"
        );

        if status.is_success() {
            Ok(())
        } else {
            Err(DispatchError::SinkFailure(format!("sink returned {status}")))
        }
    }

    async fn verify(&self, session_id: &str) -> Result<bool> {
        let body: Value = self
            .post(&json!({ "channel": "verify", "sessionId": session_id }))
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.get("verified").and_then(Value::as_bool).unwrap_or(false))
    }
}
