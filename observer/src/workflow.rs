//! Remote workflow system client.
//!
//! Every call is best-effort: transport failures, non-2xx responses and
//! malformed bodies are logged and collapse to `None` / `false` so one
//! unreachable endpoint degrades a single session instead of the batch.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Create a workflow for `goal`, returning its workflow id.
    async fn create(&self, goal: &str) -> Option<String>;

    /// Run a created workflow, returning the remote session id.
    async fn run(&self, workflow_id: &str) -> Option<String>;

    /// Ask the remote system to stop a running session.
    async fn stop(&self, remote_session_id: &str) -> bool;
}

/// HTTP client for the nfig autonomous-workflow API.
pub struct NfigWorkflowClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl NfigWorkflowClient {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, action: &str) -> String {
        format!(
            "{}/external-apis/request/workflow/autonomous/{action}",
            self.base_url
        )
    }

    async fn post(&self, action: &str, body: serde_json::Value) -> Option<serde_json::Value> {
        let response = match self
            .client
            .post(self.endpoint(action))
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(action, error = %e, "workflow request failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(action, %status, body = %text, "workflow request rejected");
            return None;
        }

        match response.json::<serde_json::Value>().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(action, error = %e, "workflow response was not JSON");
                None
            }
        }
    }
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    match value.get(key)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl WorkflowClient for NfigWorkflowClient {
    async fn create(&self, goal: &str) -> Option<String> {
        let body = self.post("create", json!({ "goal": goal })).await?;
        let workflow_id = string_field(&body, "workflowId");
        if workflow_id.is_none() {
            warn!("create response carried no workflowId");
        }
        workflow_id
    }

    async fn run(&self, workflow_id: &str) -> Option<String> {
        let body = self
            .post("run", json!({ "workflowId": workflow_id }))
            .await?;
        let session_id = string_field(&body, "sessionId");
        if session_id.is_none() {
            warn!(workflow_id, "run response carried no sessionId");
        }
        session_id
    }

    async fn stop(&self, remote_session_id: &str) -> bool {
        self.post("stop", json!({ "sessionId": remote_session_id }))
            .await
            .is_some()
    }
}

/// Stand-in used when no API credential is configured.
///
/// Sessions still run and are monitored through their event logs; only the
/// remote launch and stop calls are skipped.
#[derive(Debug, Default)]
pub struct DryRunWorkflowClient;

#[async_trait]
impl WorkflowClient for DryRunWorkflowClient {
    async fn create(&self, goal: &str) -> Option<String> {
        info!(goal, "dry run: skipping workflow create");
        None
    }

    async fn run(&self, workflow_id: &str) -> Option<String> {
        info!(workflow_id, "dry run: skipping workflow run");
        None
    }

    async fn stop(&self, remote_session_id: &str) -> bool {
        info!(remote_session_id, "dry run: skipping workflow stop");
        false
    }
}
