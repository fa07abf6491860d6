//! Fetches the human-readable task description shown on a session's page.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::config::session_url;

#[async_trait]
pub trait InstructionFetcher: Send + Sync {
    /// `None` on any failure; never an error.
    async fn fetch(&self, session_id: &str) -> Option<String>;
}

/// Reads `<base_url>/<session_id>` and extracts the instruction heading.
pub struct HttpInstructionFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInstructionFetcher {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url,
        })
    }
}

#[async_trait]
impl InstructionFetcher for HttpInstructionFetcher {
    async fn fetch(&self, session_id: &str) -> Option<String> {
        let url = session_url(&self.base_url, session_id);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(session_id, %url, error = %e, "instruction page unreachable");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(session_id, status = %response.status(), "instruction page returned an error");
            return None;
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(session_id, error = %e, "failed to read instruction page");
                return None;
            }
        };
        let instruction = extract_instruction(&body);
        if instruction.is_none() {
            debug!(session_id, "instruction page has no instruction text");
        }
        instruction
    }
}

/// Pull the text of `div#instruction-text h4`, minus its `Instruction: ` label.
pub fn extract_instruction(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("div#instruction-text h4").ok()?;
    let heading = document.select(&selector).next()?;
    let text = heading.text().collect::<String>();
    let text = text.trim().replace("Instruction: ", "");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Fetcher that never finds an instruction.
#[derive(Debug, Default)]
pub struct NoInstructionFetcher;

#[async_trait]
impl InstructionFetcher for NoInstructionFetcher {
    async fn fetch(&self, _session_id: &str) -> Option<String> {
        None
    }
}
