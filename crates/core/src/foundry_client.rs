// crates/core/src/foundry_client.rs

//! Azure AI Foundry client for the Responses API.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ai_client::AiClient;

const MAX_ATTEMPTS: u32 = 3;

/// Azure AI Foundry client using the Responses API.
///
/// Environment variables:
/// - FOUNDRY_ENDPOINT: e.g. "https://myresource.openai.azure.com"
/// - FOUNDRY_DEPLOYMENT: e.g. "gpt-4o"
/// - FOUNDRY_API_KEY: your API key
/// - FOUNDRY_MAX_TOKENS (optional): default 4096
pub struct FoundryClient {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl FoundryClient {
    pub fn new(endpoint: &str, deployment: &str, api_key: &str) -> Self {
        let url = format!(
            "{}/openai/responses?api-version=2025-03-01-preview",
            endpoint.trim_end_matches('/')
        );

        Self {
            client: Client::new(),
            url,
            api_key: api_key.to_string(),
            model: deployment.to_string(),
            max_output_tokens: 4096,
        }
    }

    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("FOUNDRY_ENDPOINT").context("FOUNDRY_ENDPOINT not set")?;
        let deployment =
            std::env::var("FOUNDRY_DEPLOYMENT").context("FOUNDRY_DEPLOYMENT not set")?;
        let api_key = std::env::var("FOUNDRY_API_KEY").context("FOUNDRY_API_KEY not set")?;

        let mut client = Self::new(&endpoint, &deployment, &api_key);
        if let Ok(raw) = std::env::var("FOUNDRY_MAX_TOKENS") {
            client.max_output_tokens = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid FOUNDRY_MAX_TOKENS: {:?}", raw))?;
        }
        debug!(deployment = %deployment, "using Foundry Responses API");
        Ok(client)
    }
}

/// Request body for Responses API.
#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
    instructions: &'a str,
    store: bool,
    max_output_tokens: u32,
}

/// Response from Responses API.
#[derive(Deserialize, Debug)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<ResponsesOutputItem>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ResponsesOutputItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<ResponsesContent>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ResponsesContent {
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(other)]
    Other,
}

fn collect_text(parsed: ResponsesResponse) -> String {
    parsed
        .output
        .into_iter()
        .filter_map(|item| match item {
            ResponsesOutputItem::Message { content } => Some(content),
            ResponsesOutputItem::Unknown => None,
        })
        .flatten()
        .filter_map(|c| match c {
            ResponsesContent::OutputText { text } => Some(text),
            ResponsesContent::Other => None,
        })
        .collect()
}

impl AiClient for FoundryClient {
    fn complete(&self, instructions: &str, prompt: &str) -> Result<String> {
        let request = ResponsesRequest {
            model: &self.model,
            input: prompt,
            instructions,
            store: false,
            max_output_tokens: self.max_output_tokens,
        };

        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .client
                .post(&self.url)
                .header("api-key", &self.api_key)
                .json(&request)
                .send();

            let r = match resp {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, error = %e, "Foundry network error, retrying");
                    last_error = Some(anyhow::anyhow!("network error: {}", e));
                    std::thread::sleep(Duration::from_secs(attempt as u64));
                    continue;
                }
            };

            let status = r.status();
            if !status.is_success() {
                let body = r.text().unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    // Backoff: 5s, 20s, 45s for rate limits.
                    let delay = if status.as_u16() == 429 {
                        5 * attempt as u64 * attempt as u64
                    } else {
                        attempt as u64 * 2
                    };
                    warn!(attempt, %status, delay_secs = delay, "Foundry request throttled");
                    last_error = Some(anyhow::anyhow!("HTTP {} - {}", status, body));
                    std::thread::sleep(Duration::from_secs(delay));
                    continue;
                }
                anyhow::bail!("Foundry request failed: HTTP {} - {}", status, body);
            }

            let parsed: ResponsesResponse = r.json().context("failed to parse Foundry response")?;
            return Ok(collect_text(parsed));
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("request failed after retries")))
    }
}
