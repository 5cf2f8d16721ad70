// crates/core/src/synthesis.rs

//! Interface to the external synthesis oracle that writes candidate capabilities.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::ai_client::AiClient;
use crate::types::{Candidate, GateVerdict};

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[a-zA-Z]*\n?").expect("valid fence regex"));

const INSTRUCTIONS: &str = r#"You write Python capabilities for an autonomous agent.

Every capability is one function that:
- accepts keyword arguments only
- returns a dict {"success": bool, "output": <result>} and never raises
- does its imports inside the function body
- is real, working code, not a stub

Reply with a single JSON object and nothing else."#;

/// What to ask the oracle for.
#[derive(Debug, Clone, Default)]
pub struct SynthesisRequest {
    pub description: String,
    /// When and why the capability is needed.
    pub context: String,
    /// Previous attempt and why the gate rejected it, on a retry.
    pub previous: Option<(Candidate, GateVerdict)>,
}

impl SynthesisRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Retry request carrying the rejected candidate and its verdict.
    pub fn retry(&self, rejected: Candidate, verdict: GateVerdict) -> Self {
        Self {
            description: self.description.clone(),
            context: self.context.clone(),
            previous: Some((rejected, verdict)),
        }
    }
}

/// Produces candidate capabilities from natural-language descriptions.
pub trait CapabilitySynthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Candidate>;
}

/// Synthesizer backed by a text-generation client.
pub struct OracleSynthesizer<C> {
    client: C,
}

impl<C: AiClient> OracleSynthesizer<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C: AiClient> CapabilitySynthesizer for OracleSynthesizer<C> {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Candidate> {
        let prompt = build_prompt(request);
        let reply = self
            .client
            .complete(INSTRUCTIONS, &prompt)
            .context("synthesis oracle request failed")?;
        parse_candidate(&reply)
    }
}

fn build_prompt(request: &SynthesisRequest) -> String {
    let mut prompt = format!(
        r#"Write a Python capability for this need:

DESCRIPTION: {}
CONTEXT: {}

Return JSON only:
{{
  "name": "kebab-case-name",
  "entry_point": "snake_case_name",
  "description": "one sentence: what it does and returns",
  "parameters": {{"param_name": "what it is"}},
  "source": "def snake_case_name(**kwargs):\n    ...",
  "test_cases": [
    {{"input": {{}}, "expect_success": true, "label": "basic usage"}},
    {{"input": {{"bad": "input"}}, "expect_success": false, "label": "error handling"}}
  ]
}}"#,
        request.description,
        if request.context.is_empty() {
            "general use"
        } else {
            request.context.as_str()
        }
    );

    if let Some((rejected, verdict)) = &request.previous {
        prompt.push_str(&format!(
            "\n\nYour previous attempt '{}' was rejected by its own tests:\n{}\n\nPrevious source:\n{}\n\nFix the problems and return the complete corrected JSON.",
            rejected.name,
            verdict.feedback(),
            rejected.source
        ));
    }
    prompt
}

/// Extract a candidate from an oracle reply, tolerating code fences and
/// surrounding prose.
pub fn parse_candidate(text: &str) -> Result<Candidate> {
    let cleaned = CODE_FENCE.replace_all(text, "");
    let cleaned = cleaned.trim().trim_end_matches('`').trim();

    let value: Value = match serde_json::from_str(cleaned) {
        Ok(value) => value,
        Err(_) => {
            let start = cleaned.find('{').context("oracle reply contains no JSON object")?;
            let end = cleaned.rfind('}').context("oracle reply contains no JSON object")?;
            if end < start {
                anyhow::bail!("oracle reply contains no JSON object");
            }
            serde_json::from_str(&cleaned[start..=end])
                .context("failed to parse JSON object in oracle reply")?
        }
    };

    serde_json::from_value(value).context("oracle reply is not a candidate capability")
}
