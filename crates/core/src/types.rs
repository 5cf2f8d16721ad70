// crates/core/src/types.rs

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keyword arguments passed to a capability's entry point.
pub type Arguments = Map<String, Value>;

/// Where a capability came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Hand-authored and loaded at startup.
    Builtin,
    /// Produced by the synthesis oracle and admitted by the gate.
    #[default]
    Generated,
}

/// One declared test case of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: Arguments,
    #[serde(default = "default_expect_success")]
    pub expect_success: bool,
    #[serde(default = "default_label")]
    pub label: String,
}

fn default_expect_success() -> bool {
    true
}

fn default_label() -> String {
    "unnamed".to_string()
}

impl TestCase {
    pub fn new(label: impl Into<String>, input: Arguments, expect_success: bool) -> Self {
        Self {
            input,
            expect_success,
            label: label.into(),
        }
    }
}

/// A capability as proposed by the synthesis oracle, before the gate has seen it.
///
/// Accepts the oracle's older field names (`func_name`, `code`) as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    #[serde(alias = "func_name")]
    pub entry_point: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(alias = "code")]
    pub source: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// A committed, versioned capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub entry_point: String,
    pub source: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub provenance: Provenance,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Capability {
    /// Build a first-version capability from a candidate.
    pub fn from_candidate(candidate: &Candidate, provenance: Provenance) -> Self {
        let now = Utc::now();
        Self {
            name: candidate.name.clone(),
            entry_point: candidate.entry_point.clone(),
            source: candidate.source.clone(),
            description: candidate.description.clone(),
            parameters: candidate.parameters.clone(),
            test_cases: candidate.test_cases.clone(),
            provenance,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this record carries the same executable content as `candidate`.
    pub fn same_content(&self, candidate: &Candidate) -> bool {
        self.entry_point == candidate.entry_point
            && self.source == candidate.source
            && self.description == candidate.description
            && self.parameters == candidate.parameters
            && self.test_cases == candidate.test_cases
    }

    pub fn to_candidate(&self) -> Candidate {
        Candidate {
            name: self.name.clone(),
            entry_point: self.entry_point.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            source: self.source.clone(),
            test_cases: self.test_cases.clone(),
        }
    }
}

/// Why a run or an evaluation did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Source failed the static pre-check and was never executed.
    SyntaxInvalid,
    /// The child ran and raised or reported failure.
    RuntimeFailure,
    /// The deadline expired and the child was killed.
    Timeout,
    /// The child could not be spawned or its result could not be read.
    EngineFault,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::SyntaxInvalid => "syntax_invalid",
            FailureKind::RuntimeFailure => "runtime_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::EngineFault => "engine_fault",
        };
        f.write_str(s)
    }
}

/// Uniform outcome of one sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub ok: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Wall-clock time of the child process.
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ExecutionResult {
    pub fn success(output: Option<Value>, elapsed: Duration) -> Self {
        Self {
            ok: true,
            output,
            error: None,
            elapsed,
            failure: None,
        }
    }

    pub fn failure(kind: FailureKind, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error.into()),
            elapsed,
            failure: Some(kind),
        }
    }

    /// Did the capability succeed, as far as the caller is concerned?
    ///
    /// A process-level failure always wins. Otherwise an object output carrying a
    /// boolean `success` (or, failing that, `ok`) field is the capability's own
    /// verdict; any other output counts as success.
    pub fn reported_success(&self) -> bool {
        if !self.ok {
            return false;
        }
        match &self.output {
            Some(Value::Object(map)) => match (map.get("success"), map.get("ok")) {
                (Some(Value::Bool(flag)), _) => *flag,
                (_, Some(Value::Bool(flag))) => *flag,
                _ => true,
            },
            _ => true,
        }
    }
}

/// One row of gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub label: String,
    pub expected_success: bool,
    pub actual_success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub passed: bool,
}

/// Aggregate result of running a candidate's test suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub pass_rate: f64,
    pub passed: bool,
    pub passed_count: usize,
    pub total_count: usize,
    pub threshold: f64,
    pub results: Vec<TestOutcome>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl GateVerdict {
    /// Verdict for a candidate that never reached execution.
    pub fn rejected(kind: FailureKind, error: impl Into<String>, threshold: f64) -> Self {
        Self {
            pass_rate: 0.0,
            passed: false,
            passed_count: 0,
            total_count: 0,
            threshold,
            results: Vec::new(),
            error: Some(error.into()),
            failure: Some(kind),
        }
    }

    /// Vacuous pass for a syntactically valid candidate without test cases.
    pub fn vacuous(threshold: f64) -> Self {
        Self {
            pass_rate: 1.0,
            passed: true,
            passed_count: 0,
            total_count: 0,
            threshold,
            results: Vec::new(),
            error: None,
            failure: None,
        }
    }

    pub fn from_outcomes(results: Vec<TestOutcome>, threshold: f64) -> Self {
        let total_count = results.len();
        if total_count == 0 {
            return Self::vacuous(threshold);
        }
        let passed_count = results.iter().filter(|r| r.passed).count();
        let pass_rate = passed_count as f64 / total_count as f64;
        let passed = pass_rate >= threshold;
        Self {
            pass_rate,
            passed,
            passed_count,
            total_count,
            threshold,
            results,
            error: if passed {
                None
            } else {
                Some("did not meet pass threshold".to_string())
            },
            failure: if passed {
                None
            } else {
                Some(FailureKind::RuntimeFailure)
            },
        }
    }

    /// Human-readable account of what failed, for feeding back to the oracle.
    pub fn feedback(&self) -> String {
        let mut lines = vec![format!(
            "pass rate {:.0}% ({}/{}), need {:.0}%",
            self.pass_rate * 100.0,
            self.passed_count,
            self.total_count,
            self.threshold * 100.0
        )];
        if let Some(err) = &self.error {
            lines.push(format!("error: {}", err));
        }
        for r in self.results.iter().filter(|r| !r.passed) {
            let detail = r
                .error
                .clone()
                .or_else(|| r.output.as_ref().map(|v| v.to_string()))
                .unwrap_or_else(|| "no output".to_string());
            lines.push(format!(
                "- case '{}': expected success={}, got success={} ({})",
                r.label, r.expected_success, r.actual_success, detail
            ));
        }
        lines.join("\n")
    }
}

/// A record of a past task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub task: String,
    pub success: bool,
    #[serde(default)]
    pub learned: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub timestamp: DateTime<Utc>,
}
