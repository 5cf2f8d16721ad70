// crates/core/src/config.rs

//! Pipeline configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Default per-call deadline for one sandboxed run.
pub const DEFAULT_DEADLINE_SECS: u64 = 30;
/// Default fraction of test cases a candidate must pass.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.75;
pub const DEFAULT_EXPERIENCE_CAPACITY: usize = 1000;
/// Minimum lexical overlap before a capability counts as a match.
pub const DEFAULT_MIN_MATCH_SCORE: usize = 2;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Everything one pipeline instance needs. Passed explicitly to each component.
///
/// Environment variables (all optional):
///
/// - CAPGATE_BASE_PATH         storage root, default "./memory"
/// - CAPGATE_DEADLINE_SECS     per-call deadline, default 30
/// - CAPGATE_PASS_THRESHOLD    gate threshold, default 0.75
/// - CAPGATE_MAX_EXPERIENCES   experience log capacity, default 1000
/// - CAPGATE_MIN_MATCH_SCORE   relevance floor, default 2
/// - CAPGATE_PYTHON            interpreter for capabilities, default "python3"
/// - CAPGATE_MAX_OUTPUT_BYTES  per-stream capture cap, default 1 MiB
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub base_path: PathBuf,
    pub deadline: Duration,
    pub pass_threshold: f64,
    pub experience_capacity: usize,
    pub min_match_score: usize,
    pub interpreter: String,
    pub max_output_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./memory"),
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            experience_capacity: DEFAULT_EXPERIENCE_CAPACITY,
            min_match_score: DEFAULT_MIN_MATCH_SCORE,
            interpreter: "python3".to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl PipelineConfig {
    /// Defaults rooted at `base_path`.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Construct from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = env_var("CAPGATE_BASE_PATH") {
            config.base_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_env::<f64>("CAPGATE_DEADLINE_SECS")? {
            config.deadline = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("CAPGATE_DEADLINE_SECS out of range: {}", secs))?;
        }
        if let Some(threshold) = parse_env::<f64>("CAPGATE_PASS_THRESHOLD")? {
            config.pass_threshold = threshold;
        }
        if let Some(capacity) = parse_env::<usize>("CAPGATE_MAX_EXPERIENCES")? {
            config.experience_capacity = capacity;
        }
        if let Some(score) = parse_env::<usize>("CAPGATE_MIN_MATCH_SCORE")? {
            config.min_match_score = score;
        }
        if let Some(python) = env_var("CAPGATE_PYTHON") {
            config.interpreter = python;
        }
        if let Some(bytes) = parse_env::<usize>("CAPGATE_MAX_OUTPUT_BYTES")? {
            config.max_output_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            anyhow::bail!(
                "pass threshold must be within [0, 1], got {}",
                self.pass_threshold
            );
        }
        if self.deadline.is_zero() {
            anyhow::bail!("per-call deadline must be positive");
        }
        if self.experience_capacity == 0 {
            anyhow::bail!("experience capacity must be at least 1");
        }
        if self.interpreter.trim().is_empty() {
            anyhow::bail!("interpreter must not be empty");
        }
        Ok(())
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }

    pub fn with_experience_capacity(mut self, capacity: usize) -> Self {
        self.experience_capacity = capacity;
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn capabilities_dir(&self) -> PathBuf {
        self.base_path.join("capabilities")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.base_path.join("archive")
    }

    pub fn experiences_file(&self) -> PathBuf {
        self.base_path.join("experiences.json")
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(None),
    }
}
