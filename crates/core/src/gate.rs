// crates/core/src/gate.rs

//! Test-and-integrate protocol.
//!
//! A candidate either passes its own test cases at the configured threshold and
//! goes into the store, or it doesn't and the store is left untouched. The
//! verdict is the only artifact of a rejection; retrying is the caller's call.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capability_runner::Executor;
use crate::capability_store::{validate_name, CapabilityStore};
use crate::config::PipelineConfig;
use crate::error::StoreResult;
use crate::types::{Candidate, Capability, FailureKind, GateVerdict, Provenance, TestOutcome};

/// Result of `Gate::integrate`.
#[derive(Debug, Clone)]
pub struct Integration {
    pub verdict: GateVerdict,
    /// The stored version, when the candidate was admitted.
    pub committed: Option<Arc<Capability>>,
}

impl Integration {
    pub fn admitted(&self) -> bool {
        self.committed.is_some()
    }
}

pub struct Gate<E> {
    executor: E,
    store: Arc<CapabilityStore>,
    threshold: f64,
    deadline: Duration,
}

impl<E: Executor> Gate<E> {
    pub fn new(executor: E, store: Arc<CapabilityStore>, config: &PipelineConfig) -> Self {
        Self {
            executor,
            store,
            threshold: config.pass_threshold,
            deadline: config.deadline,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Run the candidate's test suite. Never touches the store.
    pub fn evaluate(&self, candidate: &Candidate) -> GateVerdict {
        if let Err(e) = validate_name(&candidate.name) {
            return GateVerdict::rejected(FailureKind::SyntaxInvalid, e.to_string(), self.threshold);
        }
        if let Err(e) = self
            .executor
            .check_syntax(&candidate.entry_point, &candidate.source)
        {
            debug!(name = %candidate.name, error = %e, "candidate failed syntax check");
            return GateVerdict::rejected(FailureKind::SyntaxInvalid, e, self.threshold);
        }
        if candidate.test_cases.is_empty() {
            return GateVerdict::vacuous(self.threshold);
        }

        // Sequential, in declared order: cases may have observable side effects.
        let results: Vec<TestOutcome> = candidate
            .test_cases
            .iter()
            .map(|case| {
                let run = self.executor.execute(
                    &candidate.entry_point,
                    &candidate.source,
                    &case.input,
                    self.deadline,
                );
                let actual_success = run.reported_success();
                let passed = actual_success == case.expect_success;
                debug!(
                    name = %candidate.name,
                    case = %case.label,
                    expected = case.expect_success,
                    actual = actual_success,
                    elapsed_ms = run.elapsed.as_millis() as u64,
                    "test case evaluated"
                );
                TestOutcome {
                    label: case.label.clone(),
                    expected_success: case.expect_success,
                    actual_success,
                    output: run.output,
                    error: run.error,
                    elapsed: run.elapsed,
                    passed,
                }
            })
            .collect();

        GateVerdict::from_outcomes(results, self.threshold)
    }

    /// Commit an evaluated candidate. Returns `Ok(false)` and writes nothing when
    /// the verdict did not pass; only storage failures are errors.
    pub fn commit(&self, candidate: &Candidate, verdict: &GateVerdict) -> StoreResult<bool> {
        Ok(self.commit_verdict(candidate, verdict)?.is_some())
    }

    /// Evaluate and, on a pass, commit.
    pub fn integrate(&self, candidate: &Candidate) -> StoreResult<Integration> {
        let verdict = self.evaluate(candidate);
        let committed = self.commit_verdict(candidate, &verdict)?;
        Ok(Integration { verdict, committed })
    }

    /// Commit without testing. For sources the caller already trusts, such as
    /// hand-authored built-ins; never for synthesized candidates.
    pub fn force_admit(
        &self,
        candidate: &Candidate,
        provenance: Provenance,
    ) -> StoreResult<Arc<Capability>> {
        let committed = self.store.commit(candidate, provenance)?;
        info!(name = %committed.name, version = committed.version, "force-admitted without tests");
        Ok(committed)
    }

    fn commit_verdict(
        &self,
        candidate: &Candidate,
        verdict: &GateVerdict,
    ) -> StoreResult<Option<Arc<Capability>>> {
        if !verdict.passed {
            warn!(
                name = %candidate.name,
                pass_rate = verdict.pass_rate,
                threshold = self.threshold,
                error = verdict.error.as_deref().unwrap_or(""),
                "candidate not integrated"
            );
            return Ok(None);
        }
        let committed = self.store.commit(candidate, Provenance::Generated)?;
        info!(
            name = %committed.name,
            version = committed.version,
            passed = verdict.passed_count,
            total = verdict.total_count,
            "candidate integrated"
        );
        Ok(Some(committed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Arguments, ExecutionResult, TestCase};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    /// Scripted executor: each call pops the next canned result and records the
    /// label it was called with.
    #[derive(Default)]
    struct Scripted {
        syntax_error: Option<String>,
        results: Mutex<Vec<ExecutionResult>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with_results(results: Vec<ExecutionResult>) -> Self {
            Self {
                results: Mutex::new(results.into_iter().rev().collect()),
                ..Self::default()
            }
        }
    }

    impl Executor for Scripted {
        fn check_syntax(&self, _entry_point: &str, _source: &str) -> Result<(), String> {
            match &self.syntax_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn execute(
            &self,
            _entry_point: &str,
            _source: &str,
            arguments: &Arguments,
            _deadline: Duration,
        ) -> ExecutionResult {
            let tag = arguments
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            self.calls.lock().push(tag);
            self.results
                .lock()
                .pop()
                .unwrap_or_else(|| ok(json!({"success": true})))
        }
    }

    fn ok(output: Value) -> ExecutionResult {
        ExecutionResult::success(Some(output), Duration::from_millis(1))
    }

    fn crashed() -> ExecutionResult {
        ExecutionResult::failure(FailureKind::RuntimeFailure, "boom", Duration::from_millis(1))
    }

    fn case(tag: &str, expect_success: bool) -> TestCase {
        let mut input = Arguments::new();
        input.insert("tag".into(), json!(tag));
        TestCase::new(tag, input, expect_success)
    }

    fn candidate(cases: Vec<TestCase>) -> Candidate {
        Candidate {
            name: "sample".into(),
            entry_point: "run".into(),
            description: "sample capability".into(),
            parameters: BTreeMap::new(),
            source: "def run(**kw):\n    return {'success': True}\n".into(),
            test_cases: cases,
        }
    }

    fn setup<E: Executor>(executor: E) -> (tempfile::TempDir, Arc<CapabilityStore>, Gate<E>) {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::new(dir.path());
        let store = Arc::new(CapabilityStore::open(&config).unwrap());
        let gate = Gate::new(executor, store.clone(), &config);
        (dir, store, gate)
    }

    #[test]
    fn empty_suite_passes_vacuously() {
        let exec = Scripted::default();
        let (_dir, _store, gate) = setup(&exec);
        let verdict = gate.evaluate(&candidate(vec![]));
        assert!(verdict.passed);
        assert_eq!(verdict.pass_rate, 1.0);
        assert!(exec.calls.lock().is_empty());
    }

    #[test]
    fn syntax_failure_never_executes() {
        let exec = Scripted {
            syntax_error: Some("SyntaxError: invalid syntax".into()),
            ..Scripted::default()
        };
        let (_dir, store, gate) = setup(&exec);
        let c = candidate(vec![case("a", true), case("b", true)]);

        let integration = gate.integrate(&c).unwrap();
        assert!(!integration.admitted());
        assert_eq!(integration.verdict.pass_rate, 0.0);
        assert_eq!(integration.verdict.failure, Some(FailureKind::SyntaxInvalid));
        assert!(integration.verdict.error.unwrap().contains("SyntaxError"));
        assert!(exec.calls.lock().is_empty());
        assert!(store.get("sample").is_none());
    }

    #[test]
    fn cases_run_in_declared_order() {
        let exec = Scripted::default();
        let (_dir, _store, gate) = setup(&exec);
        let tags = ["first", "second", "third", "fourth"];
        gate.evaluate(&candidate(tags.iter().map(|t| case(t, true)).collect()));
        assert_eq!(*exec.calls.lock(), tags.to_vec());
    }

    #[test]
    fn three_of_four_is_accepted() {
        let exec = Scripted::with_results(vec![
            ok(json!({"success": true})),
            ok(json!({"success": true})),
            ok(json!({"success": true})),
            crashed(),
        ]);
        let (_dir, store, gate) = setup(&exec);
        let c = candidate((0..4).map(|i| case(&i.to_string(), true)).collect());
        let integration = gate.integrate(&c).unwrap();
        assert_eq!(integration.verdict.pass_rate, 0.75);
        assert!(integration.admitted());
        assert_eq!(store.get("sample").unwrap().version, 1);
    }

    #[test]
    fn two_of_four_is_rejected_and_store_untouched() {
        let exec = Scripted::with_results(vec![
            ok(json!({"success": true})),
            crashed(),
            ok(json!({"success": false})),
            ok(json!({"success": true})),
        ]);
        let (_dir, store, gate) = setup(&exec);
        let c = candidate((0..4).map(|i| case(&i.to_string(), true)).collect());
        let verdict = gate.evaluate(&c);
        assert_eq!(verdict.pass_rate, 0.5);
        assert!(!gate.commit(&c, &verdict).unwrap());
        assert!(store.get("sample").is_none());
        assert_eq!(store.archive_len(), 0);
    }

    #[test]
    fn expected_failures_count_as_passes() {
        let exec = Scripted::with_results(vec![
            ok(json!({"success": true})),
            ok(json!({"success": false, "error": "missing text"})),
        ]);
        let (_dir, _store, gate) = setup(&exec);
        let verdict = gate.evaluate(&candidate(vec![case("good", true), case("bad", false)]));
        assert_eq!(verdict.passed_count, 2);
        assert!(verdict.results.iter().all(|r| r.passed));
        assert!(!verdict.results[1].actual_success);
    }

    #[test]
    fn rejected_candidate_keeps_previous_version() {
        let exec = Scripted::with_results(vec![crashed()]);
        let (_dir, store, gate) = setup(&exec);
        let original = candidate(vec![]);
        gate.force_admit(&original, Provenance::Builtin).unwrap();

        let mut replacement = candidate(vec![case("x", true)]);
        replacement.source = "def run(**kw):\n    raise ValueError()\n".into();
        let integration = gate.integrate(&replacement).unwrap();

        assert!(!integration.admitted());
        let current = store.get("sample").unwrap();
        assert!(current.same_content(&original));
        assert_eq!(current.provenance, Provenance::Builtin);
    }

    #[test]
    fn commit_twice_archives_twice_and_keeps_content() {
        let exec = Scripted::default();
        let (_dir, store, gate) = setup(&exec);
        let c = candidate(vec![]);
        gate.force_admit(&c, Provenance::Generated).unwrap();

        let verdict = gate.evaluate(&c);
        assert!(gate.commit(&c, &verdict).unwrap());
        assert!(gate.commit(&c, &verdict).unwrap());

        assert_eq!(store.history("sample").len(), 2);
        assert!(store.get("sample").unwrap().same_content(&c));
    }

    #[test]
    fn unaddressable_name_is_rejected_before_execution() {
        let exec = Scripted::default();
        let (_dir, _store, gate) = setup(&exec);
        let mut c = candidate(vec![case("a", true)]);
        c.name = "../etc".into();
        let verdict = gate.evaluate(&c);
        assert!(!verdict.passed);
        assert!(exec.calls.lock().is_empty());
    }
}
