// crates/host/src/learn.rs

//! Caller-side learning loop: ask the oracle for a candidate, put it through
//! the gate, and on rejection ask again with the verdict attached.

use std::sync::Arc;

use anyhow::Result;
use capgate_core::synthesis::{CapabilitySynthesizer, SynthesisRequest};
use capgate_core::{Capability, Pipeline};
use tracing::debug;

use crate::log::{self, Component};

pub const MAX_ATTEMPTS: usize = 3;

/// Synthesize and integrate a capability for `description`.
///
/// Returns the committed capability, or `None` when every attempt was
/// rejected. Only store failures are errors.
pub fn learn<S: CapabilitySynthesizer>(
    pipeline: &Pipeline,
    synthesizer: &S,
    description: &str,
    context: &str,
) -> Result<Option<Arc<Capability>>> {
    let base = SynthesisRequest::new(description).with_context(context);
    let mut request = base.clone();

    for attempt in 1..=MAX_ATTEMPTS {
        log::attempt(attempt, MAX_ATTEMPTS, description);

        let candidate = match synthesizer.synthesize(&request) {
            Ok(candidate) => candidate,
            Err(e) => {
                // Retry with the same request, earlier verdict included.
                log::error(Component::Oracle, format!("{:#}", e));
                continue;
            }
        };
        debug!(name = %candidate.name, cases = candidate.test_cases.len(), "candidate received");

        let integration = pipeline.integrate(&candidate)?;
        log::verdict(&candidate.name, &integration.verdict);

        if let Some(committed) = integration.committed {
            return Ok(Some(committed));
        }
        request = base.retry(candidate, integration.verdict);
    }

    log::warn(format!(
        "gave up on '{}' after {} attempts",
        description, MAX_ATTEMPTS
    ));
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgate_core::{Candidate, PipelineConfig};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// Hands out canned candidates in order and remembers what it was asked.
    struct Scripted {
        replies: RefCell<Vec<Result<Candidate>>>,
        saw_previous: RefCell<Vec<bool>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<Candidate>>) -> Self {
            replies.reverse();
            Self {
                replies: RefCell::new(replies),
                saw_previous: RefCell::new(Vec::new()),
            }
        }
    }

    impl CapabilitySynthesizer for Scripted {
        fn synthesize(&self, request: &SynthesisRequest) -> Result<Candidate> {
            self.saw_previous
                .borrow_mut()
                .push(request.previous.is_some());
            self.replies
                .borrow_mut()
                .pop()
                .unwrap_or_else(|| Err(anyhow::anyhow!("out of replies")))
        }
    }

    fn candidate(source: &str) -> Candidate {
        Candidate {
            name: "greeter".into(),
            entry_point: "greet".into(),
            description: "greet someone by name".into(),
            parameters: BTreeMap::new(),
            source: source.into(),
            test_cases: vec![],
        }
    }

    fn pipeline() -> (tempfile::TempDir, Pipeline) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::open(PipelineConfig::new(dir.path())).unwrap();
        (dir, pipeline)
    }

    #[test]
    fn retries_with_verdict_until_admitted() {
        let (_dir, pipeline) = pipeline();
        let synth = Scripted::new(vec![
            Ok(candidate("def greet(**kw)\n    return 1\n")),
            Ok(candidate(
                "def greet(**kw):\n    return {'success': True, 'output': 'hi'}\n",
            )),
        ]);

        let committed = learn(&pipeline, &synth, "greet someone", "").unwrap();
        assert_eq!(committed.unwrap().name, "greeter");
        assert_eq!(*synth.saw_previous.borrow(), vec![false, true]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (_dir, pipeline) = pipeline();
        let synth = Scripted::new(vec![
            Err(anyhow::anyhow!("oracle unavailable")),
            Ok(candidate("def greet(:\n")),
            Ok(candidate("def greet(:\n")),
        ]);

        let committed = learn(&pipeline, &synth, "greet someone", "").unwrap();
        assert!(committed.is_none());
        assert_eq!(*synth.saw_previous.borrow(), vec![false, false, true]);
        assert!(pipeline.store().is_empty());
    }

    #[test]
    fn oracle_error_keeps_last_verdict() {
        let (_dir, pipeline) = pipeline();
        let synth = Scripted::new(vec![
            Ok(candidate("def greet(:\n")),
            Err(anyhow::anyhow!("oracle unavailable")),
            Ok(candidate("def greet(:\n")),
        ]);

        let committed = learn(&pipeline, &synth, "greet someone", "").unwrap();
        assert!(committed.is_none());
        assert_eq!(*synth.saw_previous.borrow(), vec![false, true, true]);
    }
}
