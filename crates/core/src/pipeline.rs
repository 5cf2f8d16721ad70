// crates/core/src/pipeline.rs

//! One pipeline per agent: config, store, runner, gate and selector wired
//! together with no process-wide state.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::builtins::builtin_candidates;
use crate::capability_index::RelevanceSelector;
use crate::capability_runner::{CapabilityRunner, Executor};
use crate::capability_store::CapabilityStore;
use crate::config::PipelineConfig;
use crate::error::StoreResult;
use crate::experience_log::new_experience;
use crate::gate::{Gate, Integration};
use crate::types::{
    Arguments, Candidate, Capability, ExecutionResult, Experience, GateVerdict, Provenance,
};

/// What happened when a task was routed to a stored capability.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: String,
    /// The capability the selector picked, if any scored above the floor.
    pub capability: Option<Arc<Capability>>,
    pub result: Option<ExecutionResult>,
    pub success: bool,
    pub experience: Experience,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<CapabilityStore>,
    gate: Gate<CapabilityRunner>,
    selector: RelevanceSelector,
}

impl Pipeline {
    pub fn open(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(
            CapabilityStore::open(&config)
                .with_context(|| format!("failed to open store at {}", config.base_path.display()))?,
        );
        let runner = CapabilityRunner::from_config(&config);
        let gate = Gate::new(runner, store.clone(), &config);
        let selector = RelevanceSelector::new(store.clone(), config.min_match_score);

        Ok(Self {
            config,
            store,
            gate,
            selector,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CapabilityStore> {
        &self.store
    }

    /// Force-admit the built-in capabilities that are missing or out of date.
    /// Returns how many were written.
    pub fn install_builtins(&self) -> StoreResult<usize> {
        let mut installed = 0;
        for candidate in builtin_candidates() {
            let current = self.store.get(&candidate.name);
            if current.is_some_and(|c| c.same_content(&candidate)) {
                continue;
            }
            self.gate.force_admit(&candidate, Provenance::Builtin)?;
            installed += 1;
        }
        if installed > 0 {
            info!(installed, "built-in capabilities installed");
        }
        Ok(installed)
    }

    pub fn best_match(&self, task: &str) -> Option<Arc<Capability>> {
        self.selector.best_match(task)
    }

    pub fn rank(&self, task: &str, k: usize) -> Vec<(Arc<Capability>, usize)> {
        self.selector.rank(task, k)
    }

    /// Run a stored capability once under the configured deadline.
    pub fn run(&self, capability: &Capability, arguments: &Arguments) -> ExecutionResult {
        self.gate.executor().execute(
            &capability.entry_point,
            &capability.source,
            arguments,
            self.config.deadline,
        )
    }

    /// Select a capability for `task`, run it, and record the experience.
    /// With no arguments the capability receives `{"task": task}`.
    pub fn run_task(&self, task: &str, arguments: &Arguments) -> StoreResult<TaskRun> {
        let task_only;
        let arguments = if arguments.is_empty() {
            task_only = Arguments::from_iter([("task".to_string(), Value::from(task))]);
            &task_only
        } else {
            arguments
        };
        let capability = self.best_match(task);
        let (result, success, learned) = match &capability {
            Some(cap) => {
                debug!(task, capability = %cap.name, "running selected capability");
                let result = self.run(cap, arguments);
                let success = result.reported_success();
                let learned = if success {
                    vec![format!("{} handles this kind of task", cap.name)]
                } else {
                    let reason = result.error.as_deref().unwrap_or("reported failure");
                    vec![format!("{} failed: {}", cap.name, reason)]
                };
                (Some(result), success, learned)
            }
            None => (None, false, vec!["no matching capability".to_string()]),
        };

        let experience = new_experience(
            task,
            success,
            learned,
            capability.as_ref().map(|c| c.name.clone()),
        );
        self.store.record(experience.clone())?;

        Ok(TaskRun {
            task: task.to_string(),
            capability,
            result,
            success,
            experience,
        })
    }

    pub fn evaluate(&self, candidate: &Candidate) -> GateVerdict {
        self.gate.evaluate(candidate)
    }

    pub fn commit(&self, candidate: &Candidate, verdict: &GateVerdict) -> StoreResult<bool> {
        self.gate.commit(candidate, verdict)
    }

    pub fn integrate(&self, candidate: &Candidate) -> StoreResult<Integration> {
        self.gate.integrate(candidate)
    }

    pub fn force_admit(
        &self,
        candidate: &Candidate,
        provenance: Provenance,
    ) -> StoreResult<Arc<Capability>> {
        self.gate.force_admit(candidate, provenance)
    }

    /// Past experiences relevant to `text`, most relevant first.
    pub fn recall(&self, text: &str, limit: usize) -> Vec<Experience> {
        self.store.query(text, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pipeline() -> (tempfile::TempDir, Pipeline) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::open(PipelineConfig::new(dir.path())).unwrap();
        (dir, pipeline)
    }

    #[test]
    fn builtins_install_once() {
        let (_dir, pipeline) = pipeline();
        assert_eq!(pipeline.install_builtins().unwrap(), 4);
        assert_eq!(pipeline.install_builtins().unwrap(), 0);
        assert_eq!(pipeline.store().len(), 4);
        assert_eq!(pipeline.store().archive_len(), 0);
        assert!(pipeline
            .store()
            .list()
            .iter()
            .all(|c| c.provenance == Provenance::Builtin));
    }

    #[test]
    fn changed_builtin_is_reinstalled() {
        let (_dir, pipeline) = pipeline();
        let mut stale = builtin_candidates().remove(0);
        stale.source = "def text_analyze(**kwargs):\n    return {}\n".into();
        pipeline.force_admit(&stale, Provenance::Builtin).unwrap();

        assert_eq!(pipeline.install_builtins().unwrap(), 4);
        let current = pipeline.store().get(&stale.name).unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(pipeline.store().history(&stale.name).len(), 1);
    }

    #[test]
    fn unmatched_task_records_failure() {
        let (_dir, pipeline) = pipeline();
        pipeline.install_builtins().unwrap();

        let run = pipeline
            .run_task("bake sourdough bread", &Arguments::new())
            .unwrap();
        assert!(run.capability.is_none());
        assert!(run.result.is_none());
        assert!(!run.success);

        let recalled = pipeline.recall("sourdough", 5);
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].learned, vec!["no matching capability".to_string()]);
    }

    #[test]
    fn selection_uses_configured_floor() {
        let (_dir, pipeline) = pipeline();
        pipeline.install_builtins().unwrap();
        assert_eq!(
            pipeline.best_match("evaluate a math expression").unwrap().name,
            "math-eval"
        );
        assert!(pipeline.best_match("math").is_none());
        assert!(!pipeline.rank("math", 3).is_empty());
    }

    #[test]
    fn invalid_config_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::new(dir.path()).with_pass_threshold(1.5);
        assert!(Pipeline::open(config).is_err());
    }
}
