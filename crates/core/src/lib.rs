// crates/core/src/lib.rs

//! Test-gated capability pipeline: sandboxed execution, a test-and-integrate
//! gate, a versioned capability store and a lexical relevance selector.

pub mod ai_client;
pub mod builtins;
pub mod capability_index;
pub mod capability_runner;
pub mod capability_store;
pub mod config;
pub mod error;
pub mod experience_log;
pub mod foundry_client;
pub mod gate;
pub mod pipeline;
pub mod syntax_check;
pub mod synthesis;
pub mod types;

pub use capability_runner::{CapabilityRunner, Executor};
pub use capability_store::CapabilityStore;
pub use config::PipelineConfig;
pub use error::{StoreError, StoreResult};
pub use gate::{Gate, Integration};
pub use pipeline::{Pipeline, TaskRun};
pub use types::{
    Arguments, Candidate, Capability, ExecutionResult, Experience, FailureKind, GateVerdict,
    Provenance, TestCase, TestOutcome,
};
