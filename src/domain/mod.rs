//! Data model for plans, steps, data-flow edges and execution state.
//!
//! `StepPayload` is a sum type with one variant per step kind, rather than
//! a single struct with a kind tag and a grab-bag of optional fields per
//! kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::safety::RiskLevel;

/// Predecessor status a step requires of one of its declared predecessors
/// before it becomes dispatchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredStatus {
    Succeeded,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predecessor {
    pub step_id: String,
    pub required_status: RequiredStatus,
}

/// Kind-specific payload. One variant per step kind a workflow can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepPayload {
    Command { text: String },
    Tool { text: String },
    Api {
        url: String,
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    Decision { predicate: String },
    Validation { predicate: String },
    Wait {
        #[serde(default)]
        predicate: Option<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    Parallel { children: Vec<String> },
    CustomCode { code: String },
    Notification { message: String },
}

impl StepPayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepPayload::Command { .. } => "command",
            StepPayload::Tool { .. } => "tool",
            StepPayload::Api { .. } => "api",
            StepPayload::Decision { .. } => "decision",
            StepPayload::Validation { .. } => "validation",
            StepPayload::Wait { .. } => "wait",
            StepPayload::Parallel { .. } => "parallel",
            StepPayload::CustomCode { .. } => "custom_code",
            StepPayload::Notification { .. } => "notification",
        }
    }
}

/// A single executable unit within a plan; polymorphic by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub payload: StepPayload,
    #[serde(default)]
    pub predecessors: Vec<Predecessor>,
    #[serde(default)]
    pub required_variables: Vec<String>,
    #[serde(default)]
    pub produced_variables: Vec<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_overlay: HashMap<String, String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "RiskLevel::default_estimate")]
    pub estimated_risk: RiskLevel,
}

impl Step {
    pub fn predecessor_ids(&self) -> impl Iterator<Item = &str> {
        self.predecessors.iter().map(|p| p.step_id.as_str())
    }
}

/// A typed wire from one step's output-variable to another step's
/// input-variable, optionally with an inline transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFlowEdge {
    pub source_step: String,
    pub source_variable: DataFlowSource,
    pub target_variable: String,
    #[serde(default)]
    pub transform: Option<String>,
}

/// What a DataFlow edge reads from its source step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFlowSource {
    Variable(String),
    Stdout,
    Stderr,
    ReturnCode,
    JsonPath(String),
}

/// An immutable, validated, dependency-graph-structured sequence of Steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub source_request: String,
    pub steps: HashMap<String, Step>,
    /// step id -> predecessor ids, derived for fast lookup.
    pub dependencies: HashMap<String, Vec<String>>,
    pub data_flow: Vec<DataFlowEdge>,
    pub entry_points: Vec<String>,
    pub initial_variables: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub source_context: SourceContextSnapshot,
}

/// Filtered copy of the caller's context — never the whole context.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceContextSnapshot {
    pub cwd: String,
    pub project_root: Option<String>,
    pub project_type: Option<String>,
}

impl Plan {
    /// Derives `dependencies` from each Step's declared predecessors.
    pub fn reindex_dependencies(&mut self) {
        self.dependencies = self
            .steps
            .values()
            .map(|s| {
                (
                    s.id.clone(),
                    s.predecessor_ids().map(str::to_string).collect(),
                )
            })
            .collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Stuck,
    Error,
}

/// Per-live-workflow mutable execution state, driven only by the Workflow
/// Engine executing this particular run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub current_step: Option<String>,
    pub completed: std::collections::HashSet<String>,
    pub failed: std::collections::HashSet<String>,
    pub results: HashMap<String, StepResult>,
    pub status: ExecutionStatus,
}

impl ExecutionState {
    pub fn new(workflow_id: String, dry_run: bool) -> Self {
        Self {
            workflow_id,
            start: Utc::now(),
            end: None,
            dry_run,
            current_step: None,
            completed: Default::default(),
            failed: Default::default(),
            results: HashMap::new(),
            status: ExecutionStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Spawn,
    Timeout,
    Signalled,
    Exit,
    UnsafeCommand,
    MalformedPredicate,
    MissingVariable,
    CycleDetected,
    UnknownStep,
    AiUnavailable,
    AiMalformed,
    Cancelled,
    RollbackIncomplete,
    Stuck,
}

/// Success boolean, exit code, bounded captured output, extracted
/// variables, elapsed time, and (if failed) error kind/message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub extracted_variables: HashMap<String, serde_json::Value>,
    pub transformed_output: Option<serde_json::Value>,
    pub elapsed: Duration,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub recovery_attempts: Vec<crate::recovery::RecoveryAttempt>,
    #[serde(default)]
    pub recovered: bool,
}

impl StepResult {
    pub fn ok(step_id: impl Into<String>, stdout: String, stderr: String, elapsed: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            exit_code: Some(0),
            stdout,
            stderr,
            extracted_variables: HashMap::new(),
            transformed_output: None,
            elapsed,
            error_kind: None,
            error_message: None,
            recovery_attempts: Vec::new(),
            recovered: false,
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            extracted_variables: HashMap::new(),
            transformed_output: None,
            elapsed,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            recovery_attempts: Vec::new(),
            recovered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reindex_dependencies_derives_from_predecessors() {
        let mut plan = Plan {
            id: "p1".into(),
            name: "test".into(),
            description: None,
            source_request: "do thing".into(),
            steps: HashMap::new(),
            dependencies: HashMap::new(),
            data_flow: vec![],
            entry_points: vec!["a".into()],
            initial_variables: HashMap::new(),
            created_at: Utc::now(),
            source_context: SourceContextSnapshot::default(),
        };
        plan.steps.insert(
            "b".into(),
            Step {
                id: "b".into(),
                name: "b".into(),
                payload: StepPayload::Command { text: "echo b".into() },
                predecessors: vec![Predecessor {
                    step_id: "a".into(),
                    required_status: RequiredStatus::Succeeded,
                }],
                required_variables: vec![],
                produced_variables: vec![],
                continue_on_failure: false,
                working_dir: None,
                env_overlay: HashMap::new(),
                timeout: None,
                retry_count: 0,
                estimated_risk: RiskLevel::Safe,
            },
        );

        plan.reindex_dependencies();
        assert_eq!(plan.dependencies.get("b").unwrap(), &vec!["a".to_string()]);
    }
}
