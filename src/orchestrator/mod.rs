//! Front door: wires collaborators, limits, trusted commands, and state-dir
//! paths into one place, built once per CLI invocation and threaded
//! through workflow loading, validation, and execution.

use std::path::{Path, PathBuf};

use crate::collaborators::{AiCollaborator, ApprovalCollaborator, AutoApprove, HttpAiCollaborator, NotificationCollaborator, StderrNotifier, TerminalApproval};
use crate::domain::{ExecutionStatus, Plan, SourceContextSnapshot};
use crate::engine::{self, EngineConfig, EngineOutcome};
use crate::limits::{ExecutionLimits, LimitsPreset};
use crate::loader;
use crate::recovery::RecoveryHistory;
use crate::safety::TrustedCommands;

/// Per-user state directory: `~/.shellforge` unless overridden, holding
/// `workflows/<name>.json`, `rollback/`, and `recovery_history.json`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SHELLFORGE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs_home().join(".shellforge")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

pub fn workflows_dir() -> PathBuf {
    state_dir().join("workflows")
}

pub fn rollback_dir() -> PathBuf {
    state_dir().join("rollback")
}

pub fn recovery_history_path() -> PathBuf {
    state_dir().join("recovery_history.json")
}

fn workflow_path(name: &str) -> PathBuf {
    workflows_dir().join(format!("{name}.json"))
}

/// Reads the user's trusted-base-executables list from
/// `<state_dir>/trusted_commands.json` (a plain JSON array of names, e.g.
/// `["git", "npm"]`). Missing or malformed files mean nothing is trusted.
fn load_trusted_commands() -> TrustedCommands {
    let path = state_dir().join("trusted_commands.json");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .map(TrustedCommands::new)
        .unwrap_or_default()
}

/// Holds everything a CLI invocation needs, built once from global flags.
pub struct Application {
    pub limits: ExecutionLimits,
    pub trusted: TrustedCommands,
    pub approval: Box<dyn ApprovalCollaborator>,
    pub notifier: Box<dyn NotificationCollaborator>,
    pub ai: Option<Box<dyn AiCollaborator>>,
    pub dry_run: bool,
}

impl Application {
    /// `limits_preset` selects a baseline (`strict`/`default`/`relaxed`)
    /// before `SHELLFORGE_MAX_*` env vars are applied on top of it.
    pub fn new(dry_run: bool, auto_approve: bool, limits_preset: LimitsPreset) -> Self {
        let approval: Box<dyn ApprovalCollaborator> = if auto_approve { Box::new(AutoApprove) } else { Box::new(TerminalApproval) };
        let ai = std::env::var("SHELLFORGE_AI_ENDPOINT").ok().map(|endpoint| {
            let key = std::env::var("SHELLFORGE_AI_API_KEY").ok();
            Box::new(HttpAiCollaborator::new(endpoint, key)) as Box<dyn AiCollaborator>
        });

        Self {
            limits: limits_preset.base().merged_with_env(),
            trusted: load_trusted_commands(),
            approval,
            notifier: Box::new(StderrNotifier),
            ai,
            dry_run,
        }
    }

    /// Loads the named workflow, runs it to completion, and persists any
    /// recovery history learned along the way. `dry_run` is ORed with the
    /// Application's own global `--dry-run` flag.
    pub async fn run_workflow(&self, name: &str, vars: &[(String, serde_json::Value)], dry_run: bool) -> anyhow::Result<EngineOutcome> {
        let mut plan = loader::load_plan_from_file(workflow_path(name))?;
        for (key, value) in vars {
            plan.initial_variables.insert(key.clone(), value.clone());
        }

        if let Err(reasons) = crate::validation::validate_plan(&plan) {
            anyhow::bail!("workflow '{name}' is invalid: {reasons:?}");
        }
        let total_retries: u32 = plan.steps.values().map(|s| s.retry_count).sum();
        let limit_check = crate::limits::validate_limits(plan.steps.len(), total_retries, &self.limits);
        if !limit_check.passed {
            let detail = limit_check
                .violations
                .iter()
                .map(|v| format!("{} ({}: limit {}, got {})", v.message, v.limit_name, v.limit_value, v.actual_value))
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!("workflow '{name}' exceeds execution limits: {detail}");
        }

        std::fs::create_dir_all(rollback_dir())?;
        let mut history = RecoveryHistory::load_or_default(recovery_history_path())?;

        let outcome = engine::run_workflow(
            &plan,
            &rollback_dir(),
            &mut history,
            EngineConfig {
                limits: &self.limits,
                trusted: &self.trusted,
                approval: self.approval.as_ref(),
                notifier: self.notifier.as_ref(),
                ai: self.ai.as_deref(),
                dry_run: self.dry_run || dry_run,
            },
        )
        .await?;

        history.save()?;
        Ok(outcome)
    }
}

pub fn list_workflow_names() -> anyhow::Result<Vec<String>> {
    let dir = workflows_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub fn load_workflow(name: &str) -> anyhow::Result<Plan> {
    loader::load_plan_from_file(workflow_path(name))
}

/// Builds a new, empty plan named `name` to be filled in later (e.g. via
/// `generate`), optionally seeding it from an existing plan file instead;
/// a file-seeded plan is validated before it's written. Writes the result
/// into the workflows directory.
pub fn create_workflow(name: &str, description: Option<String>, from_file: Option<&Path>) -> anyhow::Result<()> {
    std::fs::create_dir_all(workflows_dir())?;
    match from_file {
        Some(path) => {
            let plan = loader::load_plan_from_file(path)?;
            if let Err(reasons) = crate::validation::validate_plan(&plan) {
                anyhow::bail!("plan is invalid: {reasons:?}");
            }
            loader::save_plan_to_file(&plan, workflow_path(name))
        }
        None => {
            let plan = crate::generator::repair_plan(Plan {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                description,
                source_request: String::new(),
                steps: Default::default(),
                dependencies: Default::default(),
                data_flow: vec![],
                entry_points: vec![],
                initial_variables: Default::default(),
                created_at: chrono::Utc::now(),
                source_context: SourceContextSnapshot::default(),
            });
            loader::save_plan_to_file(&plan, workflow_path(name))
        }
    }
}

pub fn delete_workflow(name: &str) -> anyhow::Result<()> {
    std::fs::remove_file(workflow_path(name))?;
    Ok(())
}

pub fn outcome_exit_code(outcome: &EngineOutcome) -> i32 {
    match outcome.state.status {
        ExecutionStatus::Completed => 0,
        _ => 1,
    }
}
