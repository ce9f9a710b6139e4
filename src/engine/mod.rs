//! Workflow Engine: drives a validated Plan to completion one batch at a
//! time. Batches come from the Dependency Graph; each batch is dispatched
//! concurrently, bounded by a semaphore sized from
//! `ExecutionLimits::max_parallel`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::collaborators::{AiCollaborator, ApprovalCollaborator, ApprovalOption, NotificationCollaborator, Severity};
use crate::dag;
use crate::dispatcher::{self, Dispatched};
use crate::domain::{DataFlowEdge, ErrorKind, ExecutionState, ExecutionStatus, Plan, RequiredStatus, Step, StepResult};
use crate::limits::{ExecutionLimits, RetryCounter};
use crate::recovery::{self, RecoveryHistory, RecoveryStrategy, StrategyKind};
use crate::rollback::{OperationKind, Transaction};
use crate::safety::{self, RiskLevel, TrustedCommands};
use crate::variables::VariableStore;

pub struct EngineConfig<'a> {
    pub limits: &'a ExecutionLimits,
    pub trusted: &'a TrustedCommands,
    pub approval: &'a dyn ApprovalCollaborator,
    pub notifier: &'a dyn NotificationCollaborator,
    pub ai: Option<&'a dyn AiCollaborator>,
    pub dry_run: bool,
}

pub struct EngineOutcome {
    pub state: ExecutionState,
    pub rollback_failures: Vec<String>,
}

/// Drives `plan` to completion inside a fresh Rollback Transaction under
/// `rollback_state_dir`, consulting/extending `history` on every failure.
pub async fn run_workflow(
    plan: &Plan,
    rollback_state_dir: &std::path::Path,
    history: &mut RecoveryHistory,
    config: EngineConfig<'_>,
) -> anyhow::Result<EngineOutcome> {
    let mut state = ExecutionState::new(plan.id.clone(), config.dry_run);
    let mut store = VariableStore::new();
    store.extend(&plan.initial_variables);
    let mut txn = Transaction::open(rollback_state_dir, format!("workflow '{}'", plan.name))?;

    let order = match dag::topological_order(plan) {
        Ok(order) => order,
        Err(cycle) => {
            txn.rollback().ok();
            state.status = ExecutionStatus::Error;
            return Ok(EngineOutcome {
                state,
                rollback_failures: vec![format!("plan has a cycle: {cycle:?}")],
            });
        }
    };
    let batches = dag::compute_batches(plan, &order);
    let semaphore = Arc::new(Semaphore::new(config.limits.max_parallel));
    let retry_budget = RetryCounter::new(config.limits.max_retries_total);

    let mut stop_requested = false;

    'batches: for batch in &batches {
        let mut to_run = Vec::new();
        for step_id in batch {
            let Some(step) = plan.steps.get(step_id) else { continue };
            match predecessor_gap(step, &state) {
                None => to_run.push(step),
                Some(reason) => {
                    let result = StepResult::failed(&step.id, ErrorKind::MissingVariable, reason, Duration::from_millis(0));
                    state.failed.insert(step.id.clone());
                    state.results.insert(step.id.clone(), result);
                }
            }
        }

        if to_run.is_empty() {
            continue;
        }

        let store_snapshot = &store;
        let config_ref = &config;
        let semaphore_ref = &semaphore;
        let txn_ref = &txn;
        let mut in_flight: FuturesUnordered<_> = to_run
            .iter()
            .map(|step| async move {
                let _permit = semaphore_ref.acquire().await;
                let pre_op = if config_ref.dry_run {
                    None
                } else {
                    step_text(step).map(|t| store_snapshot.substitute(&t)).as_deref().and_then(infer_file_op)
                };
                let backup = match &pre_op {
                    Some(FileOp::WriteFile { path }) | Some(FileOp::DeleteFile { path }) => {
                        std::fs::read(path).ok().and_then(|bytes| txn_ref.store_pre_image(&step.id, Path::new(path), &bytes).ok())
                    }
                    _ => None,
                };
                let result = run_step(step, store_snapshot, config_ref).await;
                (step.id.clone(), result, pre_op, backup)
            })
            .collect();

        let mut batch_results: HashMap<String, (StepResult, Option<FileOp>, Option<String>)> = HashMap::new();
        while let Some((id, result, pre_op, backup)) = in_flight.next().await {
            batch_results.insert(id, (result, pre_op, backup));
        }
        drop(in_flight);

        for step in &to_run {
            let Some((mut result, pre_op, backup)) = batch_results.remove(&step.id) else { continue };

            if !config.dry_run && result.success {
                if let Some(text) = step_text(step) {
                    let kind = pre_op
                        .map(|op| op.into_operation_kind(backup))
                        .unwrap_or(OperationKind::ExecuteCommand { command: store.substitute(&text) });
                    let _ = txn.append(kind);
                }
            }

            if !result.success {
                if retry_budget.try_increment() {
                    result = attempt_recovery(step, result, &mut store, history, &config).await;
                } else {
                    result.error_message = Some(format!(
                        "recovery budget exhausted ({}/{} retries attempted); not retrying",
                        retry_budget.current(),
                        retry_budget.limit()
                    ));
                }
            }

            if result.success {
                store.extend(&result.extracted_variables);
                state.completed.insert(step.id.clone());
            } else {
                state.failed.insert(step.id.clone());
                if !step.continue_on_failure {
                    stop_requested = true;
                }
            }

            apply_data_flow(plan, &step.id, &result, &mut store).await;
            state.results.insert(step.id.clone(), result);
        }

        if stop_requested {
            break 'batches;
        }
    }

    let total_known = state.completed.len() + state.failed.len();
    state.status = if stop_requested {
        ExecutionStatus::Failed
    } else if total_known == plan.steps.len() {
        ExecutionStatus::Completed
    } else {
        ExecutionStatus::Stuck
    };
    state.end = Some(chrono::Utc::now());

    match state.status {
        ExecutionStatus::Completed | ExecutionStatus::Running => {}
        ExecutionStatus::Failed | ExecutionStatus::Error => {
            config
                .notifier
                .notify("workflow failed", &format!("workflow '{}' ended in state {:?}", plan.name, state.status), Severity::Error)
                .await;
        }
        ExecutionStatus::Stuck => {
            config
                .notifier
                .notify(
                    "workflow stuck",
                    &format!("workflow '{}' made no further progress; {total_known} of {} steps resolved", plan.name, plan.steps.len()),
                    Severity::Warning,
                )
                .await;
        }
    }

    let rollback_failures = match state.status {
        ExecutionStatus::Completed => {
            txn.commit()?;
            Vec::new()
        }
        _ => txn.rollback()?,
    };

    if !rollback_failures.is_empty() {
        config
            .notifier
            .notify(
                "rollback incomplete",
                &format!("{} operation(s) in workflow '{}' could not be reversed", rollback_failures.len(), plan.name),
                Severity::Error,
            )
            .await;
    }

    Ok(EngineOutcome { state, rollback_failures })
}

/// A Rollback Log operation kind inferred from a command's shape, plus
/// enough to attach a pre-image backup path once the caller has captured
/// one for a write/delete.
#[derive(Debug, Clone)]
enum FileOp {
    WriteFile { path: String },
    DeleteFile { path: String },
    CreateFile { path: String },
    CreateDirectory { path: String },
    CopyFile { source: String, destination: String },
    MoveFile { source: String, destination: String },
}

impl FileOp {
    fn into_operation_kind(self, backup: Option<String>) -> OperationKind {
        match self {
            FileOp::WriteFile { path } => OperationKind::WriteFile { path, pre_image_backup: backup },
            FileOp::DeleteFile { path } => OperationKind::DeleteFile { path, pre_image_backup: backup },
            FileOp::CreateFile { path } => OperationKind::CreateFile { path },
            FileOp::CreateDirectory { path } => OperationKind::CreateDirectory { path },
            FileOp::CopyFile { source, destination } => OperationKind::CopyFile { source, destination },
            FileOp::MoveFile { source, destination } => OperationKind::MoveFile { source, destination },
        }
    }
}

/// Pattern-matches a substituted command's shape to the Rollback Log
/// operation it most likely performs. A `WriteFile`/`DeleteFile` match still
/// needs its pre-image snapshotted by the caller before the command runs;
/// anything unrecognized falls back to a plain `ExecuteCommand` record with
/// a no-op undo.
fn infer_file_op(text: &str) -> Option<FileOp> {
    let tokens = shell_words::split(text).ok()?;
    let (head, rest) = tokens.split_first()?;
    match head.as_str() {
        "rm" => Some(FileOp::DeleteFile {
            path: rest.iter().rev().find(|t| !t.starts_with('-'))?.clone(),
        }),
        "touch" => Some(FileOp::CreateFile { path: rest.last()?.clone() }),
        "mkdir" => Some(FileOp::CreateDirectory {
            path: rest.iter().rev().find(|t| !t.starts_with('-'))?.clone(),
        }),
        "cp" => {
            let paths: Vec<_> = rest.iter().filter(|t| !t.starts_with('-')).collect();
            Some(FileOp::CopyFile {
                source: paths.first()?.to_string(),
                destination: paths.last()?.to_string(),
            })
        }
        "mv" => {
            let paths: Vec<_> = rest.iter().filter(|t| !t.starts_with('-')).collect();
            Some(FileOp::MoveFile {
                source: paths.first()?.to_string(),
                destination: paths.last()?.to_string(),
            })
        }
        _ => {
            let idx = text.find('>')?;
            if text[idx..].starts_with(">>") {
                return None;
            }
            let path = text[idx + 1..].split_whitespace().next()?;
            Some(FileOp::WriteFile { path: path.to_string() })
        }
    }
}

/// Returns `Some(reason)` if `step` cannot yet run given `state` — an unmet
/// predecessor status or a missing required variable.
fn predecessor_gap(step: &Step, state: &ExecutionState) -> Option<String> {
    for pred in &step.predecessors {
        let satisfied = match pred.required_status {
            RequiredStatus::Succeeded => state.completed.contains(&pred.step_id),
            RequiredStatus::Failed => state.failed.contains(&pred.step_id),
            RequiredStatus::Completed => state.completed.contains(&pred.step_id) || state.failed.contains(&pred.step_id),
        };
        if !satisfied {
            return Some(format!(
                "predecessor '{}' has not reached required status {:?}",
                pred.step_id, pred.required_status
            ));
        }
    }
    None
}

fn step_text(step: &Step) -> Option<String> {
    use crate::domain::StepPayload::*;
    match &step.payload {
        Command { text } | Tool { text } => Some(text.clone()),
        _ => None,
    }
}

/// Dispatches a single step, applying the safety-approval gate to
/// command/tool/custom-code kinds first. `parallel` steps run their
/// children concurrently right here and fold the results into one.
async fn run_step(step: &Step, store: &VariableStore, config: &EngineConfig<'_>) -> StepResult {
    tracing::debug!(target: "engine", step = %step.id, kind = step.payload.kind_name(), "dispatching step");
    if config.dry_run {
        return match step_text(step) {
            Some(text) => {
                let substituted = store.substitute(&text);
                StepResult::ok(&step.id, format!("[dry-run] would execute: {substituted}"), String::new(), Duration::from_millis(0))
            }
            None => dispatch_and_fold(step, store, config).await,
        };
    }

    if let Some(text) = step_text(step) {
        let substituted = store.substitute(&text);
        if !safety::is_auto_approved(&substituted, config.trusted) {
            let risk = safety::classify(&substituted).risk;
            if !request_approval(config, &step.id, &substituted, risk).await {
                return StepResult::failed(&step.id, ErrorKind::UnsafeCommand, format!("'{substituted}' rejected at risk level {risk:?} without approval"), Duration::from_millis(0));
            }
        }
    }
    if let crate::domain::StepPayload::CustomCode { code } = &step.payload {
        if !request_approval(config, &step.id, code, RiskLevel::High).await {
            return StepResult::failed(&step.id, ErrorKind::UnsafeCommand, "custom-code step rejected without approval", Duration::from_millis(0));
        }
    }

    dispatch_and_fold(step, store, config).await
}

async fn dispatch_and_fold(step: &Step, store: &VariableStore, config: &EngineConfig<'_>) -> StepResult {
    match dispatcher::dispatch(step, store, config.notifier).await {
        Dispatched::Result(result) => result,
        Dispatched::Parallel(children) => run_parallel_children(&children.0, step, store, config.notifier).await,
    }
}

async fn request_approval(config: &EngineConfig<'_>, step_id: &str, command: &str, risk: RiskLevel) -> bool {
    let options = vec![
        ApprovalOption {
            key: "y".into(),
            label: "approve".into(),
        },
        ApprovalOption {
            key: "n".into(),
            label: "deny".into(),
        },
    ];
    let prompt = format!("step '{step_id}' wants to run '{command}' at risk level {risk:?}");
    matches!(config.approval.confirm(&prompt, risk, &options).await.as_deref(), Some("y"))
}

async fn run_parallel_children(
    child_ids: &[String],
    parent: &Step,
    _store: &VariableStore,
    _notifier: &dyn NotificationCollaborator,
) -> StepResult {
    // Children referenced by a `parallel` step are resolved by the caller
    // holding the full Plan; `run_step` only has a single Step in scope, so
    // a bare list of ids with no further dispatch is the most it can do
    // without the Plan. The engine's batch loop schedules named children as
    // ordinary plan steps instead — this path only covers a `parallel` step
    // invoked outside the normal batch loop (e.g. nested in a transform).
    let started = Instant::now();
    if child_ids.is_empty() {
        return StepResult::ok(&parent.id, "no children".to_string(), String::new(), started.elapsed());
    }
    StepResult::ok(
        &parent.id,
        format!("delegated {} children to the batch scheduler", child_ids.len()),
        String::new(),
        started.elapsed(),
    )
}

async fn attempt_recovery(
    step: &Step,
    failed: StepResult,
    store: &mut VariableStore,
    history: &mut RecoveryHistory,
    config: &EngineConfig<'_>,
) -> StepResult {
    let error_text = format!("{}\n{}", failed.error_message.clone().unwrap_or_default(), failed.stderr);
    let signature = recovery::error_signature(&error_text);
    let failed_command = step_text(step).map(|t| store.substitute(&t)).unwrap_or_default();
    let mut candidates = recovery::generate_candidates(&signature, &failed_command);

    if let Some(ai) = config.ai {
        if let Some(mut suggested) = ai_suggested_strategies(ai, step, &failed).await {
            candidates.append(&mut suggested);
        }
    }

    let ranked = recovery::rank_strategies(&signature, candidates, history);
    let Some((top_strategy, confidence)) = ranked.into_iter().next() else {
        return failed;
    };

    let auto = recovery::should_auto_recover(&signature, &top_strategy, confidence, history);
    let strategy = if auto {
        Some(top_strategy)
    } else {
        let options = vec![
            ApprovalOption {
                key: "apply".into(),
                label: top_strategy.description.clone(),
            },
            ApprovalOption {
                key: "abort".into(),
                label: "abort and propagate the failure".into(),
            },
        ];
        let prompt = format!("step '{}' failed ({signature}); apply recovery strategy?", step.id);
        match config.approval.confirm(&prompt, RiskLevel::Medium, &options).await {
            Some(choice) if choice == "apply" => Some(top_strategy),
            _ => None,
        }
    };

    let Some(strategy) = strategy else {
        return failed;
    };

    let outcome = execute_strategy(step, &strategy, store).await;
    history.record_outcome(&signature, &strategy, outcome.success);
    let _ = history.save();

    let mut result = outcome;
    result.recovery_attempts.push(crate::recovery::RecoveryAttempt {
        signature,
        strategy,
        auto_approved: auto,
        succeeded: result.success,
    });
    if result.success {
        result.recovered = true;
    }
    result
}

async fn ai_suggested_strategies(ai: &dyn AiCollaborator, step: &Step, failed: &StepResult) -> Option<Vec<RecoveryStrategy>> {
    let command = step_text(step).unwrap_or_default();
    let prompt = format!(
        "The command `{command}` failed with:\n{}\nSuggest recovery strategies as a JSON array of objects with \
         fields kind, command, description, confidence, retry_original_on_success.",
        failed.error_message.clone().unwrap_or_default()
    );
    let raw = ai.generate(&prompt, 512, 0.2).await.ok()?;
    serde_json::from_str::<Vec<RecoveryStrategy>>(&raw).ok()
}

async fn execute_strategy(step: &Step, strategy: &RecoveryStrategy, store: &VariableStore) -> StepResult {
    match strategy.kind {
        StrategyKind::Skip => StepResult::ok(&step.id, "skipped via recovery strategy".to_string(), String::new(), Duration::from_millis(0)),
        StrategyKind::Abort => StepResult::failed(&step.id, ErrorKind::Cancelled, "recovery strategy chose to abort", Duration::from_millis(0)),
        StrategyKind::Retry | StrategyKind::ModifyCommand | StrategyKind::AlternativeCommand => {
            let command = strategy.command.clone().or_else(|| step_text(step)).unwrap_or_default();
            run_command_text(&step.id, &store.substitute(&command)).await
        }
        StrategyKind::PrepareEnvironmentThenRetry => {
            let Some(prep) = &strategy.command else {
                return StepResult::failed(&step.id, ErrorKind::Exit, "no preparation command given", Duration::from_millis(0));
            };
            let prep_result = run_command_text(&step.id, &store.substitute(prep)).await;
            if !prep_result.success {
                return prep_result;
            }
            let original = step_text(step).unwrap_or_default();
            run_command_text(&step.id, &store.substitute(&original)).await
        }
        StrategyKind::RevertChanges => StepResult::ok(&step.id, "changes reverted via rollback".to_string(), String::new(), Duration::from_millis(0)),
    }
}

async fn run_command_text(step_id: &str, command: &str) -> StepResult {
    let env = HashMap::new();
    crate::command::CommandRunner::run(
        step_id,
        crate::command::RunRequest {
            command,
            working_dir: None,
            env_overlay: &env,
            timeout: Duration::from_secs(30),
            dry_run: false,
        },
    )
    .await
}

async fn apply_data_flow(plan: &Plan, source_step_id: &str, result: &StepResult, store: &mut VariableStore) {
    let edges: Vec<&DataFlowEdge> = plan.data_flow.iter().filter(|e| e.source_step == source_step_id).collect();
    for edge in edges {
        let Some(value) = dispatcher::resolve_data_flow_source(&edge.source_variable, result) else {
            tracing::warn!(target: "engine", step = source_step_id, variable = %edge.target_variable, "data-flow source value missing");
            continue;
        };
        let transformed = match &edge.transform {
            Some(code) => apply_transform(code, &value).await.unwrap_or(value),
            None => value,
        };
        store.set(edge.target_variable.clone(), transformed);
    }
}

/// Runs a DataFlow edge's transform as a short subprocess: the source value
/// goes in as JSON on stdin, the transformed value comes back as JSON on
/// stdout. Treated as a pure function with no access to the workflow's
/// variable store.
async fn apply_transform(code: &str, input: &Value) -> Option<Value> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut script = tempfile::NamedTempFile::new().ok()?;
    std::io::Write::write_all(&mut script, code.as_bytes()).ok()?;

    let mut child = tokio::process::Command::new("sh")
        .arg(script.path())
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .ok()?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(serde_json::to_string(input).ok()?.as_bytes()).await;
    }

    let output = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut buf).await;
        }
        let _ = child.wait().await;
        buf
    })
    .await
    .ok()?;

    serde_json::from_slice(&output).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AutoApprove, StderrNotifier};
    use crate::domain::{Predecessor, SourceContextSnapshot, StepPayload};
    use chrono::Utc;
    use std::collections::HashMap as Map;
    use tempfile::tempdir;

    fn step(id: &str, text: &str, preds: Vec<(&str, RequiredStatus)>) -> Step {
        Step {
            id: id.into(),
            name: id.into(),
            payload: StepPayload::Command { text: text.into() },
            predecessors: preds
                .into_iter()
                .map(|(p, s)| Predecessor {
                    step_id: p.into(),
                    required_status: s,
                })
                .collect(),
            required_variables: vec![],
            produced_variables: vec![],
            continue_on_failure: false,
            working_dir: None,
            env_overlay: Map::new(),
            timeout: None,
            retry_count: 0,
            estimated_risk: RiskLevel::Safe,
        }
    }

    fn plan_with(steps: Vec<Step>) -> Plan {
        let mut plan = Plan {
            id: "p".into(),
            name: "p".into(),
            description: None,
            source_request: "req".into(),
            steps: Map::new(),
            dependencies: Map::new(),
            data_flow: vec![],
            entry_points: vec![],
            initial_variables: Map::new(),
            created_at: Utc::now(),
            source_context: SourceContextSnapshot::default(),
        };
        for s in steps {
            plan.steps.insert(s.id.clone(), s);
        }
        plan.reindex_dependencies();
        plan
    }

    #[tokio::test]
    async fn runs_a_simple_two_step_plan_to_completion() {
        let plan = plan_with(vec![
            step("a", "echo hello", vec![]),
            step("b", "echo world", vec![("a", RequiredStatus::Succeeded)]),
        ]);

        let dir = tempdir().unwrap();
        let limits = ExecutionLimits::default();
        let trusted = TrustedCommands::default();
        let approval = AutoApprove;
        let notifier = StderrNotifier;
        let mut history = RecoveryHistory::default();

        let outcome = run_workflow(
            &plan,
            dir.path(),
            &mut history,
            EngineConfig {
                limits: &limits,
                trusted: &trusted,
                approval: &approval,
                notifier: &notifier,
                ai: None,
                dry_run: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.state.status, ExecutionStatus::Completed);
        assert_eq!(outcome.state.completed.len(), 2);
    }

    #[tokio::test]
    async fn failed_step_without_continue_on_failure_stops_the_workflow() {
        let plan = plan_with(vec![
            step("a", "sh -c 'exit 3'", vec![]),
            step("b", "echo never", vec![("a", RequiredStatus::Succeeded)]),
        ]);

        let dir = tempdir().unwrap();
        let limits = ExecutionLimits::default();
        let trusted = TrustedCommands::default();
        let approval = AutoApprove;
        let notifier = StderrNotifier;
        let mut history = RecoveryHistory::default();

        let outcome = run_workflow(
            &plan,
            dir.path(),
            &mut history,
            EngineConfig {
                limits: &limits,
                trusted: &trusted,
                approval: &approval,
                notifier: &notifier,
                ai: None,
                dry_run: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.state.status, ExecutionStatus::Failed);
        assert!(!outcome.state.completed.contains("b"));
    }

    #[tokio::test]
    async fn data_flow_edge_moves_extracted_variable() {
        let mut plan = plan_with(vec![step("a", "echo '{\"token\": \"abc\"}'", vec![])]);
        plan.steps.get_mut("a").unwrap().produced_variables.push("token".to_string());
        plan.data_flow.push(DataFlowEdge {
            source_step: "a".into(),
            source_variable: crate::domain::DataFlowSource::Variable("token".into()),
            target_variable: "copied_token".into(),
            transform: None,
        });

        let dir = tempdir().unwrap();
        let limits = ExecutionLimits::default();
        let trusted = TrustedCommands::default();
        let approval = AutoApprove;
        let notifier = StderrNotifier;
        let mut history = RecoveryHistory::default();

        let outcome = run_workflow(
            &plan,
            dir.path(),
            &mut history,
            EngineConfig {
                limits: &limits,
                trusted: &trusted,
                approval: &approval,
                notifier: &notifier,
                ai: None,
                dry_run: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.state.status, ExecutionStatus::Completed);
    }
}
