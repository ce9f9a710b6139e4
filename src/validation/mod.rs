//! Plan validation: checks structural invariants before a Plan is allowed
//! to execute (non-empty, known predecessors/entry points/parallel
//! children, no cycles, and every data-flow edge's source and target
//! resolvable within the plan), collecting every violation rather than
//! bailing on the first one found.

use thiserror::Error;

use crate::dag;
use crate::domain::Plan;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("plan has no steps")]
    EmptyPlan,

    #[error("step '{step_id}' has an empty id")]
    EmptyStepId { step_id: String },

    #[error("step '{step_id}' references unknown predecessor '{dep}'")]
    UnknownPredecessor { step_id: String, dep: String },

    #[error("entry point '{entry_point}' does not reference a step in the plan")]
    UnknownEntryPoint { entry_point: String },

    #[error("data-flow edge from '{source_step}' references unknown source step")]
    UnknownDataFlowSource { source_step: String },

    #[error("data-flow edge targets unknown step via predecessor chain: variable '{target_variable}'")]
    UnreachableDataFlowTarget { target_variable: String },

    #[error("circular dependency detected: {cycle:?}")]
    CircularDependency { cycle: Vec<String> },

    #[error("step '{step_id}' is a parallel step referencing unknown child '{child}'")]
    UnknownParallelChild { step_id: String, child: String },
}

pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Every step reachable forward from `start` via the predecessor chain
/// (i.e. steps that run after `start`, directly or transitively).
fn successors_of(plan: &Plan, start: &str) -> std::collections::HashSet<String> {
    let mut reachable = std::collections::HashSet::new();
    let mut frontier = vec![start.to_string()];
    while let Some(id) = frontier.pop() {
        for (candidate_id, step) in &plan.steps {
            if step.predecessor_ids().any(|dep| dep == id) && reachable.insert(candidate_id.clone()) {
                frontier.push(candidate_id.clone());
            }
        }
    }
    reachable
}

pub fn validate_plan(plan: &Plan) -> ValidationResult {
    let mut errors = Vec::new();

    if plan.steps.is_empty() {
        errors.push(ValidationError::EmptyPlan);
    }

    for (id, step) in &plan.steps {
        if id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId { step_id: id.clone() });
        }
        for dep in step.predecessor_ids() {
            if !plan.steps.contains_key(dep) {
                errors.push(ValidationError::UnknownPredecessor {
                    step_id: id.clone(),
                    dep: dep.to_string(),
                });
            }
        }
        if let crate::domain::StepPayload::Parallel { children } = &step.payload {
            for child in children {
                if !plan.steps.contains_key(child) {
                    errors.push(ValidationError::UnknownParallelChild {
                        step_id: id.clone(),
                        child: child.clone(),
                    });
                }
            }
        }
    }

    for entry_point in &plan.entry_points {
        if !plan.steps.contains_key(entry_point) {
            errors.push(ValidationError::UnknownEntryPoint {
                entry_point: entry_point.clone(),
            });
        }
    }

    for edge in &plan.data_flow {
        if !plan.steps.contains_key(&edge.source_step) {
            errors.push(ValidationError::UnknownDataFlowSource {
                source_step: edge.source_step.clone(),
            });
            continue;
        }
        let reachable = successors_of(plan, &edge.source_step);
        let consumed = reachable.iter().any(|id| {
            plan.steps
                .get(id)
                .is_some_and(|step| step.required_variables.iter().any(|v| v == &edge.target_variable))
        });
        if !consumed {
            errors.push(ValidationError::UnreachableDataFlowTarget {
                target_variable: edge.target_variable.clone(),
            });
        }
    }

    if errors.is_empty() {
        if let Err(cycle) = dag::topological_order(plan) {
            errors.push(ValidationError::CircularDependency { cycle });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Predecessor, RequiredStatus, SourceContextSnapshot, Step, StepPayload};
    use crate::safety::RiskLevel;
    use chrono::Utc;
    use std::collections::HashMap;

    fn base_plan() -> Plan {
        Plan {
            id: "p".into(),
            name: "p".into(),
            description: None,
            source_request: "req".into(),
            steps: HashMap::new(),
            dependencies: HashMap::new(),
            data_flow: vec![],
            entry_points: vec![],
            initial_variables: HashMap::new(),
            created_at: Utc::now(),
            source_context: SourceContextSnapshot::default(),
        }
    }

    fn step(id: &str, preds: Vec<&str>) -> Step {
        Step {
            id: id.into(),
            name: id.into(),
            payload: StepPayload::Command { text: "echo hi".into() },
            predecessors: preds
                .into_iter()
                .map(|p| Predecessor {
                    step_id: p.into(),
                    required_status: RequiredStatus::Succeeded,
                })
                .collect(),
            required_variables: vec![],
            produced_variables: vec![],
            continue_on_failure: false,
            working_dir: None,
            env_overlay: HashMap::new(),
            timeout: None,
            retry_count: 0,
            estimated_risk: RiskLevel::Safe,
        }
    }

    #[test]
    fn rejects_empty_plan() {
        let plan = base_plan();
        let errors = validate_plan(&plan).unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyPlan));
    }

    #[test]
    fn rejects_unknown_predecessor() {
        let mut plan = base_plan();
        let s = step("a", vec!["ghost"]);
        plan.steps.insert("a".into(), s);
        let errors = validate_plan(&plan).unwrap_err();
        assert!(matches!(errors[0], ValidationError::UnknownPredecessor { .. }));
    }

    #[test]
    fn rejects_unknown_entry_point() {
        let mut plan = base_plan();
        plan.steps.insert("a".into(), step("a", vec![]));
        plan.entry_points.push("ghost".into());
        let errors = validate_plan(&plan).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownEntryPoint { .. })));
    }

    #[test]
    fn rejects_cycle() {
        let mut plan = base_plan();
        plan.steps.insert("a".into(), step("a", vec!["b"]));
        plan.steps.insert("b".into(), step("b", vec!["a"]));
        let errors = validate_plan(&plan).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::CircularDependency { .. })));
    }

    #[test]
    fn accepts_well_formed_plan() {
        let mut plan = base_plan();
        plan.steps.insert("a".into(), step("a", vec![]));
        plan.steps.insert("b".into(), step("b", vec!["a"]));
        plan.entry_points.push("a".into());
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn rejects_data_flow_edge_with_no_downstream_consumer() {
        use crate::domain::{DataFlowEdge, DataFlowSource};

        let mut plan = base_plan();
        plan.steps.insert("a".into(), step("a", vec![]));
        plan.steps.insert("b".into(), step("b", vec!["a"]));
        plan.data_flow.push(DataFlowEdge {
            source_step: "a".into(),
            source_variable: DataFlowSource::Stdout,
            target_variable: "never_read".into(),
            transform: None,
        });
        let errors = validate_plan(&plan).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnreachableDataFlowTarget { .. })));
    }

    #[test]
    fn accepts_data_flow_edge_consumed_by_a_reachable_successor() {
        use crate::domain::{DataFlowEdge, DataFlowSource};

        let mut plan = base_plan();
        plan.steps.insert("a".into(), step("a", vec![]));
        let mut b = step("b", vec!["a"]);
        b.required_variables.push("result".into());
        plan.steps.insert("b".into(), b);
        plan.data_flow.push(DataFlowEdge {
            source_step: "a".into(),
            source_variable: DataFlowSource::Stdout,
            target_variable: "result".into(),
            transform: None,
        });
        assert!(validate_plan(&plan).is_ok());
    }
}
