//! Dependency Graph: topological ordering, cycle detection, and
//! conflict-aware batch partitioning over a Plan's steps.
//!
//! Batches group independent, ready steps together; steps that write
//! overlapping file paths within the same batch are serialized against
//! each other rather than run concurrently.

use std::collections::{HashMap, HashSet};

use crate::domain::{Plan, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

/// Returns a topological ordering of `plan`'s steps, or the offending cycle
/// (as a list of step ids) if one exists.
pub fn topological_order(plan: &Plan) -> Result<Vec<String>, Vec<String>> {
    let mut state: HashMap<&str, VisitState> = HashMap::new();
    let mut order = Vec::new();
    let mut stack: Vec<String> = Vec::new();

    for id in plan.steps.keys() {
        if !state.contains_key(id.as_str()) {
            if let Err(cycle) = visit(plan, id, &mut state, &mut order, &mut stack) {
                return Err(cycle);
            }
        }
    }
    Ok(order)
}

fn visit<'a>(
    plan: &'a Plan,
    id: &'a str,
    state: &mut HashMap<&'a str, VisitState>,
    order: &mut Vec<String>,
    stack: &mut Vec<String>,
) -> Result<(), Vec<String>> {
    state.insert(id, VisitState::Visiting);
    stack.push(id.to_string());

    if let Some(step) = plan.steps.get(id) {
        for dep in step.predecessor_ids() {
            match state.get(dep) {
                Some(VisitState::Visiting) => {
                    let start = stack.iter().position(|s| s == dep).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(dep.to_string());
                    return Err(cycle);
                }
                Some(VisitState::Visited) => {}
                None => {
                    if plan.steps.contains_key(dep) {
                        visit(plan, dep, state, order, stack)?;
                    }
                }
            }
        }
    }

    stack.pop();
    state.insert(id, VisitState::Visited);
    order.push(id.to_string());
    Ok(())
}

/// Partitions `order` (a valid topological ordering) into batches of
/// mutually independent steps, honoring the resource-conflict predicate: a
/// batch never contains two steps that conflict.
pub fn compute_batches(plan: &Plan, order: &[String]) -> Vec<Vec<String>> {
    let mut placed_at: HashMap<&str, usize> = HashMap::new();
    let mut batches: Vec<Vec<String>> = Vec::new();

    for id in order {
        let step = match plan.steps.get(id) {
            Some(s) => s,
            None => continue,
        };

        let mut earliest = step
            .predecessor_ids()
            .filter_map(|dep| placed_at.get(dep))
            .map(|idx| idx + 1)
            .max()
            .unwrap_or(0);

        loop {
            if earliest >= batches.len() {
                batches.push(Vec::new());
            }
            let conflicts = batches[earliest].iter().any(|other_id| {
                plan.steps
                    .get(other_id)
                    .map(|other| conflicts(step, other))
                    .unwrap_or(false)
            });
            if conflicts {
                earliest += 1;
                continue;
            }
            batches[earliest].push(id.clone());
            placed_at.insert(id.as_str(), earliest);
            break;
        }
    }

    batches
}

/// Resource-conflict predicate: two command-like steps conflict when both
/// write the same path, one writes what the other reads, or they mutate the
/// same named resource. Two steps that only *read* the same path do not
/// conflict. When exactly one side has no inferable path, inference is
/// uncertain (it may touch files through a form this scan doesn't catch) and
/// the conservative default is to conflict; when neither side has any
/// inferable path, there is nothing to overlap on.
fn conflicts(a: &Step, b: &Step) -> bool {
    let text_a = step_text(a);
    let text_b = step_text(b);
    let (text_a, text_b) = match (text_a, text_b) {
        (Some(a), Some(b)) => (a, b),
        // At least one side isn't a command-like step with inferable text:
        // not a command-like conflict.
        _ => return false,
    };

    let (writes_a, reads_a) = infer_paths(text_a);
    let (writes_b, reads_b) = infer_paths(text_b);

    let any_a = !writes_a.is_empty() || !reads_a.is_empty();
    let any_b = !writes_b.is_empty() || !reads_b.is_empty();

    match (any_a, any_b) {
        (false, false) => false,
        (false, true) | (true, false) => true,
        (true, true) => {
            writes_a.iter().any(|p| writes_b.contains(p) || reads_b.contains(p))
                || reads_a.iter().any(|p| writes_b.contains(p))
        }
    }
}

fn step_text(step: &Step) -> Option<&str> {
    use crate::domain::StepPayload::*;
    match &step.payload {
        Command { text } | Tool { text } => Some(text.as_str()),
        Api { url, .. } => Some(url.as_str()),
        _ => None,
    }
}

/// Splits a command's path-like tokens into write targets and read targets.
/// A `>`/`>>` redirect target, and `rm`/`touch`/`mkdir` operands, are writes;
/// `cp`/`mv`'s last operand is its destination (write), the rest are reads;
/// everything else is a read.
fn infer_paths(text: &str) -> (HashSet<String>, HashSet<String>) {
    let tokens = shell_words::split(text).unwrap_or_default();
    let mut writes = HashSet::new();
    let mut reads = HashSet::new();
    if tokens.is_empty() {
        return (writes, reads);
    }

    let is_path = |tok: &str| tok.starts_with('/') || tok.starts_with("./") || tok.starts_with("../") || tok.starts_with("http");

    let mut operands: Vec<String> = Vec::new();
    let mut i = 1;
    while i < tokens.len() {
        let tok = tokens[i].as_str();
        if (tok == ">" || tok == ">>") && i + 1 < tokens.len() {
            if is_path(&tokens[i + 1]) {
                writes.insert(tokens[i + 1].clone());
            }
            i += 2;
            continue;
        }
        if is_path(tok) {
            operands.push(tok.to_string());
        }
        i += 1;
    }

    let cmd = tokens[0].rsplit('/').next().unwrap_or(&tokens[0]);
    match cmd {
        "rm" | "touch" | "mkdir" => writes.extend(operands),
        "cp" | "mv" => {
            if let Some((destination, sources)) = operands.split_last() {
                reads.extend(sources.iter().cloned());
                writes.insert(destination.clone());
            }
        }
        _ => reads.extend(operands),
    }

    (writes, reads)
}
