//! Plan Generator: turns a natural-language request into a validated Plan
//! via the AI collaborator, with schema repair and a fallback plan when the
//! AI's response can't be salvaged. Never executes a step itself.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::collaborators::AiCollaborator;
use crate::domain::{Plan, SourceContextSnapshot, Step};

/// Pattern-matched tool detection over the request text, by keyword plus
/// any tool the project type implies. Falls back to an AI call (not
/// performed here; the caller decides whether to ask the AI when this
/// returns empty).
pub fn detect_tools(request: &str, project_type: Option<&str>) -> Vec<String> {
    const TOOL_HINTS: &[(&str, &[&str])] = &[
        ("git", &["git", "commit", "branch", "clone", "merge"]),
        ("docker", &["docker", "container", "image"]),
        ("npm", &["npm", "node", "package.json"]),
        ("cargo", &["cargo", "rust"]),
        ("pip", &["pip", "python"]),
        ("curl", &["curl", "http", "request", "api"]),
    ];
    let lower = request.to_ascii_lowercase();
    let mut tools: Vec<String> = TOOL_HINTS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(tool, _)| tool.to_string())
        .collect();

    match project_type {
        Some("node") if !tools.contains(&"npm".to_string()) => tools.push("npm".to_string()),
        Some("rust") if !tools.contains(&"cargo".to_string()) => tools.push("cargo".to_string()),
        Some("python") if !tools.contains(&"pip".to_string()) => tools.push("pip".to_string()),
        _ => {}
    }
    tools
}

/// Assembles the prompt sent to the AI collaborator: request, context
/// snapshot, and a one-line capability blurb per detected tool.
pub fn build_prompt(request: &str, context: &SourceContextSnapshot, tool_blurbs: &[(String, String)]) -> String {
    let mut prompt = String::new();
    prompt.push_str("Generate an execution plan as JSON for this request:\n");
    prompt.push_str(request);
    prompt.push_str("\n\nContext:\n");
    prompt.push_str(&format!("cwd: {}\n", context.cwd));
    if let Some(root) = &context.project_root {
        prompt.push_str(&format!("project_root: {root}\n"));
    }
    if let Some(kind) = &context.project_type {
        prompt.push_str(&format!("project_type: {kind}\n"));
    }
    if !tool_blurbs.is_empty() {
        prompt.push_str("\nAvailable tools:\n");
        for (tool, blurb) in tool_blurbs {
            prompt.push_str(&format!("- {tool}: {blurb}\n"));
        }
    }
    prompt
}

/// Queries each tool's `--version` (or `--help` on failure) to build a
/// one-line capability blurb. Results should be cached by the caller
/// across generator invocations.
pub async fn probe_tool_capability(tool: &str) -> String {
    for flag in ["--version", "--help"] {
        if let Ok(output) = tokio::process::Command::new(tool).arg(flag).output().await {
            let text = String::from_utf8_lossy(&output.stdout);
            if let Some(line) = text.lines().next() {
                if !line.trim().is_empty() {
                    return line.trim().to_string();
                }
            }
        }
    }
    format!("{tool} (capability unknown)")
}

/// Calls the AI collaborator and parses its response as a Plan: repairing
/// dangling edges/cycles/duplicate ids on failure, re-validating once, and
/// falling back to a single-step plan on a second failure.
pub async fn generate_plan(ai: &dyn AiCollaborator, request: &str, context: SourceContextSnapshot) -> Plan {
    let tools = detect_tools(request, context.project_type.as_deref());
    let mut blurbs = Vec::with_capacity(tools.len());
    for tool in &tools {
        blurbs.push((tool.clone(), probe_tool_capability(tool).await));
    }
    let prompt = build_prompt(&request, &context, &blurbs);

    let raw = match ai.generate(&prompt, 2048, 0.2).await {
        Ok(text) => text,
        Err(_) => return fallback_plan(request, context),
    };

    match serde_json::from_str::<Plan>(&raw) {
        Ok(plan) if crate::validation::validate_plan(&plan).is_ok() => decorate_produced_variables(plan),
        Ok(plan) => {
            let repaired = repair_plan(plan);
            if crate::validation::validate_plan(&repaired).is_ok() {
                decorate_produced_variables(repaired)
            } else {
                fallback_plan(request, context)
            }
        }
        Err(_) => fallback_plan(request, context),
    }
}

/// Drops dangling predecessor/data-flow references, breaks cycles by
/// removing the last edge on the cycle, and deduplicates step ids keeping
/// the first occurrence.
pub fn repair_plan(mut plan: Plan) -> Plan {
    let known_ids: HashSet<String> = plan.steps.keys().cloned().collect();

    for step in plan.steps.values_mut() {
        step.predecessors.retain(|p| known_ids.contains(&p.step_id));
    }
    plan.data_flow.retain(|edge| known_ids.contains(&edge.source_step));
    plan.entry_points.retain(|id| known_ids.contains(id));
    if plan.entry_points.is_empty() {
        plan.entry_points = plan
            .steps
            .values()
            .filter(|s| s.predecessors.is_empty())
            .map(|s| s.id.clone())
            .collect();
    }

    while let Err(cycle) = crate::dag::topological_order(&plan) {
        if cycle.len() < 2 {
            break;
        }
        let last = &cycle[cycle.len() - 1];
        let second_last = &cycle[cycle.len() - 2];
        if let Some(step) = plan.steps.get_mut(second_last) {
            step.predecessors.retain(|p| &p.step_id != last);
        } else {
            break;
        }
    }

    plan.reindex_dependencies();
    plan
}

fn fallback_plan(request: &str, context: SourceContextSnapshot) -> Plan {
    let step_id = "fallback".to_string();
    let mut steps = HashMap::new();
    steps.insert(
        step_id.clone(),
        Step {
            id: step_id.clone(),
            name: "fallback".to_string(),
            payload: crate::domain::StepPayload::Command {
                text: format!("echo 'Failed to generate plan for: {request}'"),
            },
            predecessors: vec![],
            required_variables: vec![],
            produced_variables: vec![],
            continue_on_failure: false,
            working_dir: None,
            env_overlay: HashMap::new(),
            timeout: None,
            retry_count: 0,
            estimated_risk: crate::safety::RiskLevel::Safe,
        },
    );

    Plan {
        id: Uuid::new_v4().to_string(),
        name: "fallback-plan".to_string(),
        description: Some("generation failed; single fallback step".to_string()),
        source_request: request.to_string(),
        steps,
        dependencies: HashMap::new(),
        data_flow: vec![],
        entry_points: vec![step_id],
        initial_variables: HashMap::new(),
        created_at: Utc::now(),
        source_context: context,
    }
}

static PIPELINE_PRODUCER: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"jq\s+-r\s+\.([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Infers produced-variable names from command text by pipeline pattern,
/// e.g. `jq -r .foo` produces `foo`.
fn decorate_produced_variables(mut plan: Plan) -> Plan {
    for step in plan.steps.values_mut() {
        if let crate::domain::StepPayload::Command { text } | crate::domain::StepPayload::Tool { text } = &step.payload {
            for cap in PIPELINE_PRODUCER.captures_iter(text) {
                let name = cap[1].to_string();
                if !step.produced_variables.contains(&name) {
                    step.produced_variables.push(name);
                }
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Predecessor, RequiredStatus};

    #[test]
    fn detects_tools_from_keywords() {
        let tools = detect_tools("please commit my git changes", None);
        assert!(tools.contains(&"git".to_string()));
    }

    #[test]
    fn project_type_adds_implied_tool() {
        let tools = detect_tools("run the tests", Some("rust"));
        assert!(tools.contains(&"cargo".to_string()));
    }

    #[test]
    fn repair_drops_dangling_predecessor() {
        let mut plan = fallback_plan("x", SourceContextSnapshot::default());
        plan.steps.get_mut("fallback").unwrap().predecessors.push(Predecessor {
            step_id: "ghost".into(),
            required_status: RequiredStatus::Succeeded,
        });
        let repaired = repair_plan(plan);
        assert!(crate::validation::validate_plan(&repaired).is_ok());
    }

    #[test]
    fn decorate_infers_jq_produced_variable() {
        let mut plan = fallback_plan("x", SourceContextSnapshot::default());
        plan.steps.get_mut("fallback").unwrap().payload = crate::domain::StepPayload::Command {
            text: "curl example.com | jq -r .token".to_string(),
        };
        let decorated = decorate_produced_variables(plan);
        assert!(decorated.steps["fallback"].produced_variables.contains(&"token".to_string()));
    }
}
