//! Step Dispatcher: routes a Step to its kind-specific handler. Every
//! kind-specific string field is substituted against the Variable Store
//! before dispatch; the dispatcher never decides whether a step runs
//! (that's the engine and safety classifier's job).

pub mod predicate;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::collaborators::{NotificationCollaborator, Severity};
use crate::command::{CommandRunner, RunRequest};
use crate::domain::{DataFlowSource, ErrorKind, Step, StepPayload, StepResult};
use crate::variables::VariableStore;

/// Hard caps on a custom-code step's subprocess.
const CUSTOM_CODE_TIMEOUT: Duration = Duration::from_secs(30);
const CUSTOM_CODE_OUTPUT_LIMIT: usize = 1024 * 1024;

/// A dispatched `parallel` step's children, for the engine to execute.
/// The dispatcher itself never recurses into the engine; it hands back the
/// child ids so the caller can schedule them through its own batch logic.
pub struct ParallelChildren(pub Vec<String>);

pub enum Dispatched {
    Result(StepResult),
    Parallel(ParallelChildren),
}

/// Dispatches `step` by kind, substituting every kind-specific string field
/// against `store` first. `notifier` backs the `notification` kind;
/// `parallel` steps are handed back to the caller rather than executed here.
pub async fn dispatch(step: &Step, store: &VariableStore, notifier: &dyn NotificationCollaborator) -> Dispatched {
    let timeout = step.timeout.unwrap_or(Duration::from_secs(30));

    match &step.payload {
        StepPayload::Command { text } | StepPayload::Tool { text } => {
            let substituted = store.substitute(text);
            let result = CommandRunner::run(
                &step.id,
                RunRequest {
                    command: &substituted,
                    working_dir: step.working_dir.as_deref(),
                    env_overlay: &step.env_overlay,
                    timeout,
                    dry_run: false,
                },
            )
            .await;
            Dispatched::Result(with_extracted(result, &step.produced_variables))
        }
        StepPayload::Api { url, method, headers, body } => {
            Dispatched::Result(dispatch_api(step, url, method, headers, body.as_ref(), store, timeout).await)
        }
        StepPayload::Decision { predicate } => Dispatched::Result(dispatch_predicate(&step.id, predicate, store).await),
        StepPayload::Validation { predicate } => Dispatched::Result(dispatch_validation(&step.id, predicate, store).await),
        StepPayload::Wait { predicate, duration_ms } => {
            Dispatched::Result(dispatch_wait(&step.id, predicate.as_deref(), *duration_ms, store, timeout).await)
        }
        StepPayload::Parallel { children } => Dispatched::Parallel(ParallelChildren(children.clone())),
        StepPayload::CustomCode { code } => Dispatched::Result(dispatch_custom_code(&step.id, code, store).await),
        StepPayload::Notification { message } => {
            let substituted = store.substitute(message);
            notifier.notify(&step.name, &substituted, Severity::Info).await;
            Dispatched::Result(StepResult::ok(&step.id, substituted, String::new(), Duration::from_millis(0)))
        }
    }
}

fn with_extracted(mut result: StepResult, produced: &[String]) -> StepResult {
    if result.success && !produced.is_empty() {
        result.extracted_variables = CommandRunner::extract_produced(produced, &result);
    }
    result
}

async fn dispatch_api(
    step: &Step,
    url: &str,
    method: &str,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
    store: &VariableStore,
    timeout: Duration,
) -> StepResult {
    let url = store.substitute(url);
    let method = store.substitute(method);
    let started = Instant::now();
    let mut span = crate::telemetry::instrumentation::HttpSpanContext::new(&method, &url, &step.id).with_name(&step.name);

    let client = reqwest::Client::new();
    let mut request = match method.to_ascii_uppercase().as_str() {
        "GET" => client.get(&url),
        "POST" => client.post(&url),
        "PUT" => client.put(&url),
        "PATCH" => client.patch(&url),
        "DELETE" => client.delete(&url),
        other => return StepResult::failed(&step.id, ErrorKind::Spawn, format!("unsupported HTTP method '{other}'"), started.elapsed()),
    };

    for (key, value) in headers {
        request = request.header(key, store.substitute(value));
    }
    if let Some(b) = body {
        request = request.json(b);
    }

    let response = match tokio::time::timeout(timeout, request.send()).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return StepResult::failed(&step.id, ErrorKind::Spawn, format!("request failed: {e}"), started.elapsed()),
        Err(_) => return StepResult::failed(&step.id, ErrorKind::Timeout, format!("request to '{url}' timed out"), started.elapsed()),
    };

    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let elapsed = started.elapsed();

    span.finish(status.as_u16());
    tracing::info!(target: "dispatcher", attrs = ?span.attributes(), "api step completed");

    if !status.is_success() {
        let mut result = StepResult::failed(&step.id, ErrorKind::Exit, format!("request returned {status}"), elapsed);
        result.stdout = body_text;
        result.exit_code = Some(status.as_u16() as i32);
        return result;
    }

    let mut result = StepResult::ok(&step.id, body_text.clone(), String::new(), elapsed);
    if !step.produced_variables.is_empty() {
        if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
            result.extracted_variables = VariableStore::extract_from_json(&step.produced_variables, &json);
        }
    }
    result
}

/// `decision` steps gate control flow: a false predicate fails the step
/// (so `continue_on_failure`/predecessor-status rules route around it) just
/// like a malformed one, and neither distinguishes itself in the result.
async fn dispatch_predicate(step_id: &str, predicate_text: &str, store: &VariableStore) -> StepResult {
    let started = Instant::now();
    match predicate::eval(predicate_text, store).await {
        Ok(true) => StepResult::ok(step_id, "true".to_string(), String::new(), started.elapsed()),
        Ok(false) => StepResult::failed(step_id, ErrorKind::Exit, "predicate evaluated to false", started.elapsed()),
        Err(e) => StepResult::failed(step_id, ErrorKind::MalformedPredicate, e.to_string(), started.elapsed()),
    }
}

/// `validation` steps distinguish success-of-evaluation from truthiness of
/// the predicate: a well-formed predicate always succeeds, carrying its
/// true/false verdict in `transformed_output`; only a malformed predicate
/// fails the step.
async fn dispatch_validation(step_id: &str, predicate_text: &str, store: &VariableStore) -> StepResult {
    let started = Instant::now();
    match predicate::eval(predicate_text, store).await {
        Ok(truth) => {
            let mut result = StepResult::ok(step_id, truth.to_string(), String::new(), started.elapsed());
            result.transformed_output = Some(Value::Bool(truth));
            result
        }
        Err(e) => StepResult::failed(step_id, ErrorKind::MalformedPredicate, e.to_string(), started.elapsed()),
    }
}

async fn dispatch_wait(
    step_id: &str,
    predicate_text: Option<&str>,
    duration_ms: Option<u64>,
    store: &VariableStore,
    timeout: Duration,
) -> StepResult {
    let started = Instant::now();

    let Some(predicate_text) = predicate_text else {
        let duration = Duration::from_millis(duration_ms.unwrap_or(0));
        tokio::time::sleep(duration).await;
        return StepResult::ok(step_id, format!("waited {}ms", duration.as_millis()), String::new(), started.elapsed());
    };

    let poll_interval = Duration::from_secs(5);
    loop {
        match predicate::eval(predicate_text, store).await {
            Ok(true) => return StepResult::ok(step_id, "condition met".to_string(), String::new(), started.elapsed()),
            Ok(false) => {}
            Err(e) => return StepResult::failed(step_id, ErrorKind::MalformedPredicate, e.to_string(), started.elapsed()),
        }
        if started.elapsed() >= timeout {
            return StepResult::failed(step_id, ErrorKind::Timeout, "wait predicate never became true", started.elapsed());
        }
        tokio::time::sleep(poll_interval.min(timeout.saturating_sub(started.elapsed()))).await;
    }
}

/// Runs a custom-code step's body in a short-lived subprocess. The body is
/// written to a temp script, invoked via `sh`, with the Variable Store
/// snapshot piped in as JSON on stdin and the result read back from stdout.
/// Capped at 30s/1MiB; HIGH risk by default is enforced by the safety
/// classifier, not here.
async fn dispatch_custom_code(step_id: &str, code: &str, store: &VariableStore) -> StepResult {
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let started = Instant::now();

    let mut script = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(e) => return StepResult::failed(step_id, ErrorKind::Spawn, format!("failed to create temp script: {e}"), started.elapsed()),
    };
    if let Err(e) = script.write_all(code.as_bytes()) {
        return StepResult::failed(step_id, ErrorKind::Spawn, format!("failed to write temp script: {e}"), started.elapsed());
    }

    let stdin_payload = serde_json::to_vec(&store.snapshot()).unwrap_or_default();

    let mut child = match tokio::process::Command::new("sh")
        .arg(script.path())
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return StepResult::failed(step_id, ErrorKind::Spawn, format!("failed to spawn custom-code step: {e}"), started.elapsed()),
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&stdin_payload).await;
    }

    let wait = tokio::time::timeout(CUSTOM_CODE_TIMEOUT, async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(out) = child.stdout.take() {
            let mut limited = out.take(CUSTOM_CODE_OUTPUT_LIMIT as u64);
            let _ = limited.read_to_end(&mut stdout_buf).await;
        }
        if let Some(err) = child.stderr.take() {
            let mut limited = err.take(CUSTOM_CODE_OUTPUT_LIMIT as u64);
            let _ = limited.read_to_end(&mut stderr_buf).await;
        }
        let status = child.wait().await;
        (status, stdout_buf, stderr_buf)
    })
    .await;

    match wait {
        Ok((Ok(status), stdout_buf, stderr_buf)) => {
            let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
            let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();
            if status.success() {
                StepResult::ok(step_id, stdout, stderr, started.elapsed())
            } else {
                let mut result = StepResult::failed(step_id, ErrorKind::Exit, "custom-code step exited non-zero", started.elapsed());
                result.stdout = stdout;
                result.stderr = stderr;
                result.exit_code = status.code();
                result
            }
        }
        Ok((Err(e), _, _)) => StepResult::failed(step_id, ErrorKind::Spawn, format!("wait failed: {e}"), started.elapsed()),
        Err(_) => {
            let _ = child.kill().await;
            StepResult::failed(step_id, ErrorKind::Timeout, "custom-code step timed out after 30s", started.elapsed())
        }
    }
}

/// Resolves a DataFlow edge's source value from a completed step's result.
pub fn resolve_data_flow_source(source: &DataFlowSource, result: &StepResult) -> Option<Value> {
    match source {
        DataFlowSource::Variable(name) => result.extracted_variables.get(name).cloned(),
        DataFlowSource::Stdout => Some(Value::String(result.stdout.clone())),
        DataFlowSource::Stderr => Some(Value::String(result.stderr.clone())),
        DataFlowSource::ReturnCode => result.exit_code.map(|c| Value::Number(c.into())),
        DataFlowSource::JsonPath(path) => {
            let parsed: Value = serde_json::from_str(result.stdout.trim()).ok()?;
            path.split('.').filter(|s| !s.is_empty()).try_fold(parsed, |acc, key| acc.get(key).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StderrNotifier;
    use crate::domain::{Predecessor, RequiredStatus};
    use std::collections::HashMap as Map;

    fn sample_step(payload: StepPayload) -> Step {
        Step {
            id: "s1".into(),
            name: "s1".into(),
            payload,
            predecessors: Vec::<Predecessor>::new(),
            required_variables: vec![],
            produced_variables: vec![],
            continue_on_failure: false,
            working_dir: None,
            env_overlay: Map::new(),
            timeout: Some(Duration::from_secs(5)),
            retry_count: 0,
            estimated_risk: crate::safety::RiskLevel::Safe,
        }
    }

    fn unused(_r: RequiredStatus) {}

    #[tokio::test]
    async fn dispatches_command_with_substitution() {
        let mut store = VariableStore::new();
        store.set("name", Value::String("world".into()));
        let step = sample_step(StepPayload::Command {
            text: "echo hello ${name}".into(),
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Result(r) => assert_eq!(r.stdout.trim(), "hello world"),
            _ => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn dispatches_decision_predicate() {
        let mut store = VariableStore::new();
        store.set("status", Value::String("ready".into()));
        let step = sample_step(StepPayload::Decision {
            predicate: "${status} == ready".into(),
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Result(r) => assert!(r.success),
            _ => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn validation_step_succeeds_on_a_false_predicate_but_carries_the_verdict() {
        let mut store = VariableStore::new();
        store.set("status", Value::String("not-ready".into()));
        let step = sample_step(StepPayload::Validation {
            predicate: "${status} == ready".into(),
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Result(r) => {
                assert!(r.success, "a false predicate is a successful evaluation");
                assert_eq!(r.transformed_output, Some(Value::Bool(false)));
            }
            _ => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn validation_step_fails_on_a_malformed_predicate() {
        let store = VariableStore::new();
        let step = sample_step(StepPayload::Validation {
            predicate: "not a valid predicate (((".into(),
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Result(r) => assert!(!r.success),
            _ => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn parallel_hands_back_children() {
        let store = VariableStore::new();
        let step = sample_step(StepPayload::Parallel {
            children: vec!["a".into(), "b".into()],
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Parallel(children) => assert_eq!(children.0, vec!["a".to_string(), "b".to_string()]),
            _ => panic!("expected parallel children"),
        }
    }

    #[tokio::test]
    async fn dispatches_wait_with_fixed_duration() {
        let store = VariableStore::new();
        let step = sample_step(StepPayload::Wait {
            predicate: None,
            duration_ms: Some(10),
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Result(r) => assert!(r.success),
            _ => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn dispatches_custom_code() {
        let store = VariableStore::new();
        let step = sample_step(StepPayload::CustomCode {
            code: "echo custom-ran".into(),
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Result(r) => assert!(r.success && r.stdout.contains("custom-ran")),
            _ => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn dispatches_notification() {
        let store = VariableStore::new();
        let step = sample_step(StepPayload::Notification {
            message: "hello".into(),
        });
        let notifier = StderrNotifier;
        match dispatch(&step, &store, &notifier).await {
            Dispatched::Result(r) => assert!(r.success),
            _ => panic!("expected a result"),
        }
        unused(RequiredStatus::Succeeded);
    }

    #[test]
    fn resolves_return_code_source() {
        let result = StepResult::ok("s1", "out".into(), String::new(), Duration::from_millis(1));
        let value = resolve_data_flow_source(&DataFlowSource::ReturnCode, &result);
        assert_eq!(value, Some(Value::Number(0.into())));
    }

    #[test]
    fn resolves_json_path_source() {
        let result = StepResult::ok("s1", r#"{"a": {"b": 7}}"#.into(), String::new(), Duration::from_millis(1));
        let value = resolve_data_flow_source(&DataFlowSource::JsonPath("a.b".into()), &result);
        assert_eq!(value, Some(Value::Number(7.into())));
    }
}
