//! Command Runner: the single place that spawns subprocesses.
//!
//! Runs a command in its own process group (`setsid`-isolated), with
//! `kill_on_drop` as a backstop and concurrently-drained piped
//! stdout/stderr, behind a single `run` operation.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

use crate::domain::{ErrorKind, StepResult};
use crate::variables::VariableStore;

/// Bytes captured per stream before truncation.
const CAPTURE_LIMIT: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n...[truncated]";
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Characters whose presence in a command forces it through `sh -c` rather
/// than being argv-split and exec'd directly.
const SHELL_METACHARACTERS: &[char] = &['|', '>', '<', '&', ';', '`'];

fn needs_shell(command: &str) -> bool {
    command.contains("$(") || command.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}

#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub command: &'a str,
    pub working_dir: Option<&'a str>,
    pub env_overlay: &'a HashMap<String, String>,
    pub timeout: Duration,
    pub dry_run: bool,
}

pub struct CommandRunner;

impl CommandRunner {
    pub async fn run(step_id: &str, request: RunRequest<'_>) -> StepResult {
        if request.dry_run {
            return StepResult::ok(
                step_id,
                format!("[dry-run] would execute: {}", request.command),
                String::new(),
                Duration::from_millis(0),
            );
        }

        let mut cmd = match Self::build_command(request.command) {
            Ok(c) => c,
            Err(e) => return StepResult::failed(step_id, ErrorKind::Spawn, e, Duration::from_millis(0)),
        };

        if let Some(dir) = request.working_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in request.env_overlay {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // SAFETY: pre_exec runs in the forked child before exec; setsid()
        // is async-signal-safe and only affects the child's own process
        // group, isolating it so a timeout signal never reaches the runner.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return StepResult::failed(
                    step_id,
                    ErrorKind::Spawn,
                    format!("failed to spawn '{}': {e}", request.command),
                    started.elapsed(),
                )
            }
        };

        let pid = child.id().map(|raw| Pid::from_raw(raw as i32));

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move { capture_bounded(stdout_pipe.take()).await });
        let stderr_task = tokio::spawn(async move { capture_bounded(stderr_pipe.take()).await });

        let wait_result = tokio::time::timeout(request.timeout, child.wait()).await;

        match wait_result {
            Ok(Ok(status)) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let elapsed = started.elapsed();

                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return StepResult::failed(
                            step_id,
                            ErrorKind::Signalled,
                            format!("command '{}' was killed by signal {signal}", request.command),
                            elapsed,
                        );
                    }
                }

                match status.code() {
                    Some(0) => StepResult::ok(step_id, stdout, stderr, elapsed),
                    Some(code) => {
                        let mut result = StepResult::failed(
                            step_id,
                            ErrorKind::Exit,
                            format!("command '{}' exited with code {code}", request.command),
                            elapsed,
                        );
                        result.exit_code = Some(code);
                        result.stdout = stdout;
                        result.stderr = stderr;
                        result
                    }
                    None => StepResult::failed(step_id, ErrorKind::Exit, "process exited without a code", elapsed),
                }
            }
            Ok(Err(e)) => StepResult::failed(step_id, ErrorKind::Spawn, format!("wait failed: {e}"), started.elapsed()),
            Err(_) => {
                if let Some(pid) = pid {
                    // setsid() made this child its own process-group leader
                    // (pgid == pid); signalling -pid delivers to the whole
                    // group so descendants of an `sh -c` command die too.
                    let pgid = Pid::from_raw(-pid.as_raw());
                    let _ = kill(pgid, Signal::SIGTERM);
                    tokio::time::sleep(KILL_GRACE).await;
                    let _ = kill(pgid, Signal::SIGKILL);
                }
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                StepResult::failed(
                    step_id,
                    ErrorKind::Timeout,
                    format!("command '{}' timed out after {}ms", request.command, request.timeout.as_millis()),
                    started.elapsed(),
                )
            }
        }
    }

    fn build_command(command: &str) -> Result<TokioCommand, String> {
        if needs_shell(command) {
            let mut cmd = TokioCommand::new("sh");
            cmd.arg("-c").arg(command);
            Ok(cmd)
        } else {
            let words = shell_words::split(command).map_err(|e| format!("failed to parse command: {e}"))?;
            let (program, args) = words.split_first().ok_or_else(|| "empty command".to_string())?;
            let mut cmd = TokioCommand::new(program);
            cmd.args(args);
            Ok(cmd)
        }
    }

    /// Runs a completed command's stdout through the produced-variables
    /// extraction precedence (JSON object, then `name=value` lines).
    pub fn extract_produced(names: &[String], result: &StepResult) -> HashMap<String, serde_json::Value> {
        VariableStore::extract_from_stdout(names, &result.stdout)
    }
}

async fn capture_bounded(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < CAPTURE_LIMIT {
                    let remaining = CAPTURE_LIMIT - buf.len();
                    buf.extend_from_slice(&chunk[..n.min(remaining)]);
                }
            }
            Err(_) => break,
        }
    }
    let truncated = buf.len() >= CAPTURE_LIMIT;
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req<'a>(command: &'a str, env: &'a HashMap<String, String>) -> RunRequest<'a> {
        RunRequest {
            command,
            working_dir: None,
            env_overlay: env,
            timeout: Duration::from_secs(5),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn runs_simple_command_successfully() {
        let env = HashMap::new();
        let result = CommandRunner::run("s1", req("echo hello", &env)).await;
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn reports_exit_code_failure() {
        let env = HashMap::new();
        let result = CommandRunner::run("s1", req("sh -c 'exit 7'", &env)).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(7));
    }

    #[tokio::test]
    async fn spawn_failure_for_missing_binary() {
        let env = HashMap::new();
        let result = CommandRunner::run("s1", req("definitely-not-a-real-binary-xyz", &env)).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Spawn));
    }

    #[tokio::test]
    async fn times_out_long_running_command() {
        let env = HashMap::new();
        let mut request = req("sleep 5", &env);
        request.timeout = Duration::from_millis(100);
        let result = CommandRunner::run("s1", request).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn dry_run_short_circuits_without_spawning() {
        let env = HashMap::new();
        let mut dry = req("rm -rf /tmp/does-not-matter", &env);
        dry.dry_run = true;
        let result = CommandRunner::run("s1", dry).await;
        assert!(result.success);
        assert!(result.stdout.contains("dry-run"));
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_process_group_including_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let env = HashMap::new();
        let command = format!("sleep 10 & echo $! > {}; wait", pidfile.display());
        let mut request = req(&command, &env);
        request.timeout = Duration::from_millis(100);
        let result = CommandRunner::run("s1", request).await;
        assert!(!result.success);

        let child_pid: i32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
        let alive = kill(Pid::from_raw(child_pid), None).is_ok();
        assert!(!alive, "background child should be killed along with the rest of the process group");
    }

    #[tokio::test]
    async fn shell_metacharacters_trigger_shell_invocation() {
        let env = HashMap::new();
        let result = CommandRunner::run("s1", req("echo one | tr a-z A-Z", &env)).await;
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "ONE");
    }
}
