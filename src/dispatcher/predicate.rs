//! Predicate grammar for decision/validation/wait steps.
//!
//! Unlike the generic `${name}`/`$name` substitution the dispatcher applies
//! to other step kinds, predicate text keeps its `${var}` tokens intact
//! through parsing so each grammar form can resolve its own operands
//! against the Variable Store, rather than collapsing to a plain string
//! compare before the grammar is even recognized.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::command::{CommandRunner, RunRequest};
use crate::variables::VariableStore;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed predicate: '{0}'")]
pub struct MalformedPredicate(pub String);

static BOOL_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(true|false|yes|no|1|0)$").unwrap());
static EQUALITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\$\{([A-Za-z0-9_.:-]+)\}\s*(==|!=)\s*(.+)$").unwrap());
static SUBSTRING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^'([^']*)'\s+in\s+\$\{([A-Za-z0-9_.:-]+)\}$").unwrap());
static FILE_EXISTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^file exists\s+(.+)$").unwrap());
static COMMAND_SUCCEEDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^command\s+(.+?)\s+succeeds$").unwrap());

fn var_string(store: &VariableStore, name: &str) -> String {
    match store.get(name) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Evaluates `predicate` against `store`, running a subprocess for the
/// `command CMD succeeds` form. Returns `MalformedPredicate` for any text
/// not matching one of the five recognized forms (bare boolean, equality,
/// substring, file-exists, command-succeeds).
pub async fn eval(predicate: &str, store: &VariableStore) -> Result<bool, MalformedPredicate> {
    let trimmed = predicate.trim();

    if BOOL_TOKEN.is_match(trimmed) {
        let lower = trimmed.to_ascii_lowercase();
        return Ok(matches!(lower.as_str(), "true" | "yes" | "1"));
    }

    if let Some(caps) = EQUALITY.captures(trimmed) {
        let name = &caps[1];
        let op = &caps[2];
        let literal = store.substitute(caps[3].trim());
        let actual = var_string(store, name);
        return Ok(if op == "==" { actual == literal } else { actual != literal });
    }

    if let Some(caps) = SUBSTRING.captures(trimmed) {
        let needle = &caps[1];
        let name = &caps[2];
        let haystack = var_string(store, name);
        return Ok(haystack.contains(needle));
    }

    if let Some(caps) = FILE_EXISTS.captures(trimmed) {
        let path = store.substitute(caps[1].trim());
        return Ok(std::path::Path::new(&path).exists());
    }

    if let Some(caps) = COMMAND_SUCCEEDS.captures(trimmed) {
        let command = store.substitute(caps[1].trim());
        let env = HashMap::new();
        let result = CommandRunner::run(
            "predicate-command",
            RunRequest {
                command: &command,
                working_dir: None,
                env_overlay: &env,
                timeout: Duration::from_secs(30),
                dry_run: false,
            },
        )
        .await;
        return Ok(result.success);
    }

    Err(MalformedPredicate(predicate.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn evaluates_bare_boolean_tokens() {
        let store = VariableStore::new();
        assert_eq!(eval("true", &store).await.unwrap(), true);
        assert_eq!(eval("No", &store).await.unwrap(), false);
        assert_eq!(eval("1", &store).await.unwrap(), true);
    }

    #[tokio::test]
    async fn evaluates_equality() {
        let mut store = VariableStore::new();
        store.set("status", Value::String("ok".into()));
        assert_eq!(eval("${status} == ok", &store).await.unwrap(), true);
        assert_eq!(eval("${status} != ok", &store).await.unwrap(), false);
    }

    #[tokio::test]
    async fn evaluates_substring() {
        let mut store = VariableStore::new();
        store.set("body", Value::String("hello world".into()));
        assert_eq!(eval("'world' in ${body}", &store).await.unwrap(), true);
    }

    #[tokio::test]
    async fn evaluates_file_exists() {
        let store = VariableStore::new();
        assert_eq!(eval("file exists /", &store).await.unwrap(), true);
        assert_eq!(eval("file exists /definitely/not/a/real/path", &store).await.unwrap(), false);
    }

    #[tokio::test]
    async fn evaluates_command_succeeds() {
        let store = VariableStore::new();
        assert_eq!(eval("command true succeeds", &store).await.unwrap(), true);
        assert_eq!(eval("command false succeeds", &store).await.unwrap(), false);
    }

    #[tokio::test]
    async fn rejects_malformed_predicate() {
        let store = VariableStore::new();
        assert!(eval("this makes no sense", &store).await.is_err());
    }
}
