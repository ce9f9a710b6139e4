//! Variable Store: the shared key-value map threaded through a workflow's
//! execution, plus the substitution and extraction rules that read/write it.
//!
//! Substitutes both `${name}` interpolation and bare `$name` at word
//! boundaries, in a single non-recursive pass over the source text.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    variables: HashMap<String, Value>,
}

static SUBST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.:-]+)\}|\$([A-Za-z_][A-Za-z0-9_]*)\b").unwrap());

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn extend(&mut self, other: &HashMap<String, Value>) {
        for (k, v) in other {
            self.variables.insert(k.clone(), v.clone());
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.variables.clone()
    }

    fn string_form(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// One-pass, non-recursive substitution: `${name}` and bare `$name` (at
    /// word boundaries) are both matched in a single scan over `input`, so a
    /// substituted value's own `$`-text is never rescanned.
    pub fn substitute(&self, input: &str) -> String {
        SUBST_RE
            .replace_all(input, |caps: &regex::Captures| {
                let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or_default();
                match self.variables.get(name) {
                    Some(v) => Self::string_form(v),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Extracts values for `names` from a completed command's stdout: (a)
    /// stdout parsed as JSON, matching top-level keys; (b) else
    /// `NAME=value` / `export NAME=value` lines, case-insensitive key
    /// match.
    pub fn extract_from_stdout(names: &[String], stdout: &str) -> HashMap<String, Value> {
        let mut extracted = HashMap::new();

        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(stdout.trim()) {
            for name in names {
                if let Some(v) = map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone()) {
                    extracted.insert(name.clone(), v);
                }
            }
            if !extracted.is_empty() {
                return extracted;
            }
        }

        for line in stdout.lines() {
            let line = line.trim().strip_prefix("export ").unwrap_or(line.trim());
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if let Some(name) = names.iter().find(|n| n.eq_ignore_ascii_case(key)) {
                    extracted.insert(name.clone(), Value::String(value.trim().to_string()));
                }
            }
        }

        extracted
    }

    /// Extracts produced variables from a JSON response body by top-level
    /// key.
    pub fn extract_from_json(names: &[String], body: &Value) -> HashMap<String, Value> {
        let mut extracted = HashMap::new();
        if let Value::Object(map) = body {
            for name in names {
                if let Some(v) = map.get(name) {
                    extracted.insert(name.clone(), v.clone());
                }
            }
        }
        extracted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_braced_verbatim() {
        let mut store = VariableStore::new();
        store.set("name", Value::String("world".into()));
        assert_eq!(store.substitute("hello ${name}"), "hello world");
    }

    #[test]
    fn substitutes_bare_at_word_boundary() {
        let mut store = VariableStore::new();
        store.set("name", Value::String("world".into()));
        assert_eq!(store.substitute("hello $name!"), "hello world!");
        assert_eq!(store.substitute("no$namehere"), "no$namehere");
    }

    #[test]
    fn unknown_variable_left_untouched() {
        let store = VariableStore::new();
        assert_eq!(store.substitute("hi ${missing}"), "hi ${missing}");
    }

    #[test]
    fn substitution_is_one_pass_non_recursive() {
        let mut store = VariableStore::new();
        store.set("a", Value::String("${b}".into()));
        assert_eq!(store.substitute("${a}"), "${b}");
    }

    #[test]
    fn braced_value_containing_a_bare_dollar_var_is_not_re_expanded() {
        let mut store = VariableStore::new();
        store.set("a", Value::String("literal $b here".into()));
        store.set("b", Value::String("surprise".into()));
        assert_eq!(store.substitute("${a}"), "literal $b here");
    }

    #[test]
    fn extracts_from_json_stdout() {
        let names = vec!["token".to_string(), "missing".to_string()];
        let extracted = VariableStore::extract_from_stdout(&names, r#"{"token": "abc123"}"#);
        assert_eq!(extracted.get("token"), Some(&Value::String("abc123".into())));
        assert!(!extracted.contains_key("missing"));
    }

    #[test]
    fn extracts_from_name_equals_value_lines() {
        let names = vec!["TOKEN".to_string()];
        let extracted = VariableStore::extract_from_stdout(&names, "export TOKEN=abc123\nother stuff");
        assert_eq!(extracted.get("TOKEN"), Some(&Value::String("abc123".into())));
    }
}
