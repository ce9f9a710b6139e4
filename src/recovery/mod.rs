//! Error-signature computation, strategy generation/ranking, and the
//! persistent Recovery History: a learning manager that blends a
//! candidate strategy's own confidence with how it has fared against the
//! same error signature in past runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Retry,
    ModifyCommand,
    AlternativeCommand,
    PrepareEnvironmentThenRetry,
    RevertChanges,
    Skip,
    Abort,
}

/// A candidate fix for a failed step. Generated per failure; never persisted
/// directly (only its (kind, command) identity is, via `RecoveryHistory`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub kind: StrategyKind,
    pub command: Option<String>,
    pub description: String,
    pub confidence: f64,
    pub retry_original_on_success: bool,
}

impl RecoveryStrategy {
    pub fn retry_fallback() -> Self {
        Self {
            kind: StrategyKind::Retry,
            command: None,
            description: "retry the original command".to_string(),
            confidence: 0.3,
            retry_original_on_success: false,
        }
    }

    pub fn skip_fallback() -> Self {
        Self {
            kind: StrategyKind::Skip,
            command: None,
            description: "skip this step and continue".to_string(),
            confidence: 0.1,
            retry_original_on_success: false,
        }
    }
}

/// A recorded attempt at recovering a failed step, kept on the Step Result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub signature: String,
    pub strategy: RecoveryStrategy,
    pub auto_approved: bool,
    pub succeeded: bool,
}

/// One of the fixed error classes the signature table recognizes.
static SIGNATURE_TABLE: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("permission-denied", Regex::new(r"(?i)permission denied|eacces").unwrap()),
        ("command-not-found", Regex::new(r"(?i)command not found|no such file or directory.*(bin|usr)|not recognized as").unwrap()),
        ("syntax-error", Regex::new(r"(?i)syntax error|unexpected token").unwrap()),
        ("connection-refused", Regex::new(r"(?i)connection refused|econnrefused").unwrap()),
        ("disk-full", Regex::new(r"(?i)no space left on device|disk full").unwrap()),
        ("resource-busy", Regex::new(r"(?i)resource busy|device or resource busy|ebusy").unwrap()),
        ("missing-directory", Regex::new(r"(?i)no such file or directory").unwrap()),
    ]
});

/// Computes the error signature: first regex match wins, in table order;
/// otherwise `generic:<first-50-chars-of-first-line>`.
pub fn error_signature(error_text: &str) -> String {
    for (tag, re) in SIGNATURE_TABLE.iter() {
        if re.is_match(error_text) {
            return tag.to_string();
        }
    }
    let first_line = error_text.lines().next().unwrap_or("");
    let truncated: String = first_line.chars().take(50).collect();
    format!("generic:{truncated}")
}

/// Pattern-table fixes keyed by signature.
pub fn pattern_table_strategies(signature: &str, failed_command: &str) -> Vec<RecoveryStrategy> {
    match signature {
        "command-not-found" => {
            let pkg = crate::safety::base_executable(failed_command).unwrap_or_else(|| "PKG".to_string());
            vec![RecoveryStrategy {
                kind: StrategyKind::PrepareEnvironmentThenRetry,
                command: Some(format!("apt-get install -y {pkg}")),
                description: format!("install missing package '{pkg}' then retry"),
                confidence: 0.6,
                retry_original_on_success: true,
            }]
        }
        "permission-denied" => vec![RecoveryStrategy {
            kind: StrategyKind::ModifyCommand,
            command: Some(format!("sudo {failed_command}")),
            description: "retry with sudo".to_string(),
            confidence: 0.55,
            retry_original_on_success: false,
        }],
        "missing-directory" => {
            if let Some(dir) = guess_missing_directory(failed_command) {
                vec![RecoveryStrategy {
                    kind: StrategyKind::PrepareEnvironmentThenRetry,
                    command: Some(format!("mkdir -p {dir}")),
                    description: format!("create missing directory '{dir}' then retry"),
                    confidence: 0.6,
                    retry_original_on_success: true,
                }]
            } else {
                vec![]
            }
        }
        _ => vec![],
    }
}

fn guess_missing_directory(command: &str) -> Option<String> {
    shell_words::split(command)
        .ok()?
        .into_iter()
        .rev()
        .find(|tok| tok.contains('/'))
        .map(|tok| {
            tok.rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or(tok)
        })
}

/// Record kept for a single (signature, strategy-kind, strategy-command)
/// tuple in `RecoveryHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub strategy_kind: StrategyKind,
    pub strategy_command: Option<String>,
    pub success_count: u32,
    pub last_success: Option<DateTime<Utc>>,
}

/// Persistent mapping from error signature to strategy outcome history.
/// Grows monotonically; never pruned automatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryHistory {
    records: HashMap<String, Vec<HistoryRecord>>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl RecoveryHistory {
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut history = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        } else {
            RecoveryHistory::default()
        };
        history.path = Some(path.to_path_buf());
        Ok(history)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let raw = serde_json::to_string_pretty(self)?;
            std::fs::write(path, raw)?;
        }
        Ok(())
    }

    fn find(&self, signature: &str, kind: StrategyKind, command: Option<&str>) -> Option<&HistoryRecord> {
        self.records.get(signature)?.iter().find(|r| {
            r.strategy_kind == kind && r.strategy_command.as_deref() == command
        })
    }

    /// Historical success rate in [0, 1] for this exact tuple; 0.0 if unseen.
    pub fn success_rate(&self, signature: &str, kind: StrategyKind, command: Option<&str>) -> f64 {
        match self.find(signature, kind, command) {
            Some(record) if record.success_count > 0 => 1.0,
            _ => 0.0,
        }
    }

    pub fn has_prior_success(&self, signature: &str, kind: StrategyKind, command: Option<&str>) -> bool {
        self.find(signature, kind, command).map(|r| r.success_count > 0).unwrap_or(false)
    }

    /// Writes back the outcome of a strategy execution: success increments
    /// the count and timestamp; failure leaves other fields untouched so a
    /// prior success remains visible.
    pub fn record_outcome(&mut self, signature: &str, strategy: &RecoveryStrategy, succeeded: bool) {
        let bucket = self.records.entry(signature.to_string()).or_default();
        let existing = bucket.iter_mut().find(|r| {
            r.strategy_kind == strategy.kind && r.strategy_command.as_deref() == strategy.command.as_deref()
        });
        match existing {
            Some(record) => {
                if succeeded {
                    record.success_count += 1;
                    record.last_success = Some(Utc::now());
                }
            }
            None => {
                bucket.push(HistoryRecord {
                    strategy_kind: strategy.kind,
                    strategy_command: strategy.command.clone(),
                    success_count: if succeeded { 1 } else { 0 },
                    last_success: if succeeded { Some(Utc::now()) } else { None },
                });
            }
        }
    }
}

/// Ranks candidate strategies: 60% own confidence, 40% historical success
/// rate for the exact tuple, capped at 0.95. Returns strategies sorted
/// highest-ranked first.
pub fn rank_strategies(
    signature: &str,
    mut candidates: Vec<RecoveryStrategy>,
    history: &RecoveryHistory,
) -> Vec<(RecoveryStrategy, f64)> {
    let mut ranked: Vec<(RecoveryStrategy, f64)> = candidates
        .drain(..)
        .map(|s| {
            let hist_rate = history.success_rate(signature, s.kind, s.command.as_deref());
            let blended = (s.confidence * 0.6 + hist_rate * 0.4).min(0.95);
            (s, blended)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// Auto-recovers without asking when the top strategy's confidence is at
/// least 0.8, OR its kind is a plain retry, OR this exact
/// (signature, strategy) tuple has a prior recorded success.
pub fn should_auto_recover(signature: &str, strategy: &RecoveryStrategy, confidence: f64, history: &RecoveryHistory) -> bool {
    confidence >= 0.8
        || strategy.kind == StrategyKind::Retry
        || history.has_prior_success(signature, strategy.kind, strategy.command.as_deref())
}

/// Assembles the full candidate list for a failure: pattern-table fixes
/// built from the failing command's own text, then the always-present
/// retry/skip fallbacks. AI-collaborator suggestions are merged in by the
/// caller (engine/dispatcher layer), which has access to the collaborator
/// trait object.
pub fn generate_candidates(signature: &str, failed_command: &str) -> Vec<RecoveryStrategy> {
    let mut candidates = pattern_table_strategies(signature, failed_command);
    candidates.push(RecoveryStrategy::retry_fallback());
    candidates.push(RecoveryStrategy::skip_fallback());
    candidates
}
