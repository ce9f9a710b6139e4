//! Collaborator trait boundaries: AI text generation, user-approval, and
//! notification. The core depends only on these traits; concrete
//! implementations are swappable (an HTTP-backed AI collaborator, a
//! terminal-prompt approval collaborator, a stderr notifier).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::safety::RiskLevel;

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("AI collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("AI collaborator returned a malformed response: {0}")]
    Malformed(String),
}

/// generate(prompt, max_tokens, temperature) -> text, bounded at 60s.
#[async_trait]
pub trait AiCollaborator: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String, AiError>;
}

pub const AI_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// An HTTP-backed AI collaborator: a `reqwest::Client` posting JSON,
/// bounded by a hard timeout.
pub struct HttpAiCollaborator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAiCollaborator {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

#[async_trait]
impl AiCollaborator for HttpAiCollaborator {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String, AiError> {
        let mut request = self.client.post(&self.endpoint).json(&GenerateRequest {
            prompt,
            max_tokens,
            temperature,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(AI_CALL_TIMEOUT, request.send())
            .await
            .map_err(|_| AiError::Unavailable("request timed out after 60s".to_string()))?
            .map_err(|e| AiError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AiError::Unavailable(format!("AI endpoint returned {}", response.status())));
        }

        response
            .json::<GenerateResponse>()
            .await
            .map(|r| r.text)
            .map_err(|e| AiError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalOption {
    pub key: String,
    pub label: String,
}

/// confirm(prompt, risk_level, options) -> chosen option key.
#[async_trait]
pub trait ApprovalCollaborator: Send + Sync {
    async fn confirm(&self, prompt: &str, risk: RiskLevel, options: &[ApprovalOption]) -> Option<String>;
}

/// Terminal-prompt approval collaborator: reads a line from stdin.
pub struct TerminalApproval;

#[async_trait]
impl ApprovalCollaborator for TerminalApproval {
    async fn confirm(&self, prompt: &str, risk: RiskLevel, options: &[ApprovalOption]) -> Option<String> {
        println!("[{risk:?}] {prompt}");
        for opt in options {
            println!("  {} - {}", opt.key, opt.label);
        }
        print!("> ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return None;
        }
        let chosen = line.trim();
        options.iter().find(|o| o.key == chosen).map(|o| o.key.clone())
    }
}

/// An approval collaborator backing the global `--yes` flag: auto-approves
/// at LOW risk or below only. `--yes` implies a non-interactive run, so
/// anything above LOW risk is denied outright rather than blocking on a
/// terminal prompt it has no reason to expect anyone is watching.
pub struct AutoApprove;

#[async_trait]
impl ApprovalCollaborator for AutoApprove {
    async fn confirm(&self, _prompt: &str, risk: RiskLevel, options: &[ApprovalOption]) -> Option<String> {
        if risk <= RiskLevel::Low {
            return options.first().map(|o| o.key.clone());
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// notify(title, body, severity); fire-and-forget.
#[async_trait]
pub trait NotificationCollaborator: Send + Sync {
    async fn notify(&self, title: &str, body: &str, severity: Severity);
}

pub struct StderrNotifier;

#[async_trait]
impl NotificationCollaborator for StderrNotifier {
    async fn notify(&self, title: &str, body: &str, severity: Severity) {
        tracing::event!(tracing::Level::INFO, title, body, ?severity, "notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_approve_picks_first_option_at_low_risk() {
        let approval = AutoApprove;
        let options = vec![
            ApprovalOption {
                key: "y".into(),
                label: "yes".into(),
            },
            ApprovalOption {
                key: "n".into(),
                label: "no".into(),
            },
        ];
        let chosen = approval.confirm("run it?", RiskLevel::Low, &options).await;
        assert_eq!(chosen.as_deref(), Some("y"));

        let chosen = approval.confirm("run it?", RiskLevel::Safe, &options).await;
        assert_eq!(chosen.as_deref(), Some("y"));
    }
}
