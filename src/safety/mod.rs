//! Deterministic, pattern-based risk classification for shell commands.
//!
//! Pure functions over command text, no I/O: the classifier never blocks
//! execution, it only reports a `RiskLevel` and the reasons behind it,
//! leaving the approval decision to the caller.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn default_estimate() -> Self {
        RiskLevel::Medium
    }
}

/// Outcome of classifying a single command: the risk level plus the
/// human-readable reasons that drove it, in match order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub risk: RiskLevel,
    pub reasons: Vec<String>,
}

/// Base-executable names a user has opted to trust, e.g. `git`, `ls`, `npm`.
/// Trust is granted at the base-executable granularity, never to a full
/// command line.
#[derive(Debug, Clone, Default)]
pub struct TrustedCommands {
    base_executables: HashSet<String>,
}

impl TrustedCommands {
    pub fn new(base_executables: impl IntoIterator<Item = String>) -> Self {
        Self {
            base_executables: base_executables.into_iter().collect(),
        }
    }

    pub fn trusts(&self, base_executable: &str) -> bool {
        self.base_executables.contains(base_executable)
    }
}

/// Classifies `command` and reports whether it may run without prompting,
/// given `trusted`. Auto-approved only at Low risk or below, and only when
/// its base executable is on the trusted list.
pub fn is_auto_approved(command: &str, trusted: &TrustedCommands) -> bool {
    let classification = classify(command);
    if classification.risk > RiskLevel::Low {
        return false;
    }
    match base_executable(command) {
        Some(exe) => trusted.trusts(&exe),
        None => false,
    }
}

/// Returns the first shell word of `command`, the granularity trust is
/// granted at.
pub fn base_executable(command: &str) -> Option<String> {
    shell_words::split(command)
        .ok()
        .and_then(|words| words.into_iter().next())
        .map(|first| {
            first
                .rsplit('/')
                .next()
                .unwrap_or(&first)
                .to_string()
        })
}

pub fn classify(command: &str) -> Classification {
    let trimmed = command.trim();
    let lower = trimmed.to_ascii_lowercase();

    if let Some(reason) = critical_reason(&lower) {
        return Classification {
            risk: RiskLevel::Critical,
            reasons: vec![reason],
        };
    }
    if let Some(reason) = high_reason(&lower) {
        return Classification {
            risk: RiskLevel::High,
            reasons: vec![reason],
        };
    }
    if let Some(reason) = medium_reason(&lower) {
        return Classification {
            risk: RiskLevel::Medium,
            reasons: vec![reason],
        };
    }
    if let Some(reason) = low_reason(&lower) {
        return Classification {
            risk: RiskLevel::Low,
            reasons: vec![reason],
        };
    }
    if is_pure_read(&lower) {
        return Classification {
            risk: RiskLevel::Safe,
            reasons: vec!["pure read-only command".to_string()],
        };
    }

    // Unrecognized shape: default to the conservative middle ground rather
    // than assuming safety.
    Classification {
        risk: RiskLevel::Medium,
        reasons: vec!["unrecognized command shape, defaulting to medium risk".to_string()],
    }
}

fn critical_reason(lower: &str) -> Option<String> {
    if is_recursive_root_or_home_removal(lower) {
        return Some("recursive removal of root or home directory".to_string());
    }
    if lower.contains("dd ") && lower.contains("of=/dev/") {
        return Some("dd writing directly to a block device".to_string());
    }
    if lower.contains("mkfs") {
        return Some("filesystem creation (mkfs)".to_string());
    }
    if contains_word(lower, "reboot") || contains_word(lower, "shutdown") || lower.contains("init 0") || lower.contains("init 6")
    {
        return Some("system reboot or shutdown".to_string());
    }
    if is_fork_bomb_shape(lower) {
        return Some("fork-bomb shape".to_string());
    }
    None
}

fn is_recursive_root_or_home_removal(lower: &str) -> bool {
    if !(lower.contains("rm ") || lower.starts_with("rm")) {
        return false;
    }
    let has_recursive = lower.contains("-r") || lower.contains("--recursive");
    if !has_recursive {
        return false;
    }
    for token in lower.split_whitespace() {
        if token == "/" || token == "~" || token == "$home" || token == "/root" || token == "/home" {
            return true;
        }
    }
    false
}

fn is_fork_bomb_shape(lower: &str) -> bool {
    let squashed: String = lower.chars().filter(|c| !c.is_whitespace()).collect();
    squashed.contains(":(){:|:&};:") || squashed.contains(":(){:|:&;};")
}

fn high_reason(lower: &str) -> Option<String> {
    if contains_word(lower, "sudo") {
        return Some("sudo-prefixed mutation".to_string());
    }
    if lower.contains("rm ") && (lower.contains("-rf") || lower.contains("-fr") || (lower.contains("-r") && lower.contains("-f")))
    {
        if let Some(path) = first_absolute_path(lower) {
            if !path.starts_with("./") {
                return Some(format!("rm -rf of absolute path '{path}' outside the project"));
            }
        }
    }
    if writes_system_directory(lower) {
        return Some("write targeting a system directory".to_string());
    }
    None
}

fn writes_system_directory(lower: &str) -> bool {
    const SYSTEM_DIRS: &[&str] = &["/etc/", "/usr/", "/bin/", "/sbin/", "/lib/", "/boot/", "/sys/", "/var/lib/"];
    let has_write_marker = lower.contains('>') || lower.contains("cp ") || lower.contains("mv ") || lower.contains("install ");
    has_write_marker && SYSTEM_DIRS.iter().any(|dir| lower.contains(dir))
}

fn first_absolute_path(lower: &str) -> Option<String> {
    shell_words::split(lower)
        .ok()?
        .into_iter()
        .find(|tok| tok.starts_with('/'))
}

fn medium_reason(lower: &str) -> Option<String> {
    if contains_word(lower, "rm") {
        return Some("file removal".to_string());
    }
    if lower.contains('>') && !lower.contains(">>") {
        return Some("redirect that may overwrite an existing file".to_string());
    }
    if lower.contains("reset --hard") {
        return Some("destructive git reset --hard".to_string());
    }
    if lower.contains("push") && lower.contains("--force") || lower.contains("push -f") {
        return Some("force push".to_string());
    }
    if lower.contains("drop table") || lower.contains("drop database") {
        return Some("database drop".to_string());
    }
    None
}

fn low_reason(lower: &str) -> Option<String> {
    if contains_word(lower, "touch")
        || contains_word(lower, "mkdir")
        || lower.contains(">>")
        || contains_word(lower, "cp")
        || contains_word(lower, "mv")
    {
        return Some("creates or modifies files inside the project".to_string());
    }
    if lower.starts_with("git ") {
        if lower.contains("reset --hard") || lower.contains("push --force") || lower.contains("push -f") {
            return None;
        }
        if is_pure_read(lower) {
            return None;
        }
        return Some("reversible git operation".to_string());
    }
    if contains_word(lower, "npm")
        || contains_word(lower, "pip")
        || contains_word(lower, "cargo")
        || contains_word(lower, "apt")
        || contains_word(lower, "apt-get")
    {
        if lower.contains("install") || lower.contains("add") {
            return Some("package install".to_string());
        }
    }
    None
}

fn is_pure_read(lower: &str) -> bool {
    const READ_COMMANDS: &[&str] = &[
        "ls", "cat", "grep", "echo", "which", "pwd", "find", "head", "tail", "wc", "diff", "file", "stat", "env", "whoami",
    ];
    if lower.starts_with("git status") || lower.starts_with("git log") || lower.starts_with("git diff") || lower.starts_with("git show") {
        return true;
    }
    READ_COMMANDS
        .iter()
        .any(|cmd| lower == *cmd || lower.starts_with(&format!("{cmd} ")))
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-').any(|tok| tok == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_critical_shapes() {
        assert_eq!(classify("rm -rf /").risk, RiskLevel::Critical);
        assert_eq!(classify("rm -rf ~").risk, RiskLevel::Critical);
        assert_eq!(classify("dd if=/dev/zero of=/dev/sda").risk, RiskLevel::Critical);
        assert_eq!(classify("mkfs.ext4 /dev/sdb1").risk, RiskLevel::Critical);
        assert_eq!(classify("sudo reboot").risk, RiskLevel::Critical);
        assert_eq!(classify(":(){ :|:& };:").risk, RiskLevel::Critical);
    }

    #[test]
    fn classifies_high_shapes() {
        assert_eq!(classify("sudo apt-get install curl").risk, RiskLevel::High);
        assert_eq!(classify("rm -rf /tmp/build").risk, RiskLevel::High);
        assert_eq!(classify("cp secrets.txt /etc/passwd").risk, RiskLevel::High);
    }

    #[test]
    fn classifies_medium_shapes() {
        assert_eq!(classify("rm build.log").risk, RiskLevel::Medium);
        assert_eq!(classify("echo hi > out.txt").risk, RiskLevel::Medium);
        assert_eq!(classify("git reset --hard HEAD~1").risk, RiskLevel::Medium);
        assert_eq!(classify("git push --force origin main").risk, RiskLevel::Medium);
    }

    #[test]
    fn classifies_low_shapes() {
        assert_eq!(classify("mkdir build").risk, RiskLevel::Low);
        assert_eq!(classify("git commit -am 'wip'").risk, RiskLevel::Low);
        assert_eq!(classify("npm install left-pad").risk, RiskLevel::Low);
    }

    #[test]
    fn classifies_safe_shapes() {
        assert_eq!(classify("ls -la").risk, RiskLevel::Safe);
        assert_eq!(classify("git status").risk, RiskLevel::Safe);
        assert_eq!(classify("cat README.md").risk, RiskLevel::Safe);
    }

    #[test]
    fn trusted_list_requires_low_or_below() {
        let trusted = TrustedCommands::new(["git".to_string(), "ls".to_string()]);
        assert!(is_auto_approved("git status", &trusted));
        assert!(is_auto_approved("git commit -am x", &trusted));
        assert!(!is_auto_approved("git reset --hard", &trusted));
        assert!(!is_auto_approved("rm -rf /tmp/x", &trusted));
    }

    #[test]
    fn trusted_list_is_base_executable_only() {
        let trusted = TrustedCommands::new(["npm".to_string()]);
        assert!(!is_auto_approved("ls -la", &trusted));
        assert!(is_auto_approved("npm install", &trusted));
    }

    #[test]
    fn base_executable_strips_path_prefix() {
        assert_eq!(base_executable("/usr/bin/git status").as_deref(), Some("git"));
        assert_eq!(base_executable("git status").as_deref(), Some("git"));
    }
}
