//! Risk tiers and the configurable predicates that assign them
//!
//! The predicate lists are plain configuration. The defaults below are a
//! starting policy, users replace them through `pipeline.json`.

use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================
// Risk tier
// ============================================================

/// Risk classification driving approval and sandbox policy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum RiskTier {
    /// Read-only inspection (ls, cat, git status...)
    #[default]
    Safe,
    /// Mutates state but is recoverable (mkdir, npm install, git commit...)
    Sensitive,
    /// Matches an explicit destructive pattern (rm -rf, dd, mkfs...)
    Destructive,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Safe => "safe",
            RiskTier::Sensitive => "sensitive",
            RiskTier::Destructive => "destructive",
        }
    }

    /// Parse from a user-provided string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "safe" => Some(Self::Safe),
            "sensitive" => Some(Self::Sensitive),
            "destructive" => Some(Self::Destructive),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================
// Predicates
// ============================================================

/// How a predicate matches a command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum PatternType {
    /// The trimmed command line equals the value
    Exact(String),
    /// The command line contains the value
    Contains(String),
    /// The command line matches the regular expression
    Regex(String),
}

/// A single risk predicate with a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskPredicate {
    pub pattern: PatternType,
    pub reason: String,
}

impl RiskPredicate {
    pub fn exact(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: PatternType::Exact(value.into()),
            reason: reason.into(),
        }
    }

    pub fn contains(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: PatternType::Contains(value.into()),
            reason: reason.into(),
        }
    }

    pub fn regex(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: PatternType::Regex(value.into()),
            reason: reason.into(),
        }
    }

    /// Compile the predicate. Regex patterns that fail to compile are reported
    /// so that configuration errors surface at load time.
    pub fn compile(&self) -> Result<CompiledPredicate, regex::Error> {
        let matcher = match &self.pattern {
            PatternType::Exact(s) => Matcher::Exact(s.trim().to_string()),
            PatternType::Contains(s) => Matcher::Contains(s.clone()),
            PatternType::Regex(r) => Matcher::Regex(Regex::new(r)?),
        };
        Ok(CompiledPredicate {
            matcher,
            reason: self.reason.clone(),
        })
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Contains(String),
    Regex(Regex),
}

/// A predicate ready for matching
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    matcher: Matcher,
    reason: String,
}

impl CompiledPredicate {
    pub fn matches(&self, command_line: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(s) => command_line.trim() == s,
            Matcher::Contains(s) => command_line.contains(s.as_str()),
            Matcher::Regex(re) => re.is_match(command_line),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

// ============================================================
// Tier policy
// ============================================================

/// Configured predicate sets used by the approval classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPolicy {
    /// Programs considered read-only when invoked without mutating flags
    #[serde(default = "default_safe_programs")]
    pub safe_programs: Vec<String>,

    /// Subcommand prefixes that are read-only (e.g. "git status")
    #[serde(default = "default_safe_prefixes")]
    pub safe_prefixes: Vec<String>,

    /// Predicates that force the destructive tier
    #[serde(default = "default_destructive")]
    pub destructive: Vec<RiskPredicate>,

    /// Predicates that force at least the sensitive tier on an otherwise safe program
    #[serde(default = "default_sensitive")]
    pub sensitive: Vec<RiskPredicate>,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            safe_programs: default_safe_programs(),
            safe_prefixes: default_safe_prefixes(),
            destructive: default_destructive(),
            sensitive: default_sensitive(),
        }
    }
}

impl TierPolicy {
    /// Check that every regex predicate compiles
    pub fn validate(&self) -> std::result::Result<(), String> {
        for predicate in self.destructive.iter().chain(self.sensitive.iter()) {
            predicate
                .compile()
                .map_err(|e| format!("invalid risk predicate '{}': {}", predicate.reason, e))?;
        }
        Ok(())
    }
}

fn default_safe_programs() -> Vec<String> {
    [
        "ls", "dir", "pwd", "echo", "cat", "head", "tail", "wc", "grep", "rg", "find",
        "which", "where", "whoami", "hostname", "uname", "date", "printenv", "stat",
        "file", "du", "df", "ps", "tree", "type", "Get-ChildItem", "Get-Content", "Get-Location",
        "sleep", "true",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_safe_prefixes() -> Vec<String> {
    [
        "git status",
        "git log",
        "git diff",
        "git show",
        "git branch",
        "cargo --version",
        "node --version",
        "python --version",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_destructive() -> Vec<RiskPredicate> {
    vec![
        RiskPredicate::regex(r"\brm\s+(-[a-zA-Z]*[rf][a-zA-Z]*\s+)+", "Recursive or forced deletion"),
        RiskPredicate::regex(r"\bdd\s+if=", "Raw disk write"),
        RiskPredicate::regex(r"\bmkfs(\.\w+)?\b", "Filesystem format"),
        RiskPredicate::regex(r">\s*/dev/[sh]d[a-z]", "Disk overwrite"),
        RiskPredicate::regex(r"\b(shutdown|reboot|poweroff|halt)\b", "System power control"),
        RiskPredicate::regex(r"chmod\s+(-R\s+)?777\s+/", "Dangerous permission change"),
        RiskPredicate::regex(r"\bgit\s+(push\s+(-f|--force)|reset\s+--hard|clean\s+-[a-z]*f)", "History rewrite"),
        RiskPredicate::regex(r"(?i)\b(drop\s+table|truncate\s+table)\b", "Database destruction"),
        RiskPredicate::regex(r"(?i)Remove-Item\s+.*-Recurse", "Recursive deletion"),
        RiskPredicate::regex(r"(?i)\b(format|rd\s+/s|del\s+/[fsq])\b", "Windows destructive command"),
        RiskPredicate::contains(":(){ :|:& };:", "Fork bomb"),
        RiskPredicate::contains("/dev/tcp/", "Network device access"),
    ]
}

fn default_sensitive() -> Vec<RiskPredicate> {
    vec![
        RiskPredicate::regex(r"(^|\s)>{1,2}\s*\S", "Output redirection writes a file"),
        RiskPredicate::regex(
            r"\bfind\b.*\s-(delete|exec\w*|ok\w*|fprint\w*|fls)\b",
            "find with side effects",
        ),
        RiskPredicate::regex(r"\brg\b.*\s--pre\b", "rg runs a preprocessor command"),
        RiskPredicate::regex(r"\btree\b.*\s-o\b", "tree writes a file"),
        RiskPredicate::regex(
            r"\bgit\s+branch\b.*\s(-[dDmMcCf]|--(delete|move|copy|force))\b",
            "Branch mutation",
        ),
        RiskPredicate::contains("sudo", "Privilege elevation"),
    ]
}
