//! Environment scrubbing for agent-executed commands
//!
//! Inherited variables that look like credentials are removed before a command
//! runs. Allowed patterns take precedence over blocked patterns. Explicit
//! per-request overrides are never filtered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which inherited environment variables reach spawned processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvPolicy {
    /// Inherit the parent environment at all
    #[serde(default = "default_true")]
    pub inherit: bool,

    /// Patterns to block (e.g. `AWS_*`, `*_TOKEN`)
    #[serde(default = "default_blocked")]
    pub blocked_patterns: Vec<String>,

    /// Patterns to allow, checked first
    #[serde(default = "default_allowed")]
    pub allowed_patterns: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            inherit: true,
            blocked_patterns: default_blocked(),
            allowed_patterns: default_allowed(),
        }
    }
}

impl EnvPolicy {
    /// Check if an inherited variable should be dropped
    pub fn is_blocked(&self, name: &str) -> bool {
        if self
            .allowed_patterns
            .iter()
            .any(|pattern| pattern_matches(pattern, name))
        {
            return false;
        }
        self.blocked_patterns
            .iter()
            .any(|pattern| pattern_matches(pattern, name))
    }

    /// Filter a set of inherited variables
    pub fn filter<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if !self.inherit {
            return HashMap::new();
        }
        vars.into_iter()
            .filter(|(k, _)| !self.is_blocked(k))
            .collect()
    }

    /// Build the final environment: scrubbed parent env plus request overrides
    pub fn build(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = self.filter(std::env::vars());
        for (key, value) in overrides {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// Simple glob matching with a leading and/or trailing `*`
pub fn pattern_matches(pattern: &str, s: &str) -> bool {
    if pattern.len() > 1 && pattern.starts_with('*') && pattern.ends_with('*') {
        s.contains(&pattern[1..pattern.len() - 1])
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        s.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        s.starts_with(prefix)
    } else {
        s == pattern
    }
}

fn default_true() -> bool {
    true
}

fn default_blocked() -> Vec<String> {
    [
        "AWS_*",
        "AZURE_*",
        "GCP_*",
        "GOOGLE_*",
        "*_SECRET",
        "*_SECRET_*",
        "*_TOKEN",
        "*_TOKEN_*",
        "*_KEY",
        "*_API_KEY",
        "*_PASSWORD",
        "*_CREDENTIALS",
        "DATABASE_URL",
        "SSH_*",
        "GPG_*",
        "CLAWMATE_SECRET_KEY",
        "SECRET_KEY",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_allowed() -> Vec<String> {
    [
        "PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "LC_*", "TZ", "TMPDIR", "TEMP", "TMP",
        "SYSTEMROOT", "COMSPEC", "PATHEXT", "USERPROFILE", "RUST_LOG",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("AWS_*", "AWS_ACCESS_KEY_ID"));
        assert!(pattern_matches("*_TOKEN", "GITHUB_TOKEN"));
        assert!(pattern_matches("*SECRET*", "MY_SECRET_VALUE"));
        assert!(!pattern_matches("AWS_*", "HOME"));
        assert!(pattern_matches("PATH", "PATH"));
    }

    #[test]
    fn test_allowed_beats_blocked() {
        let policy = EnvPolicy {
            blocked_patterns: vec!["LC_*".to_string(), "*_TOKEN".to_string()],
            ..Default::default()
        };
        assert!(!policy.is_blocked("LC_ALL"));
        assert!(policy.is_blocked("GITHUB_TOKEN"));
    }

    #[test]
    fn test_filter_and_overrides() {
        let policy = EnvPolicy::default();
        let vars = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("OPENAI_API_KEY".to_string(), "sk-x".to_string()),
        ];
        let filtered = policy.filter(vars);
        assert!(filtered.contains_key("PATH"));
        assert!(!filtered.contains_key("OPENAI_API_KEY"));

        let mut overrides = HashMap::new();
        overrides.insert("DEPLOY_TOKEN".to_string(), "explicit".to_string());
        let env = policy.build(&overrides);
        assert_eq!(env.get("DEPLOY_TOKEN").map(String::as_str), Some("explicit"));
    }

    #[test]
    fn test_no_inherit() {
        let policy = EnvPolicy {
            inherit: false,
            ..Default::default()
        };
        assert!(policy
            .filter(vec![("PATH".to_string(), "/bin".to_string())])
            .is_empty());
    }
}
