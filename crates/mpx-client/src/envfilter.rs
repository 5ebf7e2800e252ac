//! Secret filtering for env vars handed to stdio children.

use std::collections::HashMap;

/// Replaces secret values wherever env vars are logged or published.
pub const REDACTED_SENTINEL: &str = "[REDACTED]";

const SENSITIVE_FRAGMENTS: [&str; 6] = [
    "key",
    "secret",
    "token",
    "password",
    "passwd",
    "authorization",
];

/// Whether an env key looks like it carries a credential.
///
/// Keys are normalized (lowercased, separators stripped) before matching so
/// `API_KEY`, `api-key` and `ApiKey` all count.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    SENSITIVE_FRAGMENTS
        .iter()
        .any(|fragment| normalized.contains(fragment))
}

/// Splits an env map into what the child receives and which keys were
/// withheld.
///
/// Without `expose_secrets`, secret-looking vars are withheld from the child
/// entirely; with it, the child receives everything. The returned key list
/// feeds logging either way, where values appear only as
/// [`REDACTED_SENTINEL`].
pub fn filter_env(
    env: &HashMap<String, String>,
    expose_secrets: bool,
) -> (HashMap<String, String>, Vec<String>) {
    let mut redacted: Vec<String> = env
        .keys()
        .filter(|k| is_sensitive_key(k))
        .cloned()
        .collect();
    redacted.sort();

    let child_env = if expose_secrets {
        env.clone()
    } else {
        env.iter()
            .filter(|(k, _)| !is_sensitive_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    (child_env, redacted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_key_variants() {
        for key in [
            "API_KEY",
            "api-key",
            "OPENAI_API_KEY",
            "client_secret",
            "AUTH_TOKEN",
            "PASSWORD",
            "passwd",
            "HTTP_AUTHORIZATION",
            "GithubToken",
        ] {
            assert!(is_sensitive_key(key), "{key} should be sensitive");
        }
    }

    #[test]
    fn test_benign_keys_pass() {
        for key in ["PATH", "HOME", "NODE_ENV", "LANG", "RUST_LOG"] {
            assert!(!is_sensitive_key(key), "{key} should not be sensitive");
        }
    }

    #[test]
    fn test_filter_withholds_secrets_by_default() {
        let env = HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("API_KEY".to_string(), "sk-123".to_string()),
        ]);

        let (child, redacted) = filter_env(&env, false);
        assert_eq!(child.len(), 1);
        assert!(child.contains_key("PATH"));
        assert_eq!(redacted, vec!["API_KEY".to_string()]);
    }

    #[test]
    fn test_opt_in_passes_originals_but_still_reports() {
        let env = HashMap::from([("API_KEY".to_string(), "sk-123".to_string())]);

        let (child, redacted) = filter_env(&env, true);
        assert_eq!(child.get("API_KEY").unwrap(), "sk-123");
        assert_eq!(redacted, vec!["API_KEY".to_string()]);
    }

    #[test]
    fn test_redacted_list_is_sorted() {
        let env = HashMap::from([
            ("Z_TOKEN".to_string(), "z".to_string()),
            ("A_SECRET".to_string(), "a".to_string()),
        ]);
        let (_, redacted) = filter_env(&env, false);
        assert_eq!(redacted, vec!["A_SECRET".to_string(), "Z_TOKEN".to_string()]);
    }
}
