use std::path::Path;

use tracing::*;

/// One `user:pass` line from the credential file. Both fields may carry
/// the `*` wildcard; a password starting with `!` is a negated literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRule {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub granted: bool,
    pub matched_rule: Option<usize>,
}

#[derive(Debug, Default)]
pub struct CredentialPolicy {
    rules: Vec<CredentialRule>,
}

impl CredentialPolicy {
    pub fn new(rules: Vec<CredentialRule>) -> Self {
        CredentialPolicy { rules }
    }

    /// Missing file is not fatal: an empty rule list denies all logins.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let rules = Self::parse(&contents);
                info!(path=%path.display(), count = rules.len(), "Loaded credential rules");
                CredentialPolicy { rules }
            }
            Err(error) => {
                warn!(%error, path=%path.display(), "Credential file not readable, rejecting all logins");
                CredentialPolicy { rules: vec![] }
            }
        }
    }

    fn parse(contents: &str) -> Vec<CredentialRule> {
        contents
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                // Only the first `:` separates; passwords may contain `:`.
                let (user, password) = line.split_once(':')?;
                Some(CredentialRule {
                    user: user.to_owned(),
                    password: password.to_owned(),
                })
            })
            .collect()
    }

    /// First rule whose user field matches decides; no fallthrough.
    pub fn evaluate(&self, username: &str, password: &str) -> AuthOutcome {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.user != username && rule.user != "*" {
                continue;
            }
            let granted = if rule.password == "*" {
                true
            } else if let Some(forbidden) = rule.password.strip_prefix('!') {
                password != forbidden
            } else {
                password == rule.password
            };
            return AuthOutcome {
                granted,
                matched_rule: Some(index),
            };
        }
        AuthOutcome {
            granted: false,
            matched_rule: None,
        }
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.evaluate(username, password).granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(contents: &str) -> CredentialPolicy {
        CredentialPolicy::new(CredentialPolicy::parse(contents))
    }

    #[test]
    fn test_literal_rule_with_wildcard_fallback() {
        let policy = policy("admin:hunter2\n*:*\n");
        assert!(policy.authenticate("admin", "hunter2"));
        assert!(!policy.authenticate("admin", "wrong"));
        assert!(policy.authenticate("bob", "anything"));
    }

    #[test]
    fn test_negated_password_without_fallback() {
        let policy = policy("admin:!forbidden\n");
        assert!(policy.authenticate("admin", "ok"));
        assert!(!policy.authenticate("admin", "forbidden"));
        assert!(!policy.authenticate("bob", "x"));
    }

    #[test]
    fn test_first_match_wins() {
        let policy = policy("root:first\nroot:*\n");
        assert!(!policy.authenticate("root", "second"));
        assert_eq!(
            policy.evaluate("root", "first"),
            AuthOutcome {
                granted: true,
                matched_rule: Some(0)
            }
        );
    }

    #[test]
    fn test_comments_blanks_and_embedded_separator() {
        let policy = policy("# comment\n\nadmin:pa:ss\nbroken-line\n");
        assert!(policy.authenticate("admin", "pa:ss"));
        assert!(!policy.authenticate("broken-line", ""));
    }

    #[test]
    fn test_wildcard_password() {
        let policy = policy("guest:*\n");
        assert!(policy.authenticate("guest", ""));
        assert!(policy.authenticate("guest", "literally anything"));
        assert_eq!(
            policy.evaluate("nobody", "x"),
            AuthOutcome {
                granted: false,
                matched_rule: None
            }
        );
    }

    #[test]
    fn test_missing_file_denies_all() {
        let policy = CredentialPolicy::load(Path::new("/nonexistent/user.txt"));
        assert!(!policy.authenticate("root", "root"));
    }
}
