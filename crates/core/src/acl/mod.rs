//! The ACL oracle collaborator: `(userId, repoId, operation, path, revision?)
//! -> Allow | Deny`.
//!
//! Mirrors the stub-behind-trait-boundary pattern `identity::ldap` uses for
//! its LDAP resolver: a real deployment swaps in a Gitea/GitLab-backed
//! oracle without touching the session engine, which only ever talks to the
//! [`AclOracle`] trait.

use tracing::{debug, info};

use crate::models::{AclOperation, Revision};

/// The ACL oracle's verdict for a single `(user, repo, operation, path)`
/// query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclVerdict {
    Allow,
    Deny,
}

impl AclVerdict {
    pub fn is_allowed(self) -> bool {
        matches!(self, AclVerdict::Allow)
    }
}

/// Input to an ACL check.
#[derive(Debug, Clone)]
pub struct AclQuery<'a> {
    pub user: &'a str,
    pub repo: &'a str,
    pub operation: AclOperation,
    pub path: &'a str,
    pub revision: Option<Revision>,
}

/// The pluggable ACL oracle. A session holds one `Arc<dyn AclOracle>` and
/// consults it before every command that touches a path.
pub trait AclOracle: Send + Sync {
    fn check(&self, query: &AclQuery<'_>) -> AclVerdict;
}

/// A single path-prefix rule: `path_prefix` grants `min_operation` and below
/// to `principal` (`"*"` for anyone, `"$anonymous"` for the unauthenticated
/// user, otherwise an exact username).
#[derive(Debug, Clone)]
pub struct AclRule {
    pub path_prefix: String,
    pub principal: String,
    pub allow_read: bool,
    pub allow_write: bool,
    pub allow_admin: bool,
}

/// Default ACL oracle: an ordered list of path-prefix rules, most specific
/// (longest matching prefix) wins; ties broken by rule order (later wins).
/// With no matching rule, read is allowed to everyone and write/admin are
/// denied -- the same "open read, gated write" default the source repo's
/// path-based `FilePolicy` defaults to.
pub struct PathPrefixAclOracle {
    rules: Vec<AclRule>,
}

impl PathPrefixAclOracle {
    pub fn new(rules: Vec<AclRule>) -> Self {
        info!(rule_count = rules.len(), "initialized path-prefix ACL oracle");
        Self { rules }
    }

    /// An oracle with no configured rules: read open to everyone, write and
    /// admin restricted to any authenticated (non-anonymous) user.
    pub fn open_read() -> Self {
        Self::new(Vec::new())
    }

    fn matching_rules<'a>(&'a self, path: &str) -> Vec<&'a AclRule> {
        let mut matches: Vec<&AclRule> = self
            .rules
            .iter()
            .filter(|r| {
                r.path_prefix == "/"
                    || path == r.path_prefix
                    || path.starts_with(&format!("{}/", r.path_prefix))
            })
            .collect();
        matches.sort_by_key(|r| r.path_prefix.len());
        matches
    }
}

impl AclOracle for PathPrefixAclOracle {
    fn check(&self, query: &AclQuery<'_>) -> AclVerdict {
        let candidates = self.matching_rules(query.path);
        let applicable: Vec<&AclRule> = candidates
            .into_iter()
            .filter(|r| r.principal == "*" || r.principal == query.user)
            .collect();

        let verdict = match applicable.last() {
            Some(rule) => {
                let allowed = match query.operation {
                    AclOperation::Read => rule.allow_read,
                    AclOperation::Write => rule.allow_write,
                    AclOperation::Admin => rule.allow_admin,
                };
                if allowed {
                    AclVerdict::Allow
                } else {
                    AclVerdict::Deny
                }
            }
            None => match query.operation {
                AclOperation::Read => AclVerdict::Allow,
                AclOperation::Write | AclOperation::Admin => {
                    if query.user.is_empty() || query.user == "$anonymous" {
                        AclVerdict::Deny
                    } else {
                        AclVerdict::Allow
                    }
                }
            },
        };

        debug!(
            user = query.user,
            repo = query.repo,
            path = query.path,
            op = ?query.operation,
            allowed = verdict.is_allowed(),
            "acl check"
        );
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query<'a>(user: &'a str, op: AclOperation, path: &'a str) -> AclQuery<'a> {
        AclQuery {
            user,
            repo: "test",
            operation: op,
            path,
            revision: None,
        }
    }

    #[test]
    fn test_open_read_allows_anonymous_read() {
        let oracle = PathPrefixAclOracle::open_read();
        let q = query("$anonymous", AclOperation::Read, "/trunk/a.txt");
        assert_eq!(oracle.check(&q), AclVerdict::Allow);
    }

    #[test]
    fn test_open_read_denies_anonymous_write() {
        let oracle = PathPrefixAclOracle::open_read();
        let q = query("$anonymous", AclOperation::Write, "/trunk/a.txt");
        assert_eq!(oracle.check(&q), AclVerdict::Deny);
    }

    #[test]
    fn test_authenticated_write_allowed_by_default() {
        let oracle = PathPrefixAclOracle::open_read();
        let q = query("alice", AclOperation::Write, "/trunk/a.txt");
        assert_eq!(oracle.check(&q), AclVerdict::Allow);
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let oracle = PathPrefixAclOracle::new(vec![
            AclRule {
                path_prefix: "/".into(),
                principal: "*".into(),
                allow_read: true,
                allow_write: false,
                allow_admin: false,
            },
            AclRule {
                path_prefix: "/secret".into(),
                principal: "*".into(),
                allow_read: false,
                allow_write: false,
                allow_admin: false,
            },
        ]);
        assert_eq!(
            oracle.check(&query("alice", AclOperation::Read, "/secret/x.txt")),
            AclVerdict::Deny
        );
        assert_eq!(
            oracle.check(&query("alice", AclOperation::Read, "/trunk/x.txt")),
            AclVerdict::Allow
        );
    }

    #[test]
    fn test_root_prefix_rule_applies_to_every_path() {
        let oracle = PathPrefixAclOracle::new(vec![AclRule {
            path_prefix: "/".into(),
            principal: "*".into(),
            allow_read: true,
            allow_write: false,
            allow_admin: false,
        }]);
        // The root rule must deny write for a deep path too, not just "/"
        // itself -- this would wrongly fall through to the open default if
        // the root prefix failed to match.
        assert_eq!(
            oracle.check(&query("alice", AclOperation::Write, "/trunk/nested/x.txt")),
            AclVerdict::Deny
        );
    }

    #[test]
    fn test_principal_specific_rule() {
        let oracle = PathPrefixAclOracle::new(vec![AclRule {
            path_prefix: "/trunk".into(),
            principal: "bob".into(),
            allow_read: true,
            allow_write: true,
            allow_admin: false,
        }]);
        assert_eq!(
            oracle.check(&query("bob", AclOperation::Write, "/trunk/x.txt")),
            AclVerdict::Allow
        );
        // alice gets no matching rule at all -> default (authenticated write allowed)
        assert_eq!(
            oracle.check(&query("alice", AclOperation::Write, "/trunk/x.txt")),
            AclVerdict::Allow
        );
    }
}
