//! Access control descriptors and the permission check.
//!
//! Every node carries an [`Acd`]: an inherit flag plus a list of entries.
//! The check walks from the node toward the root while levels stay
//! unresolved, evaluating entries at each level with deny overriding allow.
//! An unresolved walk denies by default.

use serde::{Deserialize, Serialize};

/// Subject granted to every authenticated user.
pub const EVERYONE: &str = "everyone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Remove,
    Create,
    Use,
    Administer,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Remove => "remove",
            Permission::Create => "create",
            Permission::Use => "use",
            Permission::Administer => "administer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAction {
    Allow,
    Deny,
}

/// One access control entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ace {
    pub action: SecurityAction,
    pub subjects: Vec<String>,
    pub permissions: Vec<Permission>,
}

impl Ace {
    pub fn allow(subjects: &[&str], permissions: &[Permission]) -> Self {
        Ace {
            action: SecurityAction::Allow,
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            permissions: permissions.to_vec(),
        }
    }

    pub fn deny(subjects: &[&str], permissions: &[Permission]) -> Self {
        Ace {
            action: SecurityAction::Deny,
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            permissions: permissions.to_vec(),
        }
    }

    fn matches(&self, subject: &str, permission: Permission) -> bool {
        self.permissions.contains(&permission)
            && self
                .subjects
                .iter()
                .any(|s| s == subject || s == EVERYONE)
    }
}

/// Access control descriptor attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acd {
    pub inherit: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<Ace>,
}

impl Default for Acd {
    fn default() -> Self {
        Acd {
            inherit: true,
            entries: Vec::new(),
        }
    }
}

impl Acd {
    pub fn is_trivial(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scope of a permission check relative to the addressed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckScope {
    pub this: bool,
    pub parent: bool,
    pub descendants: bool,
}

impl CheckScope {
    pub const THIS: CheckScope = CheckScope {
        this: true,
        parent: false,
        descendants: false,
    };
    pub const PARENT: CheckScope = CheckScope {
        this: false,
        parent: true,
        descendants: false,
    };
    pub const THIS_AND_DESCENDANTS: CheckScope = CheckScope {
        this: true,
        parent: false,
        descendants: true,
    };
}

/// Outcome of evaluating one level's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelDecision {
    Allow,
    Deny,
    Unresolved,
}

fn evaluate_level(acd: &Acd, subject: &str, permission: Permission) -> LevelDecision {
    let mut allowed = false;
    for ace in &acd.entries {
        if !ace.matches(subject, permission) {
            continue;
        }
        match ace.action {
            SecurityAction::Deny => return LevelDecision::Deny,
            SecurityAction::Allow => allowed = true,
        }
    }
    if allowed {
        LevelDecision::Allow
    } else {
        LevelDecision::Unresolved
    }
}

/// Checks a permission against a chain of descriptors ordered from the
/// addressed node toward the root.
///
/// Deny overrides allow at the deciding level; levels past a non-inheriting
/// descriptor are ignored; an unresolved chain denies.
pub fn check_permission<'a>(
    acd_chain: impl IntoIterator<Item = &'a Acd>,
    subject: &str,
    permission: Permission,
) -> bool {
    for acd in acd_chain {
        match evaluate_level(acd, subject, permission) {
            LevelDecision::Allow => return true,
            LevelDecision::Deny => return false,
            LevelDecision::Unresolved => {
                if !acd.inherit {
                    return false;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acd(inherit: bool, entries: Vec<Ace>) -> Acd {
        Acd { inherit, entries }
    }

    #[test]
    fn test_trivial_chain_denies() {
        let chain = [Acd::default(), Acd::default()];
        assert!(!check_permission(&chain, "alice", Permission::Read));
    }

    #[test]
    fn test_allow_at_root_inherited() {
        let chain = [
            Acd::default(),
            acd(true, vec![Ace::allow(&[EVERYONE], &[Permission::Read])]),
        ];
        assert!(check_permission(&chain, "alice", Permission::Read));
        assert!(!check_permission(&chain, "alice", Permission::Write));
    }

    #[test]
    fn test_deny_overrides_allow_same_level() {
        let chain = [acd(
            true,
            vec![
                Ace::allow(&["alice"], &[Permission::Write]),
                Ace::deny(&["alice"], &[Permission::Write]),
            ],
        )];
        assert!(!check_permission(&chain, "alice", Permission::Write));
    }

    #[test]
    fn test_nearest_level_wins() {
        // Node allows what the root denies: node-level entry decides first.
        let chain = [
            acd(true, vec![Ace::allow(&["bob"], &[Permission::Remove])]),
            acd(true, vec![Ace::deny(&[EVERYONE], &[Permission::Remove])]),
        ];
        assert!(check_permission(&chain, "bob", Permission::Remove));
        assert!(!check_permission(&chain, "mallory", Permission::Remove));
    }

    #[test]
    fn test_inherit_false_stops_walk() {
        let chain = [
            acd(false, vec![Ace::allow(&["bob"], &[Permission::Read])]),
            acd(true, vec![Ace::allow(&[EVERYONE], &[Permission::Write])]),
        ];
        assert!(check_permission(&chain, "bob", Permission::Read));
        // Write would be allowed one level up, but inherit=false cuts it off.
        assert!(!check_permission(&chain, "bob", Permission::Write));
    }

    #[test]
    fn test_everyone_matches_any_subject() {
        let chain = [acd(true, vec![Ace::allow(&[EVERYONE], &[Permission::Use])])];
        assert!(check_permission(&chain, "whoever", Permission::Use));
    }
}
