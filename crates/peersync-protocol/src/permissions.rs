/// Scoped permissions granted to a peer.
///
/// A scope is `*`, `repo:<id>`, `plan:<id>`, `!repo:<id>` or `!plan:<id>`.
/// Exclusions win over every inclusion, including the wildcard.
use std::collections::{HashMap, HashSet};

use crate::config::{Permission, PermissionType};

/// Any of these allows listing a repo or plan id and guid.
pub const PERMS_CAN_VIEW_RESOURCES: &[PermissionType] = &[
    PermissionType::ReadOperations,
    PermissionType::ReadConfig,
    PermissionType::ReadWriteConfig,
];

pub const PERMS_CAN_VIEW_CONFIGURATION: &[PermissionType] =
    &[PermissionType::ReadConfig, PermissionType::ReadWriteConfig];

pub const PERMS_CAN_WRITE_CONFIGURATION: &[PermissionType] = &[PermissionType::ReadWriteConfig];

pub const PERMS_CAN_VIEW_OPERATIONS: &[PermissionType] = &[PermissionType::ReadOperations];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid scope format: {0:?}")]
pub struct InvalidScope(pub String);

#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    wildcard: bool,
    repos: HashSet<String>,
    plans: HashSet<String>,
    excluded_repos: HashSet<String>,
    excluded_plans: HashSet<String>,
}

impl ScopeSet {
    pub fn parse<S: AsRef<str>>(scopes: &[S]) -> Result<Self, InvalidScope> {
        let mut set = ScopeSet::default();
        for scope in scopes {
            let scope = scope.as_ref();
            if scope == "*" {
                set.wildcard = true;
            } else if let Some(id) = non_empty_suffix(scope, "!repo:") {
                set.excluded_repos.insert(id.to_string());
            } else if let Some(id) = non_empty_suffix(scope, "!plan:") {
                set.excluded_plans.insert(id.to_string());
            } else if let Some(id) = non_empty_suffix(scope, "repo:") {
                set.repos.insert(id.to_string());
            } else if let Some(id) = non_empty_suffix(scope, "plan:") {
                set.plans.insert(id.to_string());
            } else {
                return Err(InvalidScope(scope.to_string()));
            }
        }
        Ok(set)
    }

    pub fn contains_repo(&self, repo_id: &str) -> bool {
        !self.excluded_repos.contains(repo_id) && (self.wildcard || self.repos.contains(repo_id))
    }

    pub fn contains_plan(&self, plan_id: &str) -> bool {
        !self.excluded_plans.contains(plan_id) && (self.wildcard || self.plans.contains(plan_id))
    }

    pub fn merge(&mut self, other: ScopeSet) {
        self.wildcard |= other.wildcard;
        self.repos.extend(other.repos);
        self.plans.extend(other.plans);
        self.excluded_repos.extend(other.excluded_repos);
        self.excluded_plans.extend(other.excluded_plans);
    }
}

fn non_empty_suffix<'a>(scope: &'a str, prefix: &str) -> Option<&'a str> {
    scope.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

/// Every scope granted to one peer, grouped by permission type.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    perms: HashMap<PermissionType, ScopeSet>,
}

impl PermissionSet {
    /// Grants of the same type are merged.
    pub fn new(permissions: &[Permission]) -> Result<Self, InvalidScope> {
        let mut perms: HashMap<PermissionType, ScopeSet> = HashMap::new();
        for perm in permissions {
            let scopes = ScopeSet::parse(&perm.scopes)?;
            perms.entry(perm.kind).or_default().merge(scopes);
        }
        Ok(Self { perms })
    }

    /// True if any of `types` grants access to the repo.
    pub fn check_repo(&self, repo_id: &str, types: &[PermissionType]) -> bool {
        types.iter().any(|t| {
            self.perms
                .get(t)
                .is_some_and(|scopes| scopes.contains_repo(repo_id))
        })
    }

    /// True if any of `types` grants access to the plan.
    pub fn check_plan(&self, plan_id: &str, types: &[PermissionType]) -> bool {
        types.iter().any(|t| {
            self.perms
                .get(t)
                .is_some_and(|scopes| scopes.contains_plan(plan_id))
        })
    }
}
