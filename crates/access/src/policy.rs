// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Roles file: parsing, validation, and permission resolution.
//!
//! Roles may inherit from other roles; the graph must be a DAG and
//! cycles are rejected at load time with the offending path named.
//! Resource ids support a literal form and a `*` wildcard.

use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid roles file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate role name: {0}")]
    DuplicateRole(String),

    #[error("role {role} inherits unknown role {missing}")]
    UnknownParent { role: String, missing: String },

    #[error("role inheritance cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// One grant or denial.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permission {
    pub resource_type: String,
    pub action: String,
    /// Literal id or `*`; absent means any resource of the type.
    #[serde(default)]
    pub resource_id: Option<String>,
    pub effect: Effect,
    /// Opaque condition tag evaluated by outer layers; the gate treats
    /// a present condition as non-matching.
    #[serde(default)]
    pub condition: Option<String>,
}

impl Permission {
    /// Does this entry cover (resource_type, resource_id, action)?
    pub fn covers(&self, resource_type: &str, resource_id: &str, action: &str) -> bool {
        if self.condition.is_some() {
            return false;
        }
        if self.resource_type != "*" && self.resource_type != resource_type {
            return false;
        }
        if self.action != "*" && self.action != action {
            return false;
        }
        match self.resource_id.as_deref() {
            None | Some("*") => true,
            Some(literal) => literal == resource_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub inherits: Vec<String>,
    #[serde(default, rename = "permission")]
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicyFile {
    #[serde(default)]
    version: u64,
    #[serde(default, rename = "role")]
    roles: Vec<Role>,
}

/// A validated set of roles.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    pub version: u64,
    roles: IndexMap<String, Role>,
}

impl PolicySet {
    pub fn empty() -> Self {
        Self { version: 0, roles: IndexMap::new() }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, PolicyError> {
        let raw: RawPolicyFile = toml::from_str(text)?;
        let mut roles = IndexMap::new();
        for role in raw.roles {
            if roles.contains_key(&role.name) {
                return Err(PolicyError::DuplicateRole(role.name));
            }
            roles.insert(role.name.clone(), role);
        }
        let set = Self { version: raw.version, roles };
        set.validate()?;
        Ok(set)
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    /// All permissions of a role, inherited ones included. Unknown role
    /// names resolve to nothing.
    pub fn resolved_permissions(&self, name: &str) -> Vec<&Permission> {
        let mut out = Vec::new();
        let mut visited = Vec::new();
        self.collect(name, &mut visited, &mut out);
        out
    }

    fn collect<'a>(
        &'a self,
        name: &str,
        visited: &mut Vec<String>,
        out: &mut Vec<&'a Permission>,
    ) {
        if visited.iter().any(|v| v == name) {
            return;
        }
        visited.push(name.to_string());
        let Some(role) = self.roles.get(name) else {
            return;
        };
        for parent in &role.inherits {
            self.collect(parent, visited, out);
        }
        out.extend(role.permissions.iter());
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for role in self.roles.values() {
            for parent in &role.inherits {
                if !self.roles.contains_key(parent) {
                    return Err(PolicyError::UnknownParent {
                        role: role.name.clone(),
                        missing: parent.clone(),
                    });
                }
            }
        }
        // Cycle detection: DFS with an explicit path for the error.
        for start in self.roles.keys() {
            let mut path = Vec::new();
            self.walk(start, &mut path)?;
        }
        Ok(())
    }

    fn walk(&self, name: &str, path: &mut Vec<String>) -> Result<(), PolicyError> {
        if let Some(at) = path.iter().position(|p| p == name) {
            let mut cycle: Vec<String> = path[at..].to_vec();
            cycle.push(name.to_string());
            return Err(PolicyError::Cycle { path: cycle });
        }
        path.push(name.to_string());
        if let Some(role) = self.roles.get(name) {
            for parent in &role.inherits {
                self.walk(parent, path)?;
            }
        }
        path.pop();
        Ok(())
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
