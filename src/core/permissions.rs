// src/core/permissions.rs

//! Principals, role-based permission checks, and field-level filtering.

use crate::core::errors::OlivineError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use wildmatch::WildMatch;

/// The built-in role granted when a credential carries no role set.
pub const DEFAULT_ROLE: &str = "USER";
/// Members of this role bypass every map-level rule.
pub const ADMIN_ROLE: &str = "ADMIN";

bitflags! {
    /// Actions a principal may perform against a map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permission: u8 {
        const READ   = 0b0001;
        const PUT    = 0b0010;
        const REMOVE = 0b0100;
        const MANAGE = 0b1000;
    }
}

impl Permission {
    pub fn is_write(self) -> bool {
        self.intersects(Permission::PUT | Permission::REMOVE | Permission::MANAGE)
    }
}

/// Identity record extracted from a verified credential. Immutable within a
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    /// Sorted role set; never empty.
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub claims: serde_json::Map<String, Value>,
}

impl Principal {
    /// Normalizes a raw credential: a missing role set becomes `{USER}` and a
    /// missing user id is filled from the credential subject.
    pub fn normalized(
        subject: String,
        user_id: Option<String>,
        roles: Vec<String>,
        claims: serde_json::Map<String, Value>,
    ) -> Self {
        let mut role_set: BTreeSet<String> = roles.into_iter().filter(|r| !r.is_empty()).collect();
        if role_set.is_empty() {
            role_set.insert(DEFAULT_ROLE.to_string());
        }
        Self {
            user_id: user_id.filter(|id| !id.is_empty()).unwrap_or(subject),
            roles: role_set,
            claims,
        }
    }

    /// The role signature: sorted roles joined with commas. Sessions with the
    /// same signature share permissions, which is what makes per-bucket
    /// serialization caching sound.
    pub fn role_signature(&self) -> String {
        if self.roles.is_empty() {
            DEFAULT_ROLE.to_string()
        } else {
            self.roles.iter().cloned().collect::<Vec<_>>().join(",")
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(ADMIN_ROLE)
    }
}

/// One configured grant: which actions a role may perform on matching maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub role: String,
    /// Glob pattern over map names.
    pub maps: String,
    pub actions: Vec<PermissionAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionAction {
    Read,
    Put,
    Remove,
    Manage,
}

impl From<PermissionAction> for Permission {
    fn from(action: PermissionAction) -> Self {
        match action {
            PermissionAction::Read => Permission::READ,
            PermissionAction::Put => Permission::PUT,
            PermissionAction::Remove => Permission::REMOVE,
            PermissionAction::Manage => Permission::MANAGE,
        }
    }
}

/// One field-visibility restriction: fields stripped from event and query
/// payloads for a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub role: String,
    pub maps: String,
    pub denied_fields: Vec<String>,
}

/// The node's permission policy, assembled from configuration.
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    rules: Vec<PermissionRule>,
    field_rules: Vec<FieldRule>,
    /// When set, only matching map names are served at all.
    allowed_maps: Option<Vec<String>>,
    mutations_enabled: bool,
    subscriptions_enabled: bool,
}

impl PermissionPolicy {
    pub fn new(
        rules: Vec<PermissionRule>,
        field_rules: Vec<FieldRule>,
        allowed_maps: Option<Vec<String>>,
        mutations_enabled: bool,
        subscriptions_enabled: bool,
    ) -> Self {
        Self {
            rules,
            field_rules,
            allowed_maps,
            mutations_enabled,
            subscriptions_enabled,
        }
    }

    /// A permissive policy used by tests and single-user setups.
    pub fn permissive() -> Self {
        Self {
            rules: Vec::new(),
            field_rules: Vec::new(),
            allowed_maps: None,
            mutations_enabled: true,
            subscriptions_enabled: true,
        }
    }

    pub fn subscriptions_enabled(&self) -> bool {
        self.subscriptions_enabled
    }

    pub fn mutations_enabled(&self) -> bool {
        self.mutations_enabled
    }

    /// True if `map` passes the allowlist (or no allowlist is set).
    pub fn map_allowed(&self, map: &str) -> bool {
        match &self.allowed_maps {
            Some(patterns) => patterns.iter().any(|p| WildMatch::new(p).matches(map)),
            None => true,
        }
    }

    /// Full permission check for one action against one map.
    pub fn check(
        &self,
        principal: Option<&Principal>,
        map: &str,
        action: Permission,
    ) -> Result<(), OlivineError> {
        if !self.map_allowed(map) {
            return Err(OlivineError::MapNotAllowed(map.to_string()));
        }
        if action.is_write() && !self.mutations_enabled {
            return Err(OlivineError::MutationsDisabled);
        }
        let Some(principal) = principal else {
            return Err(OlivineError::AuthRequired);
        };
        if principal.is_admin() {
            return Ok(());
        }
        if self.rules.is_empty() {
            return Ok(());
        }
        let granted = self
            .rules
            .iter()
            .filter(|rule| {
                principal.roles.contains(&rule.role) && WildMatch::new(&rule.maps).matches(map)
            })
            .fold(Permission::empty(), |acc, rule| {
                rule.actions
                    .iter()
                    .fold(acc, |acc, action| acc | Permission::from(*action))
            });
        if granted.contains(action) {
            Ok(())
        } else {
            Err(OlivineError::AccessDenied)
        }
    }

    /// Field names hidden from `role_signature` holders on `map`.
    fn denied_fields(&self, principal: Option<&Principal>, map: &str) -> Vec<&str> {
        let Some(principal) = principal else {
            return Vec::new();
        };
        if principal.is_admin() {
            return Vec::new();
        }
        self.field_rules
            .iter()
            .filter(|rule| {
                principal.roles.contains(&rule.role) && WildMatch::new(&rule.maps).matches(map)
            })
            .flat_map(|rule| rule.denied_fields.iter().map(String::as_str))
            .collect()
    }

    /// Strips disallowed fields from a record value. Non-object values pass
    /// through untouched.
    pub fn filter_value(&self, principal: Option<&Principal>, map: &str, value: &Value) -> Value {
        let denied = self.denied_fields(principal, map);
        if denied.is_empty() {
            return value.clone();
        }
        strip_fields(value, &denied)
    }

    /// True if any field rule applies for this principal on this map.
    pub fn has_field_rules(&self, principal: Option<&Principal>, map: &str) -> bool {
        !self.denied_fields(principal, map).is_empty()
    }
}

fn strip_fields(value: &Value, denied: &[&str]) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(name, _)| !denied.contains(&name.as_str()))
                .map(|(name, v)| (name.clone(), v.clone()))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| strip_fields(v, denied)).collect())
        }
        other => other.clone(),
    }
}

