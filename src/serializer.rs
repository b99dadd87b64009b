//! Response shaping.
//!
//! Every entity that leaves the API goes through [`shape`], which strips the
//! serialized value down to the fields unlocked by the caller's groups. A
//! group is either a permission identifier held by the caller or the
//! synthetic OWNER group injected when the caller owns the value. Fields are
//! whitelisted per entity in a static [`FieldRule`] table; anything not
//! listed never reaches a client, which makes these tables the
//! confidentiality boundary of the API.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;

/// Synthetic group granted to a caller that owns the value being shaped.
pub const OWNER_GROUP: &str = "OWNER";

/// Capability trait for resources with a single owning user.
pub trait HasOwner {
    fn owner_id(&self) -> Uuid;
}

/// True when `user_id` owns the resource. Shared by authorization decisions
/// ("edit own post") and by the serializer's OWNER group injection.
pub fn is_owned_by(resource: &impl HasOwner, user_id: Uuid) -> bool {
    resource.owner_id() == user_id
}

/// One row of an entity's visibility table.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: &'static str,
    /// `None` means the field is visible to everyone.
    pub groups: Option<&'static [&'static str]>,
    /// Hide the field entirely when its serialized value is null. An absent
    /// field stays absent either way.
    pub exclude_if_null: bool,
    /// Visibility table applied to the field's value (object or array of
    /// objects) after the field itself is admitted.
    pub nested: Option<fn() -> &'static [FieldRule]>,
}

impl FieldRule {
    pub const fn always(field: &'static str) -> Self {
        Self {
            field,
            groups: None,
            exclude_if_null: false,
            nested: None,
        }
    }

    pub const fn grouped(field: &'static str, groups: &'static [&'static str]) -> Self {
        Self {
            field,
            groups: Some(groups),
            exclude_if_null: false,
            nested: None,
        }
    }

    pub const fn exclude_if_null(mut self) -> Self {
        self.exclude_if_null = true;
        self
    }

    pub const fn nested(mut self, rules: fn() -> &'static [FieldRule]) -> Self {
        self.nested = Some(rules);
        self
    }

    fn visible_to(&self, groups: &HashSet<String>) -> bool {
        match self.groups {
            None => true,
            Some(required) => required.iter().any(|group| groups.contains(*group)),
        }
    }
}

/// An entity with a visibility table.
pub trait Shaped: Serialize {
    fn visibility() -> &'static [FieldRule];

    /// Owner of this value, when the entity has one.
    fn owner(&self) -> Option<Uuid> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    /// Groups granted unconditionally for this response.
    pub groups: Vec<String>,
    /// Append the caller's permission identifiers as groups, 1:1.
    pub include_permission_groups: bool,
}

impl SerializeOptions {
    pub fn with_permission_groups() -> Self {
        Self {
            groups: Vec::new(),
            include_permission_groups: true,
        }
    }
}

/// Shape a single entity for the given caller.
pub fn shape<T: Shaped>(
    value: &T,
    options: &SerializeOptions,
    caller: Option<&AuthUser>,
) -> AppResult<Value> {
    let groups = resolved_groups(options, caller);
    shape_with_groups(value, &groups, caller)
}

/// Shape a slice element-wise with the same options. The OWNER group is
/// decided per element, so a page can mix the caller's own resources with
/// other users' resources.
pub fn shape_many<T: Shaped>(
    values: &[T],
    options: &SerializeOptions,
    caller: Option<&AuthUser>,
) -> AppResult<Value> {
    let groups = resolved_groups(options, caller);
    let shaped = values
        .iter()
        .map(|value| shape_with_groups(value, &groups, caller))
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Value::Array(shaped))
}

/// Missing value at the top level serializes as an empty object.
pub fn shape_or_empty<T: Shaped>(
    value: Option<&T>,
    options: &SerializeOptions,
    caller: Option<&AuthUser>,
) -> AppResult<Value> {
    match value {
        Some(value) => shape(value, options, caller),
        None => Ok(Value::Object(Map::new())),
    }
}

fn resolved_groups(options: &SerializeOptions, caller: Option<&AuthUser>) -> HashSet<String> {
    let mut groups: HashSet<String> = options.groups.iter().cloned().collect();
    if options.include_permission_groups {
        if let Some(caller) = caller {
            groups.extend(caller.permissions.iter().cloned());
        }
    }
    groups
}

fn shape_with_groups<T: Shaped>(
    value: &T,
    base_groups: &HashSet<String>,
    caller: Option<&AuthUser>,
) -> AppResult<Value> {
    let mut groups = base_groups.clone();
    if let (Some(owner_id), Some(caller)) = (value.owner(), caller) {
        if caller.user.id == owner_id {
            groups.insert(OWNER_GROUP.to_string());
        }
    }

    let raw = serde_json::to_value(value)
        .map_err(|err| AppError::internal(format!("serialization failed: {err}")))?;
    Ok(apply_rules(raw, T::visibility(), &groups))
}

fn apply_rules(value: Value, rules: &[FieldRule], groups: &HashSet<String>) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| apply_rules(item, rules, groups))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for rule in rules {
                let Some(field_value) = map.get(rule.field) else {
                    continue;
                };
                if !rule.visible_to(groups) {
                    continue;
                }
                if rule.exclude_if_null && field_value.is_null() {
                    continue;
                }
                let mut shaped = field_value.clone();
                if let Some(nested) = rule.nested {
                    shaped = apply_rules(shaped, nested(), groups);
                }
                out.insert(rule.field.to_string(), shaped);
            }
            Value::Object(out)
        }
        // Primitives pass through unchanged.
        other => other,
    }
}
