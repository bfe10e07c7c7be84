//! Attribute diffs between declared and recorded state
//!
//! Values flow through here on their way to the plan display, so sensitive
//! ones are masked at the source: [`AttributeChange`]'s `Display` never
//! prints a value derived from a sensitive attribute.

use crate::error::{Error, Result};
use crate::output::MASK;
use crate::planner::{ExecutionPlan, PlannedAction, PlannedNode};
use crate::resource::{AttributeRef, ResourceDeclaration, Value};
use crate::state::StateStore;
use crate::types::{Attributes, Literal, ResourceKind};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Placeholder for a value that depends on a resource not yet applied
pub const UNKNOWN: &str = "(known after apply)";

/// A declared input after reference substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredValue {
    Known { value: Literal, sensitive: bool },
    /// Depends on an output that only exists after apply
    Unknown { sensitive: bool },
}

impl DesiredValue {
    pub fn known(value: Literal) -> Self {
        Self::Known {
            value,
            sensitive: false,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        match self {
            Self::Known { sensitive, .. } | Self::Unknown { sensitive } => *sensitive,
        }
    }

    pub fn value(&self) -> Option<&Literal> {
        match self {
            Self::Known { value, .. } => Some(value),
            Self::Unknown { .. } => None,
        }
    }

    fn mark_sensitive(self, sensitive: bool) -> Self {
        match self {
            Self::Known { value, sensitive: s } => Self::Known {
                value,
                sensitive: s || sensitive,
            },
            Self::Unknown { sensitive: s } => Self::Unknown {
                sensitive: s || sensitive,
            },
        }
    }
}

impl fmt::Display for DesiredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known {
                sensitive: true, ..
            }
            | Self::Unknown { sensitive: true } => f.write_str(MASK),
            Self::Known { value, .. } => write!(f, "{value}"),
            Self::Unknown { .. } => f.write_str(UNKNOWN),
        }
    }
}

pub type DesiredAttributes = BTreeMap<String, DesiredValue>;

/// Substitute references in a declaration's attributes
///
/// `lookup` answers each reference; the result is marked sensitive when the
/// referenced attribute is.
pub fn resolve_desired<F>(declaration: &ResourceDeclaration, mut lookup: F) -> DesiredAttributes
where
    F: FnMut(&AttributeRef) -> DesiredValue,
{
    declaration
        .attributes
        .iter()
        .map(|(field, value)| {
            let desired = match value {
                Value::Literal(literal) => DesiredValue::known(literal.clone()),
                Value::File(file) => DesiredValue::known(Literal::Str(file.text())),
                Value::Reference(reference) => {
                    lookup(reference).mark_sensitive(reference.is_sensitive())
                }
            };
            (field.clone(), desired)
        })
        .collect()
}

/// Substitute references with values recorded in state
///
/// Used once every dependency has been applied, so a missing entry or
/// attribute is an error rather than an unknown.
pub fn resolve_concrete(
    declaration: &ResourceDeclaration,
    state: &dyn StateStore,
) -> Result<Attributes> {
    let mut resolved = Attributes::new();

    for (field, value) in &declaration.attributes {
        let literal = match value {
            Value::Literal(literal) => literal.clone(),
            Value::File(file) => Literal::Str(file.text()),
            Value::Reference(reference) => state
                .get(&reference.target)?
                .and_then(|entry| entry.value(&reference.attribute).cloned())
                .ok_or_else(|| Error::MissingReferenceValue {
                    resource: declaration.id.clone(),
                    target: reference.target.clone(),
                    attribute: reference.attribute.clone(),
                })?,
        };
        resolved.insert(field.clone(), literal);
    }

    Ok(resolved)
}

/// Fields of `declaration` whose values come from sensitive attributes
pub fn sensitive_fields(declaration: &ResourceDeclaration) -> BTreeSet<&str> {
    declaration
        .references()
        .filter(|(_, reference)| reference.is_sensitive())
        .map(|(field, _)| field)
        .collect()
}

/// One attribute that differs between recorded and desired state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeChange {
    pub attribute: String,
    /// `None` when the attribute was not set before
    pub old: Option<Literal>,
    /// `None` when the attribute is no longer declared
    pub new: Option<DesiredValue>,
    pub sensitive: bool,
    /// Changing this field forces the resource to be replaced
    pub forces_replace: bool,
}

impl AttributeChange {
    fn show_old(&self) -> String {
        match &self.old {
            None => "(unset)".to_string(),
            Some(_) if self.sensitive => MASK.to_string(),
            Some(value) => value.to_string(),
        }
    }

    fn show_new(&self) -> String {
        match &self.new {
            None => "(unset)".to_string(),
            Some(value) if self.sensitive => value.clone().mark_sensitive(true).to_string(),
            Some(value) => value.to_string(),
        }
    }

    /// Previous and new value as strings, unmasked, for text diffs of
    /// non-sensitive documents. `None` if either side is sensitive or unknown.
    pub fn text_pair(&self) -> Option<(&str, &str)> {
        if self.sensitive {
            return None;
        }
        let old = self.old.as_ref()?.as_str()?;
        let new = self.new.as_ref()?.value()?.as_str()?;
        Some((old, new))
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.attribute, self.show_old(), self.show_new())?;
        if self.forces_replace {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

/// Compare desired inputs against the inputs recorded at last apply
///
/// With no previous record every desired attribute is an addition.
/// Unknown values always count as changed.
pub fn compute_changes(
    kind: ResourceKind,
    desired: &DesiredAttributes,
    previous: Option<&Attributes>,
) -> Vec<AttributeChange> {
    let schema = kind.schema();
    let empty = Attributes::new();
    let previous = previous.unwrap_or(&empty);

    let fields: BTreeSet<&String> = desired.keys().chain(previous.keys()).collect();
    let mut changes = Vec::new();

    for field in fields {
        let old = previous.get(field);
        let new = desired.get(field);
        let unchanged = match (old, new) {
            (Some(old), Some(DesiredValue::Known { value, .. })) => old == value,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            continue;
        }

        changes.push(AttributeChange {
            attribute: field.clone(),
            old: old.cloned(),
            new: new.cloned(),
            sensitive: new.is_some_and(DesiredValue::is_sensitive) || schema.is_sensitive(field),
            forces_replace: schema.is_immutable(field),
        });
    }

    changes
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Number of resources to create
    pub additions: usize,
    /// Number of resources to delete
    pub removals: usize,
    /// Number of resources to update in place
    pub modifications: usize,
    /// Number of resources to destroy and recreate
    pub replacements: usize,
    /// Number of resources left as they are
    pub unchanged: usize,
}

impl DiffSummary {
    /// Create a summary from a plan
    pub fn from_plan(plan: &ExecutionPlan) -> Self {
        let mut summary = Self::default();
        for node in plan.all_nodes() {
            match node.action {
                PlannedAction::Create => summary.additions += 1,
                PlannedAction::Delete => summary.removals += 1,
                PlannedAction::Update => summary.modifications += 1,
                PlannedAction::Replace { .. } => summary.replacements += 1,
                PlannedAction::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.removals + self.modifications + self.replacements
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to replace, {} to destroy",
            self.additions, self.modifications, self.replacements, self.removals
        )
    }
}

/// Group planned changes by resource kind
pub fn group_by_kind(plan: &ExecutionPlan) -> BTreeMap<ResourceKind, Vec<&PlannedNode>> {
    let mut groups: BTreeMap<ResourceKind, Vec<&PlannedNode>> = BTreeMap::new();
    for node in plan.all_nodes().filter(|n| n.action.is_change()) {
        groups.entry(node.id.kind).or_default().push(node);
    }
    groups
}
