//! Reference resolution - turns attribute references into graph edges

use crate::error::{Error, Result, UnresolvedReason};
use crate::resource::{AttributeRef, Configuration};
use crate::types::ResourceId;
use std::fmt;

/// A directed edge: `(from, field)` consumes `(to, attribute)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    pub from: ResourceId,
    pub field: String,
    pub to: ResourceId,
    pub attribute: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from, self.field, self.to, self.attribute
        )
    }
}

/// Why `reference` cannot be resolved against `config`, if it cannot
pub fn unresolved_reason(config: &Configuration, reference: &AttributeRef) -> Option<UnresolvedReason> {
    let Some(target) = config.get(&reference.target) else {
        return Some(UnresolvedReason::UndeclaredResource);
    };
    let schema = reference.target.kind.schema();
    let attribute = reference.attribute.as_str();

    if !schema.has_attribute(attribute) {
        return Some(UnresolvedReason::UnknownAttribute);
    }
    // Inputs are only known if declared; conditional outputs need their input
    if schema.is_input(attribute) && !target.attributes.contains_key(attribute) {
        return Some(UnresolvedReason::UnsetInput);
    }
    if let Some(input) = schema.output_condition(attribute)
        && !target.attributes.contains_key(input)
    {
        return Some(UnresolvedReason::ConditionalOutput(input));
    }
    None
}

/// Scan every attribute of every declaration and emit one [`Reference`] per
/// reference expression.
///
/// Fails on the first reference whose target is not declared. Pure; the
/// result is in declaration order, then field order.
pub fn resolve_references(config: &Configuration) -> Result<Vec<Reference>> {
    let mut references = Vec::new();

    for declaration in config.declarations() {
        for (field, reference) in declaration.references() {
            if let Some(reason) = unresolved_reason(config, reference) {
                return Err(Error::UnresolvedReference {
                    from: declaration.id.clone(),
                    field: field.to_string(),
                    target: reference.target.clone(),
                    attribute: reference.attribute.clone(),
                    reason,
                });
            }
            references.push(Reference {
                from: declaration.id.clone(),
                field: field.to_string(),
                to: reference.target.clone(),
                attribute: reference.attribute.clone(),
            });
        }
    }

    log::debug!(
        "resolved {} reference(s) across {} declaration(s)",
        references.len(),
        config.len()
    );
    Ok(references)
}

/// Check that every named output points at a declared resource
pub fn check_outputs(config: &Configuration) -> Result<()> {
    for output in config.outputs() {
        let Some(reference) = output.value.as_reference() else {
            continue;
        };
        if let Some(reason) = unresolved_reason(config, reference) {
            return Err(Error::UnresolvedOutput {
                output: output.name.clone(),
                target: reference.target.clone(),
                attribute: reference.attribute.clone(),
                reason,
            });
        }
    }
    Ok(())
}
