//! Named outputs and masking of sensitive values

use crate::error::{Error, Result};
use crate::resource::{Configuration, Value};
use crate::state::StateStore;
use crate::types::Literal;
use serde::{Serialize, Serializer};
use std::fmt;

/// Placeholder shown instead of a sensitive value
pub const MASK: &str = "(sensitive value)";

/// Render a value, masking it when sensitive
pub fn masked(value: &Literal, sensitive: bool) -> String {
    if sensitive {
        MASK.to_string()
    } else {
        value.to_string()
    }
}

/// A declared output: `[output.<name>]` in configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDeclaration {
    pub name: String,
    pub value: Value,
    /// Explicitly marked sensitive; references to sensitive attributes are
    /// sensitive regardless
    pub sensitive: bool,
}

impl OutputDeclaration {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Whether the value must be masked
    pub fn is_sensitive(&self) -> bool {
        self.sensitive || self.value.as_reference().is_some_and(|r| r.is_sensitive())
    }
}

/// A secret value that only shows itself through [`SensitiveOutput::reveal`]
///
/// `Display`, `Debug` and `Serialize` all produce the mask, so the value
/// cannot leak through formatting or logging by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct SensitiveOutput(Literal);

impl SensitiveOutput {
    pub fn new(value: Literal) -> Self {
        Self(value)
    }

    /// The underlying value; callers must not log it
    pub fn reveal(&self) -> &Literal {
        &self.0
    }
}

impl fmt::Display for SensitiveOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl fmt::Debug for SensitiveOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveOutput({MASK})")
    }
}

impl Serialize for SensitiveOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(MASK)
    }
}

/// The value of an output after apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutputValue {
    Plain(Literal),
    Sensitive(SensitiveOutput),
}

impl OutputValue {
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Sensitive(_))
    }

    /// The value with masking lifted
    pub fn reveal(&self) -> &Literal {
        match self {
            Self::Plain(value) => value,
            Self::Sensitive(secret) => secret.reveal(),
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(value) => write!(f, "{value}"),
            Self::Sensitive(secret) => write!(f, "{secret}"),
        }
    }
}

/// One named output; `value` is `None` until its resource has been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub name: String,
    pub value: Option<OutputValue>,
}

fn evaluate(output: &OutputDeclaration, state: &dyn StateStore) -> Result<Option<OutputValue>> {
    let value = match &output.value {
        Value::Literal(literal) => Some(literal.clone()),
        Value::File(file) => Some(Literal::Str(file.text())),
        Value::Reference(reference) => state
            .get(&reference.target)?
            .and_then(|entry| entry.value(&reference.attribute).cloned()),
    };

    Ok(value.map(|v| {
        if output.is_sensitive() {
            OutputValue::Sensitive(SensitiveOutput::new(v))
        } else {
            OutputValue::Plain(v)
        }
    }))
}

/// Evaluate every declared output against recorded state
pub fn collect_outputs(config: &Configuration, state: &dyn StateStore) -> Result<Vec<OutputEntry>> {
    config
        .outputs()
        .iter()
        .map(|output| {
            Ok(OutputEntry {
                name: output.name.clone(),
                value: evaluate(output, state)?,
            })
        })
        .collect()
}

/// Evaluate a single output by name
pub fn output_value(
    config: &Configuration,
    state: &dyn StateStore,
    name: &str,
) -> Result<Option<OutputValue>> {
    let output = config
        .outputs()
        .iter()
        .find(|o| o.name == name)
        .ok_or_else(|| Error::UnknownOutput(name.to_string()))?;
    evaluate(output, state)
}
