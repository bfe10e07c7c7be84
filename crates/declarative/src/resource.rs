//! Resource model: typed declarations and per-kind schemas
//!
//! A [`ResourceDeclaration`] is the desired state of one remote object. Its
//! attribute values are literals, references to another resource's
//! attribute, or file contents loaded ahead of time. The [`KindSchema`] of
//! each [`ResourceKind`] says which attributes are accepted, which changes
//! force a replace, what the provider computes, and what must stay hidden.

use crate::error::{Error, Result};
use crate::output::{MASK, OutputDeclaration};
use crate::types::{Literal, ResourceId, ResourceKind};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

/// `${kind.name.attribute}`
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{([a-z_]+)\.([A-Za-z0-9_-]+)\.([a-z_]+)\}$").expect("static regex")
});

/// Static description of a resource kind
#[derive(Debug)]
pub struct KindSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    /// Inputs whose change forces destroy-then-create
    pub immutable: &'static [&'static str],
    /// Attributes computed by the provider
    pub outputs: &'static [&'static str],
    /// Outputs that must never be logged or shown unmasked
    pub sensitive: &'static [&'static str],
    /// Outputs only produced when the paired input is set
    pub conditional: &'static [(&'static str, &'static str)],
}

impl KindSchema {
    /// Whether `attribute` is a declarable input
    pub fn is_input(&self, attribute: &str) -> bool {
        self.required.contains(&attribute) || self.optional.contains(&attribute)
    }

    /// Whether `attribute` can be referenced (input or output)
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.is_input(attribute) || self.outputs.contains(&attribute)
    }

    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.contains(&attribute)
    }

    pub fn is_sensitive(&self, attribute: &str) -> bool {
        self.sensitive.contains(&attribute)
    }

    /// The input an output depends on, if the output is conditional
    pub fn output_condition(&self, attribute: &str) -> Option<&'static str> {
        self.conditional
            .iter()
            .find(|(output, _)| *output == attribute)
            .map(|(_, input)| *input)
    }

    /// Whether the provider-assigned identifier itself is secret
    pub fn remote_id_sensitive(&self) -> bool {
        self.is_sensitive("id")
    }

    /// `remote_id` as it may appear in messages and logs
    pub fn display_remote_id<'a>(&self, remote_id: &'a str) -> &'a str {
        if self.remote_id_sensitive() {
            MASK
        } else {
            remote_id
        }
    }
}

static USER: KindSchema = KindSchema {
    required: &["name"],
    optional: &["path", "force_destroy"],
    immutable: &[],
    outputs: &["arn", "unique_id"],
    sensitive: &[],
    conditional: &[],
};

static POLICY: KindSchema = KindSchema {
    required: &["name", "policy"],
    optional: &["path", "description"],
    immutable: &["name", "path", "description"],
    outputs: &["arn", "policy_id"],
    sensitive: &[],
    conditional: &[],
};

static ROLE: KindSchema = KindSchema {
    required: &["name", "assume_role_policy"],
    optional: &["path", "description"],
    immutable: &["name", "path"],
    outputs: &["arn", "unique_id"],
    sensitive: &[],
    conditional: &[],
};

static USER_POLICY_ATTACHMENT: KindSchema = KindSchema {
    required: &["user", "policy_arn"],
    optional: &[],
    immutable: &["user", "policy_arn"],
    outputs: &[],
    sensitive: &[],
    conditional: &[],
};

static ROLE_POLICY_ATTACHMENT: KindSchema = KindSchema {
    required: &["role", "policy_arn"],
    optional: &[],
    immutable: &["role", "policy_arn"],
    outputs: &[],
    sensitive: &[],
    conditional: &[],
};

static ACCESS_KEY: KindSchema = KindSchema {
    required: &["user"],
    optional: &["pgp_key", "status"],
    immutable: &["user", "pgp_key"],
    outputs: &["id", "secret", "key_fingerprint"],
    sensitive: &["id", "secret"],
    conditional: &[("key_fingerprint", "pgp_key")],
};

static LOGIN_PROFILE: KindSchema = KindSchema {
    required: &["user"],
    optional: &["pgp_key", "password_length", "password_reset_required"],
    immutable: &["user", "pgp_key", "password_length", "password_reset_required"],
    outputs: &["encrypted_password", "key_fingerprint"],
    sensitive: &["encrypted_password"],
    conditional: &[("key_fingerprint", "pgp_key")],
};

impl ResourceKind {
    /// Schema for this kind
    pub fn schema(&self) -> &'static KindSchema {
        match self {
            Self::User => &USER,
            Self::Policy => &POLICY,
            Self::Role => &ROLE,
            Self::UserPolicyAttachment => &USER_POLICY_ATTACHMENT,
            Self::RolePolicyAttachment => &ROLE_POLICY_ATTACHMENT,
            Self::AccessKey => &ACCESS_KEY,
            Self::LoginProfile => &LOGIN_PROFILE,
        }
    }
}

/// A pointer at another resource's attribute
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeRef {
    pub target: ResourceId,
    pub attribute: String,
}

impl AttributeRef {
    pub fn new(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }

    /// Whether the referenced attribute is sensitive on the target kind
    pub fn is_sensitive(&self) -> bool {
        self.target.kind.schema().is_sensitive(&self.attribute)
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.attribute)
    }
}

impl FromStr for AttributeRef {
    type Err = Error;

    /// Parse `${kind.name.attribute}` or the bare `kind.name.attribute`
    fn from_str(s: &str) -> Result<Self> {
        let wrapped;
        let expr = if s.starts_with("${") {
            s
        } else {
            wrapped = format!("${{{s}}}");
            &wrapped
        };

        let caps = REFERENCE.captures(expr).ok_or_else(|| Error::InvalidExpression {
            expression: s.to_string(),
            message: "expected `${kind.name.attribute}`".to_string(),
        })?;
        let kind: ResourceKind = caps[1].parse()?;
        Ok(Self::new(ResourceId::new(kind, &caps[2]), &caps[3]))
    }
}

/// Opaque file content, loaded by a [`FileLoader`](crate::context::FileLoader)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl FileContent {
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes,
        }
    }

    /// Content as text; invalid UTF-8 is replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Short content hash for display
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.bytes).to_hex();
        hash[..12].to_string()
    }
}

/// A declared attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Literal(Literal),
    Reference(AttributeRef),
    File(FileContent),
}

impl Value {
    /// Interpret a configuration string: a whole-value `${..}` expression is
    /// a reference, any other string is a literal.
    ///
    /// Partial interpolation (`"arn:${..}"`) is rejected.
    pub fn parse_str(s: &str) -> Result<Self> {
        if REFERENCE.is_match(s) {
            return Ok(Self::Reference(s.parse()?));
        }
        if s.contains("${") {
            return Err(Error::InvalidExpression {
                expression: s.to_string(),
                message: "a reference must be the entire value".to_string(),
            });
        }
        Ok(Self::Literal(Literal::Str(s.to_string())))
    }

    pub fn as_reference(&self) -> Option<&AttributeRef> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Literal> for Value {
    fn from(value: Literal) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Literal(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Literal(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Literal(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Literal(value.into())
    }
}

impl From<AttributeRef> for Value {
    fn from(value: AttributeRef) -> Self {
        Self::Reference(value)
    }
}

impl From<FileContent> for Value {
    fn from(value: FileContent) -> Self {
        Self::File(value)
    }
}

/// Desired state of one remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDeclaration {
    pub id: ResourceId,
    pub attributes: BTreeMap<String, Value>,
}

impl ResourceDeclaration {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(kind, name),
            attributes: BTreeMap::new(),
        }
    }

    /// Set an attribute (builder style)
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    /// Set an attribute to a reference expression (builder style)
    pub fn with_ref(self, attribute: impl Into<String>, expression: &str) -> Result<Self> {
        let reference: AttributeRef = expression.parse()?;
        Ok(self.with(attribute, reference))
    }

    pub fn kind(&self) -> ResourceKind {
        self.id.kind
    }

    /// References held by this declaration, as (field, reference)
    pub fn references(&self) -> impl Iterator<Item = (&str, &AttributeRef)> {
        self.attributes
            .iter()
            .filter_map(|(field, value)| value.as_reference().map(|r| (field.as_str(), r)))
    }

    /// Check attributes against the kind schema
    pub fn validate(&self) -> Result<()> {
        let schema = self.kind().schema();

        for attribute in self.attributes.keys() {
            if !schema.is_input(attribute) {
                return Err(Error::UnknownAttribute {
                    resource: self.id.clone(),
                    kind: self.kind(),
                    attribute: attribute.clone(),
                });
            }
        }

        for required in schema.required {
            if !self.attributes.contains_key(*required) {
                return Err(Error::MissingAttribute {
                    resource: self.id.clone(),
                    attribute: (*required).to_string(),
                });
            }
        }

        Ok(())
    }
}

/// A validated set of declarations, in declaration order
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    declarations: Vec<ResourceDeclaration>,
    index: HashMap<ResourceId, usize>,
    outputs: Vec<OutputDeclaration>,
}

impl Configuration {
    /// Build a configuration, rejecting duplicate identities and attributes
    /// the kind schema does not accept
    pub fn new(declarations: Vec<ResourceDeclaration>) -> Result<Self> {
        let mut index = HashMap::with_capacity(declarations.len());
        for (position, declaration) in declarations.iter().enumerate() {
            declaration.validate()?;
            if index.insert(declaration.id.clone(), position).is_some() {
                return Err(Error::DuplicateResource(declaration.id.clone()));
            }
        }

        Ok(Self {
            declarations,
            index,
            outputs: Vec::new(),
        })
    }

    /// Attach named outputs
    pub fn with_outputs(mut self, outputs: Vec<OutputDeclaration>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDeclaration> {
        self.index.get(id).map(|&i| &self.declarations[i])
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration order of an identity
    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn declarations(&self) -> &[ResourceDeclaration] {
        &self.declarations
    }

    pub fn outputs(&self) -> &[OutputDeclaration] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}
