//! Simulated IAM account
//!
//! Objects live in a TOML file keyed by remote id. Every call enforces the
//! referential rules of the real service: attachments need their user, role
//! and policy, a user keeps at most two access keys and one login profile,
//! and nothing can be deleted while something still hangs off it.

use anyhow::{Context, Result};
use declarative::{Attributes, Created, Literal, Provider, ProviderError, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Policies owned by the cloud vendor exist in every account
const MANAGED_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";
const MAX_ACCESS_KEYS: usize = 2;
const DEFAULT_PASSWORD_LENGTH: i64 = 20;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

// ============================================================================
// Account
// ============================================================================

/// One object in the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub kind: ResourceKind,
    /// Attributes as last written by create/update
    #[serde(default)]
    pub attributes: Attributes,
    /// Attributes the account computed
    #[serde(default)]
    pub outputs: Attributes,
}

/// Contents of the account file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    /// Mixed into every minted identifier so recreated objects get new ids
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub objects: BTreeMap<String, Object>,
}

impl Account {
    /// Load the account, or start an empty one if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read account file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse account file: {}", path.display()))
    }

    /// Save the account atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create account directory: {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize account")?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write account file: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace account file: {}", path.display()))
    }

    fn mint(&mut self, account_id: &str, seed: &str) -> blake3::OutputReader {
        self.serial += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(account_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(seed.as_bytes());
        hasher.update(&self.serial.to_le_bytes());
        hasher.finalize_xof()
    }

    fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = (&String, &Object)> {
        self.objects.iter().filter(move |(_, o)| o.kind == kind)
    }

    fn named(&self, kind: ResourceKind, name: &str) -> Option<&String> {
        self.of_kind(kind)
            .find(|(_, o)| text(&o.attributes, "name") == Some(name))
            .map(|(id, _)| id)
    }

    fn policy_exists(&self, arn: &str) -> bool {
        arn.starts_with(MANAGED_POLICY_PREFIX)
            || self
                .of_kind(ResourceKind::Policy)
                .any(|(_, o)| text(&o.outputs, "arn") == Some(arn))
    }

    /// Remote ids of objects whose `field` equals `value`
    fn referencing(&self, kinds: &[ResourceKind], field: &str, value: &str) -> Vec<String> {
        self.objects
            .iter()
            .filter(|(_, o)| kinds.contains(&o.kind) && text(&o.attributes, field) == Some(value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn user_dependents(&self, user: &str) -> Vec<String> {
        self.referencing(
            &[
                ResourceKind::AccessKey,
                ResourceKind::LoginProfile,
                ResourceKind::UserPolicyAttachment,
            ],
            "user",
            user,
        )
    }

    fn attachment(&self, kind: ResourceKind, owner_field: &str, owner: &str, arn: &str) -> Option<(&String, &Object)> {
        self.of_kind(kind).find(|(_, o)| {
            text(&o.attributes, owner_field) == Some(owner)
                && text(&o.attributes, "policy_arn") == Some(arn)
        })
    }

    fn get(&self, kind: ResourceKind, remote_id: &str) -> Result<&Object, ProviderError> {
        self.objects
            .get(remote_id)
            .filter(|o| o.kind == kind)
            .ok_or_else(|| {
                ProviderError::NotFound(format!("NoSuchEntity: {kind} {}", shown(kind, remote_id)))
            })
    }

    // ------------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------------

    fn create(
        &mut self,
        account_id: &str,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> Result<Created, ProviderError> {
        let (remote_id, outputs) = match kind {
            ResourceKind::User => {
                let name = required(attributes, "name")?;
                check_name(name, 64)?;
                let path = check_path(attributes)?;
                if self.named(kind, name).is_some() {
                    return Err(ProviderError::Conflict(format!(
                        "EntityAlreadyExists: user {name}"
                    )));
                }
                let id = format!("AIDA{}", encode(&mut self.mint(account_id, name), ID_ALPHABET, 17));
                let outputs = attrs([
                    ("arn", arn(account_id, "user", path, name)),
                    ("unique_id", id.clone()),
                ]);
                (id, outputs)
            }
            ResourceKind::Policy => {
                let name = required(attributes, "name")?;
                check_name(name, 128)?;
                let path = check_path(attributes)?;
                check_document("policy", required(attributes, "policy")?)?;
                let policy_arn = arn(account_id, "policy", path, name);
                if self.policy_exists(&policy_arn) {
                    return Err(ProviderError::Conflict(format!(
                        "EntityAlreadyExists: policy {policy_arn}"
                    )));
                }
                let id = format!("ANPA{}", encode(&mut self.mint(account_id, name), ID_ALPHABET, 17));
                (id.clone(), attrs([("arn", policy_arn), ("policy_id", id)]))
            }
            ResourceKind::Role => {
                let name = required(attributes, "name")?;
                check_name(name, 64)?;
                let path = check_path(attributes)?;
                check_document("assume_role_policy", required(attributes, "assume_role_policy")?)?;
                if self.named(kind, name).is_some() {
                    return Err(ProviderError::Conflict(format!(
                        "EntityAlreadyExists: role {name}"
                    )));
                }
                let id = format!("AROA{}", encode(&mut self.mint(account_id, name), ID_ALPHABET, 17));
                let outputs = attrs([
                    ("arn", arn(account_id, "role", path, name)),
                    ("unique_id", id.clone()),
                ]);
                (id, outputs)
            }
            ResourceKind::UserPolicyAttachment | ResourceKind::RolePolicyAttachment => {
                let (owner_kind, owner_field) = if kind == ResourceKind::UserPolicyAttachment {
                    (ResourceKind::User, "user")
                } else {
                    (ResourceKind::Role, "role")
                };
                let owner = required(attributes, owner_field)?;
                let policy_arn = required(attributes, "policy_arn")?;
                if self.named(owner_kind, owner).is_none() {
                    return Err(ProviderError::NotFound(format!(
                        "NoSuchEntity: {owner_field} {owner}"
                    )));
                }
                if !self.policy_exists(policy_arn) {
                    return Err(ProviderError::NotFound(format!(
                        "NoSuchEntity: policy {policy_arn}"
                    )));
                }
                // Attaching twice is a no-op
                if let Some((id, existing)) = self.attachment(kind, owner_field, owner, policy_arn) {
                    return Ok(Created {
                        remote_id: id.clone(),
                        attributes: existing.outputs.clone(),
                    });
                }
                let seed = format!("{owner}/{policy_arn}");
                let prefix = if owner_kind == ResourceKind::User { "UPAT" } else { "RPAT" };
                let id = format!("{prefix}{}", encode(&mut self.mint(account_id, &seed), ID_ALPHABET, 17));
                (id, Attributes::new())
            }
            ResourceKind::AccessKey => {
                let user = self.existing_user(attributes)?;
                check_status(attributes)?;
                let keys = self.referencing(&[kind], "user", user).len();
                if keys >= MAX_ACCESS_KEYS {
                    return Err(ProviderError::Conflict(format!(
                        "LimitExceeded: user {user} already has {keys} access keys"
                    )));
                }
                let mut reader = self.mint(account_id, user);
                let id = format!("AKIA{}", encode(&mut reader, ID_ALPHABET, 16));
                let mut outputs = attrs([
                    ("id", id.clone()),
                    ("secret", encode(&mut reader, SECRET_ALPHABET, 40)),
                ]);
                if let Some(key) = text(attributes, "pgp_key") {
                    outputs.insert("key_fingerprint".into(), fingerprint(key).into());
                }
                (id, outputs)
            }
            ResourceKind::LoginProfile => {
                let user = self.existing_user(attributes)?;
                let length = attributes
                    .get("password_length")
                    .and_then(Literal::as_int)
                    .unwrap_or(DEFAULT_PASSWORD_LENGTH);
                if !(6..=128).contains(&length) {
                    return Err(ProviderError::Rejected(format!(
                        "password_length must be between 6 and 128, got {length}"
                    )));
                }
                if !self.referencing(&[kind], "user", user).is_empty() {
                    return Err(ProviderError::Conflict(format!(
                        "EntityAlreadyExists: login profile for {user}"
                    )));
                }
                let mut reader = self.mint(account_id, user);
                let id = format!("LGPR{}", encode(&mut reader, ID_ALPHABET, 17));
                let mut outputs = attrs([(
                    "encrypted_password",
                    encode(&mut reader, SECRET_ALPHABET, length as usize * 4 / 3 + 4),
                )]);
                if let Some(key) = text(attributes, "pgp_key") {
                    outputs.insert("key_fingerprint".into(), fingerprint(key).into());
                }
                (id, outputs)
            }
        };

        self.objects.insert(
            remote_id.clone(),
            Object {
                kind,
                attributes: attributes.clone(),
                outputs: outputs.clone(),
            },
        );
        Ok(Created {
            remote_id,
            attributes: outputs,
        })
    }

    fn existing_user<'a>(&self, attributes: &'a Attributes) -> Result<&'a str, ProviderError> {
        let user = required(attributes, "user")?;
        if self.named(ResourceKind::User, user).is_none() {
            return Err(ProviderError::NotFound(format!("NoSuchEntity: user {user}")));
        }
        Ok(user)
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    fn update(
        &mut self,
        account_id: &str,
        kind: ResourceKind,
        remote_id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let current = self.get(kind, remote_id)?.clone();

        let schema = kind.schema();
        let frozen: Vec<&str> = schema
            .immutable
            .iter()
            .copied()
            .filter(|field| current.attributes.get(*field) != attributes.get(*field))
            .collect();
        if !frozen.is_empty() {
            return Err(ProviderError::Rejected(format!(
                "{kind} {}: {} cannot be changed in place",
                shown(kind, remote_id),
                frozen.join(", ")
            )));
        }

        let mut outputs = current.outputs.clone();
        match kind {
            ResourceKind::User => {
                let old_name = required(&current.attributes, "name")?;
                let name = required(attributes, "name")?;
                check_name(name, 64)?;
                let path = check_path(attributes)?;
                if name != old_name {
                    if self.named(kind, name).is_some() {
                        return Err(ProviderError::Conflict(format!(
                            "EntityAlreadyExists: user {name}"
                        )));
                    }
                    for id in self.user_dependents(old_name) {
                        if let Some(object) = self.objects.get_mut(&id) {
                            object.attributes.insert("user".into(), name.into());
                        }
                    }
                }
                outputs.insert("arn".into(), arn(account_id, "user", path, name).into());
            }
            ResourceKind::Policy => {
                check_document("policy", required(attributes, "policy")?)?;
            }
            ResourceKind::Role => {
                check_document("assume_role_policy", required(attributes, "assume_role_policy")?)?;
            }
            ResourceKind::AccessKey => check_status(attributes)?,
            ResourceKind::UserPolicyAttachment
            | ResourceKind::RolePolicyAttachment
            | ResourceKind::LoginProfile => {}
        }

        self.objects.insert(
            remote_id.to_string(),
            Object {
                kind,
                attributes: attributes.clone(),
                outputs: outputs.clone(),
            },
        );
        Ok(outputs)
    }

    // ------------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------------

    fn delete(&mut self, kind: ResourceKind, remote_id: &str) -> Result<(), ProviderError> {
        let current = self.get(kind, remote_id)?.clone();

        let blocking = match kind {
            ResourceKind::User => {
                let name = required(&current.attributes, "name")?;
                let dependents = self.user_dependents(name);
                let force = current
                    .attributes
                    .get("force_destroy")
                    .and_then(Literal::as_bool)
                    .unwrap_or(false);
                if force {
                    for id in &dependents {
                        if let Some(object) = self.objects.remove(id) {
                            log::debug!(
                                "Removing {} {} along with user {name}",
                                object.kind,
                                shown(object.kind, id)
                            );
                        }
                    }
                    Vec::new()
                } else {
                    dependents
                }
            }
            ResourceKind::Policy => match text(&current.outputs, "arn") {
                Some(policy_arn) => self.referencing(
                    &[
                        ResourceKind::UserPolicyAttachment,
                        ResourceKind::RolePolicyAttachment,
                    ],
                    "policy_arn",
                    policy_arn,
                ),
                None => Vec::new(),
            },
            ResourceKind::Role => match text(&current.attributes, "name") {
                Some(name) => self.referencing(&[ResourceKind::RolePolicyAttachment], "role", name),
                None => Vec::new(),
            },
            _ => Vec::new(),
        };

        if !blocking.is_empty() {
            return Err(ProviderError::Conflict(format!(
                "DeleteConflict: {kind} {} still has {} dependent object(s)",
                shown(kind, remote_id),
                blocking.len()
            )));
        }
        self.objects.remove(remote_id);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Remote id for messages; access key ids are secret
fn shown(kind: ResourceKind, remote_id: &str) -> &str {
    kind.schema().display_remote_id(remote_id)
}

fn text<'a>(attributes: &'a Attributes, key: &str) -> Option<&'a str> {
    attributes.get(key).and_then(Literal::as_str)
}

fn required<'a>(attributes: &'a Attributes, key: &str) -> Result<&'a str, ProviderError> {
    text(attributes, key)
        .ok_or_else(|| ProviderError::Rejected(format!("missing string attribute `{key}`")))
}

fn attrs<const N: usize>(pairs: [(&str, String); N]) -> Attributes {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), Literal::Str(v)))
        .collect()
}

fn arn(account_id: &str, segment: &str, path: &str, name: &str) -> String {
    format!("arn:aws:iam::{account_id}:{segment}{path}{name}")
}

fn encode(reader: &mut blake3::OutputReader, alphabet: &[u8], len: usize) -> String {
    let mut bytes = vec![0u8; len];
    reader.fill(&mut bytes);
    bytes
        .iter()
        .map(|b| char::from(alphabet[usize::from(*b) % alphabet.len()]))
        .collect()
}

fn fingerprint(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex()[..40].to_string()
}

fn check_name(name: &str, max: usize) -> Result<(), ProviderError> {
    let valid = !name.is_empty()
        && name.len() <= max
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+=,.@_-".contains(c));
    if valid {
        Ok(())
    } else {
        Err(ProviderError::Rejected(format!("ValidationError: invalid name `{name}`")))
    }
}

fn check_path(attributes: &Attributes) -> Result<&str, ProviderError> {
    let path = text(attributes, "path").unwrap_or("/");
    if path.starts_with('/') && path.ends_with('/') && path.len() <= 512 {
        Ok(path)
    } else {
        Err(ProviderError::Rejected(format!(
            "ValidationError: path `{path}` must begin and end with `/`"
        )))
    }
}

fn check_document(field: &str, document: &str) -> Result<(), ProviderError> {
    let value: serde_json::Value = serde_json::from_str(document).map_err(|e| {
        ProviderError::Rejected(format!("MalformedPolicyDocument: {field}: {e}"))
    })?;
    if value.get("Statement").is_none() {
        return Err(ProviderError::Rejected(format!(
            "MalformedPolicyDocument: {field}: missing `Statement`"
        )));
    }
    Ok(())
}

fn check_status(attributes: &Attributes) -> Result<(), ProviderError> {
    match text(attributes, "status") {
        None | Some("Active" | "Inactive") => Ok(()),
        Some(other) => Err(ProviderError::Rejected(format!(
            "status must be Active or Inactive, got `{other}`"
        ))),
    }
}

// ============================================================================
// Provider
// ============================================================================

/// File-persisted IAM account implementing [`Provider`]
#[derive(Debug)]
pub struct SimulatedIam {
    path: PathBuf,
    account_id: String,
    account: Mutex<Account>,
}

impl SimulatedIam {
    /// Open the account file at `path`
    pub fn open(path: impl Into<PathBuf>, account_id: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let account = Account::load(&path)?;
        log::debug!(
            "Opened simulated account {} with {} object(s)",
            path.display(),
            account.objects.len()
        );
        Ok(Self {
            path,
            account_id: account_id.into(),
            account: Mutex::new(account),
        })
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    fn lock(&self) -> MutexGuard<'_, Account> {
        match self.account.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run a mutation on a copy and keep it only if it saved
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut Account) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut account = self.lock();
        let mut next = account.clone();
        let value = mutate(&mut next)?;
        next.save(&self.path)
            .map_err(|e| ProviderError::Other(format!("{e:#}")))?;
        *account = next;
        Ok(value)
    }
}

impl Provider for SimulatedIam {
    fn create(&self, kind: ResourceKind, attributes: &Attributes) -> Result<Created, ProviderError> {
        log::debug!("iam: create {kind}");
        self.commit(|account| account.create(&self.account_id, kind, attributes))
    }

    fn read(&self, kind: ResourceKind, remote_id: &str) -> Result<Attributes, ProviderError> {
        let account = self.lock();
        let object = account.get(kind, remote_id)?;
        let mut attributes = object.attributes.clone();
        attributes.extend(object.outputs.clone());
        Ok(attributes)
    }

    fn update(
        &self,
        kind: ResourceKind,
        remote_id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        log::debug!("iam: update {kind}");
        self.commit(|account| account.update(&self.account_id, kind, remote_id, attributes))
    }

    fn delete(&self, kind: ResourceKind, remote_id: &str) -> Result<(), ProviderError> {
        log::debug!("iam: delete {kind}");
        self.commit(|account| account.delete(kind, remote_id))
    }
}

// ============================================================================
// Tests
// ============================================================================
