//! State store - the last-known mapping from declaration to remote object

use crate::error::Result;
use crate::output::MASK;
use crate::types::{Attributes, Literal, ResourceId, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// What the executor recorded after the last successful provider call
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResourceState {
    pub id: ResourceId,
    /// Identifier assigned by the provider
    pub remote_id: String,
    /// Declared inputs as last applied, references substituted
    #[serde(default)]
    pub inputs: Attributes,
    /// Attributes returned by the provider
    #[serde(default)]
    pub outputs: Attributes,
    /// Identities this resource referenced when it was applied
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteResourceState {
    pub fn new(
        id: ResourceId,
        remote_id: impl Into<String>,
        inputs: Attributes,
        outputs: Attributes,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_id: remote_id.into(),
            inputs,
            outputs,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<ResourceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.id.kind
    }

    /// Value of an attribute, declared inputs taking precedence
    pub fn value(&self, attribute: &str) -> Option<&Literal> {
        self.inputs
            .get(attribute)
            .or_else(|| self.outputs.get(attribute))
    }

    /// Whether an attribute must never be shown unmasked
    pub fn is_sensitive(&self, attribute: &str) -> bool {
        self.kind().schema().is_sensitive(attribute)
    }

    /// Remote identifier, masked when the kind treats it as a secret
    pub fn display_remote_id(&self) -> &str {
        self.kind().schema().display_remote_id(&self.remote_id)
    }

    /// Record a successful in-place update
    pub fn updated(mut self, inputs: Attributes, outputs: Attributes) -> Self {
        self.inputs = inputs;
        self.outputs = outputs;
        self.updated_at = Utc::now();
        self
    }
}

struct MaskedAttributes<'a> {
    attributes: &'a Attributes,
    kind: ResourceKind,
}

impl fmt::Debug for MaskedAttributes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schema = self.kind.schema();
        f.debug_map()
            .entries(self.attributes.iter().map(|(k, v)| {
                let shown: &dyn fmt::Debug = if schema.is_sensitive(k) { &MASK } else { v };
                (k, shown)
            }))
            .finish()
    }
}

impl fmt::Debug for RemoteResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteResourceState")
            .field("id", &self.id)
            .field("remote_id", &self.display_remote_id())
            .field(
                "inputs",
                &MaskedAttributes {
                    attributes: &self.inputs,
                    kind: self.kind(),
                },
            )
            .field(
                "outputs",
                &MaskedAttributes {
                    attributes: &self.outputs,
                    kind: self.kind(),
                },
            )
            .field("dependencies", &self.dependencies)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Persistent record of applied resources
///
/// Each identity is written by exactly one executor task at a time, but
/// tasks for independent nodes run concurrently, so implementations must
/// be safe to share across threads. [`StateStore::update`] is the one
/// primitive; it must apply its closure atomically for that identity.
pub trait StateStore: Send + Sync {
    /// Look up an entry
    fn get(&self, id: &ResourceId) -> Result<Option<RemoteResourceState>>;

    /// Every entry, ordered by identity
    fn list(&self) -> Result<Vec<RemoteResourceState>>;

    /// Atomic read-modify-write of one entry; returning `None` removes it.
    ///
    /// Returns the entry as it is after the write.
    fn update(
        &self,
        id: &ResourceId,
        apply: &mut dyn FnMut(Option<RemoteResourceState>) -> Option<RemoteResourceState>,
    ) -> Result<Option<RemoteResourceState>>;

    /// Insert or replace an entry
    fn put(&self, entry: RemoteResourceState) -> Result<()> {
        let id = entry.id.clone();
        let mut entry = Some(entry);
        self.update(&id, &mut |_| entry.take())?;
        Ok(())
    }

    /// Remove an entry, returning what was there
    fn delete(&self, id: &ResourceId) -> Result<Option<RemoteResourceState>> {
        let mut previous = None;
        self.update(id, &mut |current| {
            previous = current;
            None
        })?;
        Ok(previous)
    }

    fn contains(&self, id: &ResourceId) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }
}

/// In-memory state store, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<ResourceId, RemoteResourceState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing entries
    pub fn with_entries(entries: impl IntoIterator<Item = RemoteResourceState>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ResourceId, RemoteResourceState>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, id: &ResourceId) -> Result<Option<RemoteResourceState>> {
        Ok(self.lock().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<RemoteResourceState>> {
        Ok(self.lock().values().cloned().collect())
    }

    fn update(
        &self,
        id: &ResourceId,
        apply: &mut dyn FnMut(Option<RemoteResourceState>) -> Option<RemoteResourceState>,
    ) -> Result<Option<RemoteResourceState>> {
        let mut entries = self.lock();
        let current = entries.remove(id);
        let next = apply(current);
        if let Some(entry) = &next {
            entries.insert(id.clone(), entry.clone());
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key() -> RemoteResourceState {
        let mut outputs = Attributes::new();
        outputs.insert("id".into(), "AKIAEXAMPLE".into());
        outputs.insert("secret".into(), "wJalrXUtnFEMI".into());
        outputs.insert("key_fingerprint".into(), "ab12".into());
        RemoteResourceState::new(
            ResourceId::new(ResourceKind::AccessKey, "lb"),
            "AKIAEXAMPLE",
            Attributes::new(),
            outputs,
        )
    }

    #[test]
    fn test_debug_masks_sensitive_values() {
        let text = format!("{:?}", key());
        assert!(!text.contains("wJalrXUtnFEMI"));
        assert!(!text.contains("AKIAEXAMPLE"));
        assert!(text.contains("ab12"));
        assert!(text.contains(MASK));
    }

    #[test]
    fn test_get_put_delete() {
        let store = MemoryStateStore::new();
        let id = key().id;
        assert!(store.get(&id).unwrap().is_none());

        store.put(key()).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().remote_id, "AKIAEXAMPLE");
        assert!(store.contains(&id).unwrap());

        let removed = store.delete(&id).unwrap();
        assert!(removed.is_some());
        assert!(store.is_empty());
        assert!(store.delete(&id).unwrap().is_none());
    }

    #[test]
    fn test_value_prefers_inputs() {
        let mut inputs = Attributes::new();
        inputs.insert("name".into(), "declared".into());
        let mut outputs = Attributes::new();
        outputs.insert("name".into(), "echoed".into());
        outputs.insert("arn".into(), "arn:aws:iam::1:user/declared".into());
        let entry = RemoteResourceState::new(
            ResourceId::new(ResourceKind::User, "a"),
            "declared",
            inputs,
            outputs,
        );
        assert_eq!(entry.value("name").and_then(Literal::as_str), Some("declared"));
        assert!(entry.value("arn").is_some());
        assert!(entry.value("path").is_none());
    }

    #[test]
    fn test_update_is_atomic_per_identity() {
        let store = Arc::new(MemoryStateStore::new());
        let id = ResourceId::new(ResourceKind::User, "counter");
        store
            .put(RemoteResourceState::new(
                id.clone(),
                "counter",
                Attributes::new(),
                Attributes::from([("n".to_string(), Literal::Int(0))]),
            ))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .update(&id, &mut |entry| {
                                entry.map(|mut e| {
                                    let n = e.outputs["n"].as_int().unwrap_or(0);
                                    e.outputs.insert("n".into(), Literal::Int(n + 1));
                                    e
                                })
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entry = store.get(&id).unwrap().unwrap();
        assert_eq!(entry.outputs["n"], Literal::Int(800));
    }

    #[test]
    fn test_serializes_to_toml() {
        let text = toml::to_string(&key()).unwrap();
        let back: RemoteResourceState = toml::from_str(&text).unwrap();
        assert_eq!(back, key_with_times(&back));
    }

    fn key_with_times(other: &RemoteResourceState) -> RemoteResourceState {
        let mut entry = key();
        entry.created_at = other.created_at;
        entry.updated_at = other.updated_at;
        entry
    }
}
