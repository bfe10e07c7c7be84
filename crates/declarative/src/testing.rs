//! Recording in-memory provider for tests

use crate::context::{Created, Provider};
use crate::error::{Error, ProviderError, Result as StateResult};
use crate::state::{MemoryStateStore, RemoteResourceState, StateStore};
use crate::types::{Attributes, Literal, Operation, ResourceId, ResourceKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// One provider call as observed by [`FakeProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub kind: ResourceKind,
    /// `name`/`user`/`role` attribute of the object, whichever it has
    pub label: String,
}

/// Start/end markers for checking ordering under concurrency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    End(String),
}

#[derive(Default)]
struct Inner {
    next: u64,
    objects: BTreeMap<(ResourceKind, String), Attributes>,
    calls: Vec<Call>,
    events: Vec<Event>,
    in_flight: usize,
    max_in_flight: usize,
    /// (operation, kind, optional label) -> error; `usize` counts remaining hits
    failures: Vec<(Operation, ResourceKind, Option<String>, ProviderError, usize)>,
}

/// Fake IAM-like provider that records every call
#[derive(Default)]
pub struct FakeProvider {
    inner: Mutex<Inner>,
    delay: Option<Duration>,
    /// Per-label delays, overriding `delay`
    slow: Vec<(String, Duration)>,
}

fn label_of(kind: ResourceKind, attributes: &Attributes) -> String {
    let key = match kind {
        ResourceKind::User | ResourceKind::Policy | ResourceKind::Role => "name",
        ResourceKind::RolePolicyAttachment => "role",
        _ => "user",
    };
    let base = attributes
        .get(key)
        .and_then(Literal::as_str)
        .unwrap_or("?")
        .to_string();
    match kind {
        ResourceKind::UserPolicyAttachment | ResourceKind::RolePolicyAttachment => {
            let policy = attributes
                .get("policy_arn")
                .and_then(Literal::as_str)
                .unwrap_or("?");
            format!("{base}+{policy}")
        }
        _ => base,
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep this long inside calls for `label` only
    pub fn with_slow(mut self, label: &str, delay: Duration) -> Self {
        self.slow.push((label.to_string(), delay));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail `operation` on `kind` (optionally only for one label) every time
    pub fn fail(&self, operation: Operation, kind: ResourceKind, label: Option<&str>, error: ProviderError) {
        self.fail_times(operation, kind, label, error, usize::MAX);
    }

    /// Fail the next `times` matching calls
    pub fn fail_times(
        &self,
        operation: Operation,
        kind: ResourceKind,
        label: Option<&str>,
        error: ProviderError,
        times: usize,
    ) {
        self.lock()
            .failures
            .push((operation, kind, label.map(str::to_string), error, times));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Number of calls of `operation`
    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Number of remote objects that currently exist
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn clear_calls(&self) {
        let mut inner = self.lock();
        inner.calls.clear();
        inner.events.clear();
    }

    /// Labels of calls of `operation`, in call order
    pub fn labels(&self, operation: Operation) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.label.clone())
            .collect()
    }

    fn call<T>(
        &self,
        operation: Operation,
        kind: ResourceKind,
        label: String,
        body: impl FnOnce(&mut Inner) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        {
            let mut inner = self.lock();
            inner.calls.push(Call {
                operation,
                kind,
                label: label.clone(),
            });
            inner.events.push(Event::Start(label.clone()));
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }

        let delay = self
            .slow
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, d)| *d)
            .or(self.delay);
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut inner = self.lock();
        inner.in_flight -= 1;
        inner.events.push(Event::End(label.clone()));

        let injected = inner.failures.iter_mut().find(|(op, k, l, _, times)| {
            *op == operation && *k == kind && *times > 0 && l.as_ref().is_none_or(|l| *l == label)
        });
        if let Some((_, _, _, error, times)) = injected {
            *times = times.saturating_sub(1);
            return Err(error.clone());
        }

        body(&mut inner)
    }

    fn label_for(&self, kind: ResourceKind, remote_id: &str) -> String {
        self.lock()
            .objects
            .get(&(kind, remote_id.to_string()))
            .map_or_else(|| remote_id.to_string(), |attrs| label_of(kind, attrs))
    }
}

fn computed(kind: ResourceKind, attributes: &Attributes, serial: u64) -> (String, Attributes) {
    let mut out = attributes.clone();
    let name = label_of(kind, attributes);
    let remote_id = match kind {
        ResourceKind::User => {
            out.insert("arn".into(), format!("arn:aws:iam::123456789012:user/{name}").into());
            out.insert("unique_id".into(), format!("AIDA{serial:08}").into());
            name
        }
        ResourceKind::Role => {
            out.insert("arn".into(), format!("arn:aws:iam::123456789012:role/{name}").into());
            out.insert("unique_id".into(), format!("AROA{serial:08}").into());
            name
        }
        ResourceKind::Policy => {
            let arn = format!("arn:aws:iam::123456789012:policy/{name}");
            out.insert("arn".into(), arn.clone().into());
            out.insert("policy_id".into(), format!("ANPA{serial:08}").into());
            arn
        }
        ResourceKind::AccessKey => {
            let id = format!("AKIA{serial:016}");
            out.insert("id".into(), id.clone().into());
            out.insert("secret".into(), format!("secret-{serial}-wJalrXUtnFEMI").into());
            out.insert("key_fingerprint".into(), format!("fp{serial}").into());
            id
        }
        ResourceKind::LoginProfile => {
            out.insert("encrypted_password".into(), format!("enc-{serial}-hunter2").into());
            out.insert("key_fingerprint".into(), format!("fp{serial}").into());
            name
        }
        ResourceKind::UserPolicyAttachment | ResourceKind::RolePolicyAttachment => name,
    };
    (remote_id, out)
}

impl Provider for FakeProvider {
    fn create(&self, kind: ResourceKind, attributes: &Attributes) -> Result<Created, ProviderError> {
        self.call(Operation::Create, kind, label_of(kind, attributes), |inner| {
            inner.next += 1;
            let (remote_id, attributes) = computed(kind, attributes, inner.next);
            let key = (kind, remote_id.clone());
            if inner.objects.contains_key(&key) {
                return Err(ProviderError::Conflict(format!("{kind} already exists")));
            }
            inner.objects.insert(key, attributes.clone());
            Ok(Created {
                remote_id,
                attributes,
            })
        })
    }

    fn read(&self, kind: ResourceKind, remote_id: &str) -> Result<Attributes, ProviderError> {
        let label = self.label_for(kind, remote_id);
        self.call(Operation::Read, kind, label, |inner| {
            inner
                .objects
                .get(&(kind, remote_id.to_string()))
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(format!("{kind} does not exist")))
        })
    }

    fn update(
        &self,
        kind: ResourceKind,
        remote_id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let label = self.label_for(kind, remote_id);
        self.call(Operation::Update, kind, label, |inner| {
            let current = inner
                .objects
                .get_mut(&(kind, remote_id.to_string()))
                .ok_or_else(|| ProviderError::NotFound(format!("{kind} does not exist")))?;
            for (key, value) in attributes {
                current.insert(key.clone(), value.clone());
            }
            Ok(current.clone())
        })
    }

    fn delete(&self, kind: ResourceKind, remote_id: &str) -> Result<(), ProviderError> {
        let label = self.label_for(kind, remote_id);
        self.call(Operation::Delete, kind, label, |inner| {
            inner
                .objects
                .remove(&(kind, remote_id.to_string()))
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound(format!("{kind} does not exist")))
        })
    }
}

/// Map of label -> position in the call log, for ordering assertions
pub fn positions(calls: &[Call]) -> HashMap<String, usize> {
    calls
        .iter()
        .enumerate()
        .map(|(i, c)| (c.label.clone(), i))
        .collect()
}

/// Memory store whose writes to one identity fail a set number of times
pub struct FlakyStateStore {
    inner: MemoryStateStore,
    target: ResourceId,
    failures: AtomicUsize,
}

impl FlakyStateStore {
    pub fn failing(target: ResourceId, times: usize) -> Self {
        Self {
            inner: MemoryStateStore::new(),
            target,
            failures: AtomicUsize::new(times),
        }
    }
}

impl StateStore for FlakyStateStore {
    fn get(&self, id: &ResourceId) -> StateResult<Option<RemoteResourceState>> {
        self.inner.get(id)
    }

    fn list(&self) -> StateResult<Vec<RemoteResourceState>> {
        self.inner.list()
    }

    fn update(
        &self,
        id: &ResourceId,
        apply: &mut dyn FnMut(Option<RemoteResourceState>) -> Option<RemoteResourceState>,
    ) -> StateResult<Option<RemoteResourceState>> {
        let fail = *id == self.target
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(Error::StateStore("disk full".to_string()));
        }
        self.inner.update(id, apply)
    }
}
